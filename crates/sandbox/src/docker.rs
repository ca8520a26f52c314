//! Single-host Docker engine driver.
//!
//! One sandbox is one container. Every port of the container is published on
//! the host and the bound host port becomes the public port when the
//! platform exposes ports directly.

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use arena_core::config::ContainerProviderConfig;
use arena_core::types::{Container, ContainerConfig, ContainerStatus, Endpoint};
use arena_core::{ContainerManager, Error, Result};

use crate::backend::{cancellable, idempotent, record_create, record_destroy, BackendError};
use crate::exposure::ExposurePolicy;
use crate::naming;

const BACKEND: &str = "docker";

/// CFS period used to turn the CPU percentage into a quota.
const CPU_PERIOD_US: i64 = 100_000;

// =============================================================================
// Engine API seam
// =============================================================================

/// The subset of the Docker engine API the driver needs.
#[async_trait]
pub trait DockerApi: Send + Sync {
    /// Create (but do not start) a container; returns its id.
    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> std::result::Result<String, BackendError>;

    async fn start_container(&self, id: &str) -> std::result::Result<(), BackendError>;

    async fn inspect_container(
        &self,
        id: &str,
    ) -> std::result::Result<ContainerInspectResponse, BackendError>;

    /// Pull an image, streaming progress to the logs.
    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> std::result::Result<(), BackendError>;

    /// Force-remove a container (stopping it first if needed).
    async fn remove_container(&self, id: &str) -> std::result::Result<(), BackendError>;
}

/// `DockerApi` over a `bollard` client.
pub struct BollardDocker {
    docker: Docker,
}

/// Where the engine listens, parsed from the configured URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineAddress {
    /// `DOCKER_HOST` or the platform socket.
    Local,
    Http(String),
    Socket(String),
}

impl EngineAddress {
    /// Supported formats:
    /// - Unix socket: `unix:///var/run/docker.sock` or `/var/run/docker.sock`
    /// - HTTP: `http://localhost:2375` or `tcp://localhost:2375`
    ///
    /// TLS endpoints are refused: the client is built without TLS support.
    pub fn parse(uri: Option<&str>) -> Result<Self> {
        let Some(address) = uri.map(str::trim).filter(|a| !a.is_empty()) else {
            return Ok(Self::Local);
        };
        if let Some(host) = address
            .strip_prefix("http://")
            .or_else(|| address.strip_prefix("tcp://"))
        {
            return Ok(Self::Http(format!("http://{}", host)));
        }
        if address.starts_with("https://") {
            return Err(Error::config(format!(
                "Docker endpoint {} needs TLS, which is not supported; \
                 expose the engine over a unix socket or plain http",
                address
            )));
        }
        if address.contains("://") && !address.starts_with("unix://") {
            return Err(Error::config(format!(
                "Unsupported Docker endpoint scheme: {}",
                address
            )));
        }
        Ok(Self::Socket(address.trim_start_matches("unix://").to_string()))
    }
}

impl BollardDocker {
    /// Connect to the engine at `uri`, or to the local defaults when unset.
    pub fn connect(uri: Option<&str>) -> Result<Self> {
        let docker = match EngineAddress::parse(uri)? {
            EngineAddress::Local => Docker::connect_with_local_defaults(),
            EngineAddress::Http(url) => {
                Docker::connect_with_http(&url, 120, bollard::API_DEFAULT_VERSION)
            }
            EngineAddress::Socket(path) => {
                Docker::connect_with_socket(&path, 120, bollard::API_DEFAULT_VERSION)
            }
        }
        .map_err(|e| {
            Error::backend(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;

        Ok(Self { docker })
    }

    /// Create from an existing bollard client.
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// The underlying client, shared with the swarm driver.
    pub fn client(&self) -> &Docker {
        &self.docker
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| Error::backend(format!("Docker daemon not reachable: {}", e)))
    }
}

#[async_trait]
impl DockerApi for BollardDocker {
    async fn create_container(
        &self,
        name: &str,
        config: Config<String>,
    ) -> std::result::Result<String, BackendError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let response = self.docker.create_container(Some(options), config).await?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> std::result::Result<(), BackendError> {
        self.docker.start_container::<String>(id, None).await?;
        Ok(())
    }

    async fn inspect_container(
        &self,
        id: &str,
    ) -> std::result::Result<ContainerInspectResponse, BackendError> {
        Ok(self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?)
    }

    async fn pull_image(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
    ) -> std::result::Result<(), BackendError> {
        let options = CreateImageOptions {
            from_image: pull_reference(image),
            ..Default::default()
        };

        let start = Instant::now();
        tracing::info!(image = %image, "Pulling image");

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(progress) = stream.next().await {
            let info = progress?;
            if let Some(status) = info.status {
                tracing::debug!(image = %image, status = %status, "Pull progress");
            }
        }

        tracing::info!(
            image = %image,
            duration_ms = start.elapsed().as_millis() as u64,
            "Image pull completed"
        );
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> std::result::Result<(), BackendError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}

/// Engine credentials for `image` when a configured registry serves it.
pub(crate) fn registry_credentials(
    provider: &ContainerProviderConfig,
    image: &str,
) -> Option<DockerCredentials> {
    provider.registry_for(image).map(|registry| DockerCredentials {
        username: registry.username.clone(),
        password: registry
            .password
            .as_ref()
            .map(|p| p.expose_secret().clone()),
        serveraddress: Some(registry.server_address.clone()),
        ..Default::default()
    })
}

/// Pin an untagged reference to `latest`; the engine would pull every tag otherwise.
fn pull_reference(image: &str) -> String {
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') || last.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

// =============================================================================
// Translation
// =============================================================================

/// CPU cap as a percentage of one core (`cpu_count` is in tenths of a core).
pub fn cpu_percent(cpu_count: u32) -> i64 {
    i64::from(cpu_count) * 10
}

/// Build the engine's container configuration for a request.
pub fn container_spec(config: &ContainerConfig) -> Config<String> {
    let percent = cpu_percent(config.cpu_count);

    let host_config = HostConfig {
        publish_all_ports: Some(true),
        cpu_percent: Some(percent),
        // Linux engines ignore cpu_percent; enforce the same share through CFS.
        cpu_period: Some(CPU_PERIOD_US),
        cpu_quota: Some(CPU_PERIOD_US * percent / 100),
        memory: Some(config.memory_bytes()),
        privileged: Some(config.privileged),
        ..Default::default()
    };

    Config {
        image: Some(config.image.clone()),
        env: Some(naming::sandbox_env_strings(config)),
        labels: Some(naming::owner_labels(config).into_iter().collect()),
        exposed_ports: Some(HashMap::from([(
            format!("{}/tcp", config.exposed_port),
            HashMap::new(),
        )])),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn container_ip(info: &ContainerInspectResponse) -> Option<String> {
    info.network_settings
        .as_ref()?
        .networks
        .as_ref()?
        .values()
        .filter_map(|endpoint| endpoint.ip_address.clone())
        .find(|ip| !ip.is_empty())
}

fn published_port(info: &ContainerInspectResponse, exposed_port: u16) -> Option<u16> {
    info.network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&format!("{}/tcp", exposed_port))?
        .as_ref()?
        .iter()
        .filter_map(|binding| binding.host_port.as_deref())
        .find_map(|port| port.parse().ok())
}

// =============================================================================
// Driver
// =============================================================================

/// `ContainerManager` for a single Docker engine.
pub struct DockerDriver {
    api: Arc<dyn DockerApi>,
    exposure: ExposurePolicy,
    provider: ContainerProviderConfig,
}

impl DockerDriver {
    pub fn new(api: Arc<dyn DockerApi>, provider: ContainerProviderConfig) -> Self {
        Self {
            api,
            exposure: ExposurePolicy::from_config(&provider),
            provider,
        }
    }

    /// Create the container, pulling the image once if the engine lacks it.
    async fn create_with_pull(
        &self,
        name: &str,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, BackendError> {
        let spec = container_spec(config);
        match cancellable(cancel, self.api.create_container(name, spec.clone())).await {
            Err(BackendError::ImageNotFound(_)) => {
                tracing::info!(image = %config.image, "Image not present on engine, pulling");
                let credentials = registry_credentials(&self.provider, &config.image);
                cancellable(cancel, self.api.pull_image(&config.image, credentials)).await?;
                cancellable(cancel, self.api.create_container(name, spec)).await
            }
            other => other,
        }
    }

    /// Start an existing container and build its record.
    async fn start(
        &self,
        id: &str,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> std::result::Result<Container, BackendError> {
        cancellable(cancel, self.api.start_container(id)).await?;
        let info = cancellable(cancel, self.api.inspect_container(id)).await?;

        let ip = container_ip(&info)
            .ok_or_else(|| BackendError::Unreachable(format!("container {} has no IP", id)))?;
        let exposure = self
            .exposure
            .resolve(published_port(&info, config.exposed_port))
            .ok_or_else(|| {
                BackendError::Unreachable(format!(
                    "container {} published no host port for {}/tcp",
                    id, config.exposed_port
                ))
            })?;

        let internal = Endpoint::new(ip, config.exposed_port);
        let mut container = Container::new(id, config.image.clone(), internal)
            .with_owner(config.team_id.clone(), config.challenge_id.clone());
        exposure.apply(&mut container);
        container.status = ContainerStatus::Running;
        Ok(container)
    }

    /// Best-effort removal of a container that will not be handed out.
    async fn discard(&self, id: &str) {
        if let Err(e) = idempotent(self.api.remove_container(id).await) {
            tracing::warn!(container_id = %id, error = %e, "Failed to remove abandoned container");
        }
    }
}

#[async_trait]
impl ContainerManager for DockerDriver {
    async fn create(
        &self,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> Option<Container> {
        if let Err(e) = config.validate() {
            tracing::warn!(image = %config.image, error = %e, "Rejected container request");
            record_create(BACKEND, "invalid");
            return None;
        }

        let name = naming::resource_name_or_fallback(&config.image, &naming::random_suffix());

        let id = match self.create_with_pull(&name, config, cancel).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    name = %name,
                    image = %config.image,
                    status = ?e.status(),
                    error = %e,
                    "Failed to create container"
                );
                if matches!(e, BackendError::Cancelled) {
                    // The request may have reached the engine before cancellation.
                    self.discard(&name).await;
                }
                record_create(BACKEND, "failed");
                return None;
            }
        };

        match self.start(&id, config, cancel).await {
            Ok(container) => {
                tracing::info!(
                    container_id = %container.id,
                    image = %config.image,
                    internal = %container.internal,
                    public = ?container.public,
                    "Container created and started"
                );
                record_create(BACKEND, "created");
                Some(container)
            }
            Err(e) => {
                tracing::error!(
                    container_id = %id,
                    image = %config.image,
                    status = ?e.status(),
                    error = %e,
                    "Failed to start container"
                );
                self.discard(&id).await;
                record_create(BACKEND, "failed");
                None
            }
        }
    }

    async fn destroy(&self, container: &mut Container, cancel: &CancellationToken) {
        let result = cancellable(cancel, self.api.remove_container(&container.id)).await;
        match idempotent(result) {
            Ok(()) => {
                tracing::info!(container_id = %container.id, "Container destroyed");
                container.mark_destroyed();
                record_destroy(BACKEND, "destroyed");
            }
            Err(e) => {
                tracing::error!(
                    container_id = %container.id,
                    status = ?e.status(),
                    error = %e,
                    "Failed to destroy container"
                );
                record_destroy(BACKEND, "failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_address_parsing() {
        assert_eq!(EngineAddress::parse(None).unwrap(), EngineAddress::Local);
        assert_eq!(EngineAddress::parse(Some("")).unwrap(), EngineAddress::Local);
        assert_eq!(
            EngineAddress::parse(Some("tcp://10.0.0.1:2375")).unwrap(),
            EngineAddress::Http("http://10.0.0.1:2375".into())
        );
        assert_eq!(
            EngineAddress::parse(Some("unix:///var/run/docker.sock")).unwrap(),
            EngineAddress::Socket("/var/run/docker.sock".into())
        );
        assert_eq!(
            EngineAddress::parse(Some("/run/user/1000/docker.sock")).unwrap(),
            EngineAddress::Socket("/run/user/1000/docker.sock".into())
        );
    }

    #[test]
    fn test_tls_endpoint_is_a_config_error() {
        let err = EngineAddress::parse(Some("https://docker.internal:2376")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = EngineAddress::parse(Some("ssh://docker.internal")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_cpu_percent_mapping() {
        assert_eq!(cpu_percent(1), 10);
        assert_eq!(cpu_percent(10), 100);
        assert_eq!(cpu_percent(1024), 10240);
    }

    #[test]
    fn test_container_spec_limits() {
        let config = ContainerConfig::new("echo:latest", 7)
            .with_limits(10, 64, 256)
            .privileged(true)
            .with_owner("t1", "u1", "c1");
        let spec = container_spec(&config);
        let host = spec.host_config.unwrap();

        assert_eq!(host.cpu_percent, Some(100));
        assert_eq!(host.cpu_quota, Some(100_000));
        assert_eq!(host.memory, Some(64 * 1024 * 1024));
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.publish_all_ports, Some(true));
        assert!(spec.exposed_ports.unwrap().contains_key("7/tcp"));

        let labels = spec.labels.unwrap();
        assert_eq!(labels.get(crate::labels::TEAM_ID).map(String::as_str), Some("t1"));
        assert_eq!(labels.get(crate::labels::USER_ID).map(String::as_str), Some("u1"));
    }

    #[test]
    fn test_pull_reference() {
        assert_eq!(pull_reference("echo"), "echo:latest");
        assert_eq!(pull_reference("echo:1"), "echo:1");
        assert_eq!(pull_reference("registry.local:5000/echo"), "registry.local:5000/echo:latest");
        assert_eq!(pull_reference("echo@sha256:ab"), "echo@sha256:ab");
    }
}
