//! Docker Swarm driver.
//!
//! One sandbox is a single-replica service; the swarm scheduler picks the
//! node. Service names are derived from the flag, so relaunching for the same
//! team collides with any leftover service, which is removed and replaced.

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{
    EndpointPortConfig, EndpointPortConfigProtocolEnum, EndpointPortConfigPublishModeEnum,
    EndpointSpec, Limit, Service, ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated,
    TaskSpec, TaskSpecContainerSpec, TaskSpecResources, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum,
};
use bollard::Docker;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use arena_core::config::ContainerProviderConfig;
use arena_core::types::{default_lifetime, Container, ContainerConfig, ContainerStatus, Endpoint};
use arena_core::ContainerManager;

use crate::backend::{
    cancellable, idempotent, record_create, record_destroy, sleep_or_cancel, BackendError,
};
use crate::docker::registry_credentials;
use crate::exposure::ExposurePolicy;
use crate::naming;

const BACKEND: &str = "swarm";

/// Create calls per launch when the service name keeps colliding.
pub const MAX_CREATE_ATTEMPTS: usize = 3;

/// Inspections per launch while waiting for the endpoint to be published.
pub const MAX_ENDPOINT_POLLS: usize = 3;

/// Delay between endpoint inspections.
pub const ENDPOINT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Swarm API seam
// =============================================================================

/// The subset of the Swarm API the driver needs.
#[async_trait]
pub trait SwarmApi: Send + Sync {
    /// Create a service; returns its id.
    async fn create_service(
        &self,
        spec: ServiceSpec,
        credentials: Option<DockerCredentials>,
    ) -> Result<String, BackendError>;

    async fn inspect_service(&self, name: &str) -> Result<Service, BackendError>;

    async fn delete_service(&self, name: &str) -> Result<(), BackendError>;
}

/// `SwarmApi` over a `bollard` client connected to a manager node.
pub struct BollardSwarm {
    docker: Docker,
}

impl BollardSwarm {
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl SwarmApi for BollardSwarm {
    async fn create_service(
        &self,
        spec: ServiceSpec,
        credentials: Option<DockerCredentials>,
    ) -> Result<String, BackendError> {
        let name = spec.name.clone().unwrap_or_default();
        let response = self.docker.create_service(spec, credentials).await?;
        Ok(response.id.unwrap_or(name))
    }

    async fn inspect_service(&self, name: &str) -> Result<Service, BackendError> {
        Ok(self.docker.inspect_service(name, None).await?)
    }

    async fn delete_service(&self, name: &str) -> Result<(), BackendError> {
        self.docker.delete_service(name).await?;
        Ok(())
    }
}

// =============================================================================
// Translation
// =============================================================================

/// CPU cap in nano CPUs (`cpu_count` is in tenths of a core).
pub fn nano_cpus(cpu_count: u32) -> i64 {
    i64::from(cpu_count) * 100_000_000
}

/// Build the service specification for a request.
pub fn service_spec(name: &str, config: &ContainerConfig) -> ServiceSpec {
    let labels: std::collections::HashMap<String, String> =
        naming::owner_labels(config).into_iter().collect();

    ServiceSpec {
        name: Some(name.to_string()),
        labels: Some(labels.clone()),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
            ..Default::default()
        }),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(config.image.clone()),
                env: Some(naming::sandbox_env_strings(config)),
                labels: Some(labels),
                ..Default::default()
            }),
            resources: Some(TaskSpecResources {
                limits: Some(Limit {
                    nano_cpus: Some(nano_cpus(config.cpu_count)),
                    memory_bytes: Some(config.memory_bytes()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            restart_policy: Some(TaskSpecRestartPolicy {
                condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
                ..Default::default()
            }),
            ..Default::default()
        }),
        endpoint_spec: Some(EndpointSpec {
            ports: Some(vec![EndpointPortConfig {
                protocol: Some(EndpointPortConfigProtocolEnum::TCP),
                target_port: Some(i64::from(config.exposed_port)),
                publish_mode: Some(EndpointPortConfigPublishModeEnum::INGRESS),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Published port for `target_port`, once the swarm has assigned one.
fn published_port(service: &Service, target_port: u16) -> Option<u16> {
    service
        .endpoint
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .filter(|p| p.target_port == Some(i64::from(target_port)))
        .find_map(|p| p.published_port)
        .and_then(|port| u16::try_from(port).ok())
}

/// First virtual IP of the service, without its prefix length.
fn virtual_ip(service: &Service) -> Option<String> {
    service
        .endpoint
        .as_ref()?
        .virtual_ips
        .as_ref()?
        .iter()
        .filter_map(|vip| vip.addr.as_deref())
        .map(|addr| addr.split('/').next().unwrap_or(addr).to_string())
        .find(|ip| !ip.is_empty())
}

// =============================================================================
// Driver
// =============================================================================

/// `ContainerManager` for a Docker Swarm cluster.
pub struct SwarmDriver {
    api: Arc<dyn SwarmApi>,
    exposure: ExposurePolicy,
    provider: ContainerProviderConfig,
}

impl SwarmDriver {
    pub fn new(api: Arc<dyn SwarmApi>, provider: ContainerProviderConfig) -> Self {
        Self {
            api,
            exposure: ExposurePolicy::from_config(&provider),
            provider,
        }
    }

    fn service_name(config: &ContainerConfig) -> String {
        let suffix = match &config.flag {
            Some(flag) => naming::seeded_suffix(flag),
            None => naming::random_suffix(),
        };
        naming::resource_name_or_fallback(&config.image, &suffix)
    }

    /// Create the service, replacing a conflicting one, in at most
    /// `MAX_CREATE_ATTEMPTS` create calls.
    async fn create_service(
        &self,
        name: &str,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> Result<String, BackendError> {
        let spec = service_spec(name, config);
        let credentials = registry_credentials(&self.provider, &config.image);

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            let result = cancellable(
                cancel,
                self.api.create_service(spec.clone(), credentials.clone()),
            )
            .await;

            match result {
                Err(BackendError::Conflict(body)) if attempt < MAX_CREATE_ATTEMPTS => {
                    tracing::warn!(
                        service = %name,
                        attempt,
                        body = %body,
                        "Service name in use, removing the stale service"
                    );
                    let removed = cancellable(cancel, self.api.delete_service(name)).await;
                    match idempotent(removed) {
                        Err(BackendError::Cancelled) => return Err(BackendError::Cancelled),
                        Err(e) => {
                            tracing::warn!(service = %name, error = %e, "Failed to remove stale service")
                        }
                        Ok(()) => {}
                    }
                }
                Err(BackendError::Conflict(body)) => {
                    return Err(BackendError::Conflict(format!(
                        "service name {} still in use after {} attempts: {}",
                        name, MAX_CREATE_ATTEMPTS, body
                    )))
                }
                other => return other,
            }
        }

        Err(BackendError::Conflict(format!(
            "service name {} still in use",
            name
        )))
    }

    /// Inspect the service until it reports a published port, at most
    /// `MAX_ENDPOINT_POLLS` times.
    async fn wait_for_endpoint(
        &self,
        id: &str,
        exposed_port: u16,
        cancel: &CancellationToken,
    ) -> Result<Service, BackendError> {
        for attempt in 1..=MAX_ENDPOINT_POLLS {
            match cancellable(cancel, self.api.inspect_service(id)).await {
                Ok(service) if published_port(&service, exposed_port).is_some() => {
                    return Ok(service)
                }
                Ok(_) => {
                    tracing::debug!(service = %id, attempt, "Service endpoint not assigned yet")
                }
                Err(BackendError::Cancelled) => return Err(BackendError::Cancelled),
                Err(e) => {
                    tracing::warn!(service = %id, attempt, error = %e, "Failed to inspect service")
                }
            }

            if attempt < MAX_ENDPOINT_POLLS && !sleep_or_cancel(cancel, ENDPOINT_POLL_INTERVAL).await {
                return Err(BackendError::Cancelled);
            }
        }

        Err(BackendError::Unreachable(format!(
            "service {} has no published endpoint after {} inspections",
            id, MAX_ENDPOINT_POLLS
        )))
    }

    fn build_record(
        &self,
        id: &str,
        service: &Service,
        config: &ContainerConfig,
    ) -> Option<Container> {
        let port = published_port(service, config.exposed_port)?;
        let exposure = self.exposure.resolve(Some(port))?;
        let internal = match virtual_ip(service) {
            Some(ip) => Endpoint::new(ip, config.exposed_port),
            None => Endpoint::new(self.provider.public_entry.clone(), port),
        };

        let mut container = Container::new(id, config.image.clone(), internal)
            .with_owner(config.team_id.clone(), config.challenge_id.clone());
        exposure.apply(&mut container);
        container.status = ContainerStatus::Running;
        container.expect_stop_at = Utc::now() + default_lifetime();
        Some(container)
    }

    async fn discard(&self, id: &str) {
        if let Err(e) = idempotent(self.api.delete_service(id).await) {
            tracing::warn!(service = %id, error = %e, "Failed to remove abandoned service");
        }
    }
}

#[async_trait]
impl ContainerManager for SwarmDriver {
    async fn create(
        &self,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> Option<Container> {
        if let Err(e) = config.validate() {
            tracing::warn!(image = %config.image, error = %e, "Rejected service request");
            record_create(BACKEND, "invalid");
            return None;
        }
        if config.privileged {
            tracing::warn!(image = %config.image, "Swarm services cannot run privileged, launching unprivileged");
        }

        let name = Self::service_name(config);

        let id = match self.create_service(&name, config, cancel).await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(
                    service = %name,
                    image = %config.image,
                    status = ?e.status(),
                    error = %e,
                    "Failed to create service"
                );
                if matches!(e, BackendError::Cancelled) {
                    self.discard(&name).await;
                }
                record_create(BACKEND, "failed");
                return None;
            }
        };

        let service = match self.wait_for_endpoint(&id, config.exposed_port, cancel).await {
            Ok(service) => service,
            Err(BackendError::Cancelled) => {
                tracing::warn!(service = %id, "Service creation cancelled, removing service");
                self.discard(&id).await;
                record_create(BACKEND, "cancelled");
                return None;
            }
            Err(e) => {
                // The service object still exists; the caller or the reaper owns its cleanup.
                tracing::warn!(
                    service = %id,
                    name = %name,
                    error = %e,
                    "Service left without a published endpoint"
                );
                record_create(BACKEND, "failed");
                return None;
            }
        };

        match self.build_record(&id, &service, config) {
            Some(container) => {
                tracing::info!(
                    service = %id,
                    image = %config.image,
                    internal = %container.internal,
                    public = ?container.public,
                    "Service created"
                );
                record_create(BACKEND, "created");
                Some(container)
            }
            None => {
                tracing::error!(service = %id, "Service endpoint could not be resolved");
                self.discard(&id).await;
                record_create(BACKEND, "failed");
                None
            }
        }
    }

    async fn destroy(&self, container: &mut Container, cancel: &CancellationToken) {
        let result = cancellable(cancel, self.api.delete_service(&container.id)).await;
        match idempotent(result) {
            Ok(()) => {
                tracing::info!(service = %container.id, "Service destroyed");
                container.mark_destroyed();
                record_destroy(BACKEND, "destroyed");
            }
            Err(e) => {
                tracing::error!(
                    service = %container.id,
                    status = ?e.status(),
                    error = %e,
                    "Failed to destroy service"
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
    fn test_nano_cpu_mapping() {
        assert_eq!(nano_cpus(1), 100_000_000);
        assert_eq!(nano_cpus(10), 1_000_000_000);
        assert_eq!(nano_cpus(1024), 102_400_000_000);
    }

    #[test]
    fn test_service_spec_shape() {
        let config = ContainerConfig::new("ghcr.io/org/web:1", 8080)
            .with_limits(5, 128, 256)
            .with_owner("t1", "u1", "c1");
        let spec = service_spec("web-0123456789abcdef", &config);

        assert_eq!(spec.name.as_deref(), Some("web-0123456789abcdef"));
        let replicas = spec.mode.unwrap().replicated.unwrap().replicas;
        assert_eq!(replicas, Some(1));

        let task = spec.task_template.unwrap();
        assert_eq!(
            task.restart_policy.unwrap().condition,
            Some(TaskSpecRestartPolicyConditionEnum::NONE)
        );
        let limits = task.resources.unwrap().limits.unwrap();
        assert_eq!(limits.nano_cpus, Some(500_000_000));
        assert_eq!(limits.memory_bytes, Some(128 * 1024 * 1024));

        let ports = spec.endpoint_spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].target_port, Some(8080));
    }

    #[test]
    fn test_service_name_follows_flag() {
        let config = ContainerConfig::new("web:1", 80).with_flag("flag{same}");
        assert_eq!(
            SwarmDriver::service_name(&config),
            SwarmDriver::service_name(&config)
        );
        let other = ContainerConfig::new("web:1", 80);
        assert_ne!(
            SwarmDriver::service_name(&other),
            SwarmDriver::service_name(&other)
        );
    }
}
