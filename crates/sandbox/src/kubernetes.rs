//! Kubernetes driver.
//!
//! One sandbox is a Pod plus a Service selecting it by resource name. The Pod
//! is created first; if the Service cannot be created the Pod is deleted
//! again, so a failed launch never leaves compute behind.

use async_trait::async_trait;
use base64::Engine as _;
use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use secrecy::ExposeSecret;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use arena_core::config::{ContainerProviderConfig, KubernetesConfig, RegistryConfig};
use arena_core::types::{Container, ContainerConfig, ContainerStatus, Endpoint};
use arena_core::{ContainerManager, Error, Result};

use crate::backend::{cancellable, idempotent, record_create, record_destroy, BackendError};
use crate::exposure::ExposurePolicy;
use crate::{labels, naming};

const BACKEND: &str = "kubernetes";

/// Scheduling floor requested for every pod.
const CPU_REQUEST: &str = "10m";
const MEMORY_REQUEST_MIB: u32 = 32;

// =============================================================================
// Kubernetes API seam
// =============================================================================

/// The subset of the Kubernetes API the driver needs, scoped to one namespace.
#[async_trait]
pub trait KubeApi: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> std::result::Result<Pod, BackendError>;

    async fn create_service(&self, service: &Service)
        -> std::result::Result<Service, BackendError>;

    async fn delete_pod(&self, name: &str) -> std::result::Result<(), BackendError>;

    async fn delete_service(&self, name: &str) -> std::result::Result<(), BackendError>;
}

/// `KubeApi` over a `kube` client.
pub struct KubeClient {
    client: kube::Client,
    namespace: String,
}

impl KubeClient {
    /// Connect using the kubeconfig at `config_path`, or the in-cluster /
    /// default kubeconfig when unset.
    pub async fn connect(config: &KubernetesConfig) -> Result<Self> {
        let kube_config = match &config.config_path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::config(format!("Failed to read kubeconfig {}: {}", path, e))
                })?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::config(format!("Invalid kubeconfig {}: {}", path, e)))?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| Error::config(format!("No Kubernetes configuration found: {}", e)))?,
        };

        let client = kube::Client::try_from(kube_config)
            .map_err(|e| Error::backend(format!("Failed to build Kubernetes client: {}", e)))?;

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Ensure the namespace exists and holds a pull secret per registry.
    pub async fn bootstrap(&self, registries: &[RegistryConfig]) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let existing = namespaces
            .get_opt(&self.namespace)
            .await
            .map_err(|e| Error::backend(format!("Failed to look up namespace: {}", e)))?;

        if existing.is_none() {
            let namespace: Namespace =
                serde_json::from_value(json!({ "metadata": { "name": self.namespace } }))?;
            match namespaces.create(&PostParams::default(), &namespace).await {
                Ok(_) => tracing::info!(namespace = %self.namespace, "Namespace created"),
                Err(e) => match BackendError::from(e) {
                    BackendError::Conflict(_) => {}
                    other => {
                        return Err(Error::backend(format!(
                            "Failed to create namespace {}: {}",
                            self.namespace, other
                        )))
                    }
                },
            }
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        for registry in registries {
            let secret = pull_secret(registry)?;
            let name = pull_secret_name(&registry.server_address);
            match secrets.create(&PostParams::default(), &secret).await {
                Ok(_) => tracing::info!(secret = %name, "Registry pull secret created"),
                Err(e) => match BackendError::from(e) {
                    BackendError::Conflict(_) => {
                        tracing::debug!(secret = %name, "Registry pull secret already present")
                    }
                    other => {
                        return Err(Error::backend(format!(
                            "Failed to create pull secret {}: {}",
                            name, other
                        )))
                    }
                },
            }
        }

        Ok(())
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn create_pod(&self, pod: &Pod) -> std::result::Result<Pod, BackendError> {
        Ok(self.pods().create(&PostParams::default(), pod).await?)
    }

    async fn create_service(
        &self,
        service: &Service,
    ) -> std::result::Result<Service, BackendError> {
        Ok(self.services().create(&PostParams::default(), service).await?)
    }

    async fn delete_pod(&self, name: &str) -> std::result::Result<(), BackendError> {
        self.pods().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> std::result::Result<(), BackendError> {
        self.services().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

// =============================================================================
// Translation
// =============================================================================

/// CPU limit quantity (`cpu_count` is in tenths of a core).
pub fn cpu_quantity(cpu_count: u32) -> String {
    format!("{}m", u64::from(cpu_count) * 100)
}

pub fn memory_quantity(mib: u32) -> String {
    format!("{}Mi", mib)
}

/// Name of the pull secret holding credentials for `server_address`.
pub fn pull_secret_name(server_address: &str) -> String {
    match naming::dns_label(server_address) {
        Some(label) => format!("registry-{}", label),
        None => "registry-default".to_string(),
    }
}

/// `kubernetes.io/dockerconfigjson` secret for one registry.
fn pull_secret(registry: &RegistryConfig) -> Result<Secret> {
    let username = registry.username.clone().unwrap_or_default();
    let password = registry
        .password
        .as_ref()
        .map(|p| p.expose_secret().clone())
        .unwrap_or_default();
    let auth = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", username, password));

    let docker_config = json!({
        "auths": {
            (registry.server_address.clone()): {
                "username": username,
                "password": password,
                "auth": auth,
            }
        }
    });

    Ok(serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": pull_secret_name(&registry.server_address) },
        "type": "kubernetes.io/dockerconfigjson",
        "stringData": { ".dockerconfigjson": docker_config.to_string() },
    }))?)
}

fn resource_labels(name: &str, config: &ContainerConfig) -> Map<String, Value> {
    let mut map: Map<String, Value> = naming::owner_labels(config)
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    map.insert(labels::RESOURCE_NAME.to_string(), Value::String(name.to_string()));
    map
}

/// Build the Pod for a request.
pub fn pod_spec(
    name: &str,
    config: &ContainerConfig,
    kube: &KubernetesConfig,
    pull_secret: Option<&str>,
) -> std::result::Result<Pod, serde_json::Error> {
    let env: Vec<Value> = naming::sandbox_env(config)
        .into_iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    // A request above the limit is rejected by the API server.
    let memory_request = MEMORY_REQUEST_MIB.min(config.memory_limit);

    let mut container = json!({
        "name": name,
        "image": config.image,
        "imagePullPolicy": "IfNotPresent",
        "env": env,
        "ports": [{ "containerPort": config.exposed_port, "protocol": "TCP" }],
        "resources": {
            "limits": {
                "cpu": cpu_quantity(config.cpu_count),
                "memory": memory_quantity(config.memory_limit),
                "ephemeral-storage": memory_quantity(config.storage_limit),
            },
            "requests": {
                "cpu": CPU_REQUEST,
                "memory": memory_quantity(memory_request),
            },
        },
    });
    if config.privileged {
        container["securityContext"] = json!({ "privileged": true });
    }

    let mut spec = json!({
        "containers": [container],
        "restartPolicy": "Never",
        "dnsPolicy": "None",
        "dnsConfig": { "nameservers": kube.dns },
        "automountServiceAccountToken": false,
        "enableServiceLinks": false,
    });
    if let Some(secret) = pull_secret {
        spec["imagePullSecrets"] = json!([{ "name": secret }]);
    }

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": name, "labels": resource_labels(name, config) },
        "spec": spec,
    }))
}

/// Build the Service fronting the pod named `name`.
pub fn service_spec(
    name: &str,
    config: &ContainerConfig,
    node_port: bool,
) -> std::result::Result<Service, serde_json::Error> {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": name, "labels": resource_labels(name, config) },
        "spec": {
            "type": if node_port { "NodePort" } else { "ClusterIP" },
            "selector": { (labels::RESOURCE_NAME): name },
            "ports": [{
                "port": config.exposed_port,
                "targetPort": config.exposed_port,
                "protocol": "TCP",
            }],
        },
    }))
}

fn cluster_ip(service: &Service) -> Option<String> {
    service
        .spec
        .as_ref()?
        .cluster_ip
        .clone()
        .filter(|ip| !ip.is_empty() && ip != "None")
}

fn node_port(service: &Service, port: u16) -> Option<u16> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .filter(|p| p.port == i32::from(port))
        .find_map(|p| p.node_port)
        .and_then(|p| u16::try_from(p).ok())
}

// =============================================================================
// Driver
// =============================================================================

/// `ContainerManager` for a Kubernetes namespace.
pub struct KubernetesDriver {
    api: Arc<dyn KubeApi>,
    exposure: ExposurePolicy,
    provider: ContainerProviderConfig,
}

impl KubernetesDriver {
    pub fn new(api: Arc<dyn KubeApi>, provider: ContainerProviderConfig) -> Self {
        Self {
            api,
            exposure: ExposurePolicy::from_config(&provider),
            provider,
        }
    }

    fn build_record(
        &self,
        name: &str,
        service: &Service,
        config: &ContainerConfig,
    ) -> std::result::Result<Container, BackendError> {
        let ip = cluster_ip(service).ok_or_else(|| {
            BackendError::Unreachable(format!("service {} has no cluster IP", name))
        })?;
        let exposure = self
            .exposure
            .resolve(node_port(service, config.exposed_port))
            .ok_or_else(|| {
                BackendError::Unreachable(format!("service {} was assigned no node port", name))
            })?;

        let mut container = Container::new(
            name,
            config.image.clone(),
            Endpoint::new(ip, config.exposed_port),
        )
        .with_owner(config.team_id.clone(), config.challenge_id.clone());
        exposure.apply(&mut container);
        container.status = ContainerStatus::Running;
        Ok(container)
    }

    /// Undo a partial launch; `service_created` also removes the Service.
    async fn compensate(&self, name: &str, service_created: bool) {
        if service_created {
            if let Err(e) = idempotent(self.api.delete_service(name).await) {
                tracing::warn!(service = %name, error = %e, "Failed to remove abandoned service");
            }
        }
        if let Err(e) = idempotent(self.api.delete_pod(name).await) {
            tracing::warn!(pod = %name, error = %e, "Failed to remove abandoned pod");
        }
    }
}

#[async_trait]
impl ContainerManager for KubernetesDriver {
    async fn create(
        &self,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> Option<Container> {
        if let Err(e) = config.validate() {
            tracing::warn!(image = %config.image, error = %e, "Rejected pod request");
            record_create(BACKEND, "invalid");
            return None;
        }

        let Some(name) = naming::resource_name(&config.image, &naming::random_suffix()) else {
            tracing::warn!(image = %config.image, "Image yields no valid resource name");
            record_create(BACKEND, "invalid");
            return None;
        };

        let secret = self
            .provider
            .registry_for(&config.image)
            .map(|registry| pull_secret_name(&registry.server_address));

        let objects = pod_spec(&name, config, &self.provider.kubernetes, secret.as_deref())
            .and_then(|pod| Ok((pod, service_spec(&name, config, self.exposure.expose_ports())?)));
        let (pod, service) = match objects {
            Ok(objects) => objects,
            Err(e) => {
                tracing::error!(pod = %name, error = %e, "Failed to build pod objects");
                record_create(BACKEND, "failed");
                return None;
            }
        };

        if let Err(e) = cancellable(cancel, self.api.create_pod(&pod)).await {
            tracing::error!(
                pod = %name,
                image = %config.image,
                status = ?e.status(),
                error = %e,
                "Failed to create pod"
            );
            if matches!(e, BackendError::Cancelled) {
                self.compensate(&name, false).await;
            }
            record_create(BACKEND, "failed");
            return None;
        }

        let service = match cancellable(cancel, self.api.create_service(&service)).await {
            Ok(service) => service,
            Err(e) => {
                tracing::error!(
                    service = %name,
                    status = ?e.status(),
                    error = %e,
                    "Failed to create service, removing pod"
                );
                self.compensate(&name, matches!(e, BackendError::Cancelled)).await;
                record_create(BACKEND, "failed");
                return None;
            }
        };

        match self.build_record(&name, &service, config) {
            Ok(container) => {
                tracing::info!(
                    pod = %name,
                    image = %config.image,
                    internal = %container.internal,
                    public = ?container.public,
                    "Pod and service created"
                );
                record_create(BACKEND, "created");
                Some(container)
            }
            Err(e) => {
                tracing::error!(pod = %name, error = %e, "Service is not reachable, removing pod");
                self.compensate(&name, true).await;
                record_create(BACKEND, "failed");
                None
            }
        }
    }

    async fn destroy(&self, container: &mut Container, cancel: &CancellationToken) {
        let service = idempotent(cancellable(cancel, self.api.delete_service(&container.id)).await);
        let result = match service {
            Ok(()) => idempotent(cancellable(cancel, self.api.delete_pod(&container.id)).await),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(pod = %container.id, "Pod and service destroyed");
                container.mark_destroyed();
                record_destroy(BACKEND, "destroyed");
            }
            Err(e) => {
                tracing::error!(
                    pod = %container.id,
                    status = ?e.status(),
                    error = %e,
                    "Failed to destroy pod"
                );
                record_destroy(BACKEND, "failed");
            }
        }
    }
}
