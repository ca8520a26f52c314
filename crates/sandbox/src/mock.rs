//! In-memory backends for exercising the drivers without a daemon.
//!
//! Each fake implements one `*Api` seam and reports errors in the same
//! shape the real client would after normalization, so the drivers take the
//! same code paths they take in production.

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::Config;
use bollard::models::{
    ContainerInspectResponse, EndpointPortConfig, EndpointSettings, NetworkSettings, PortBinding,
    Service as SwarmService, ServiceEndpoint, ServiceEndpointVirtualIps, ServiceSpec,
};
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::backend::BackendError;
use crate::docker::DockerApi;
use crate::kubernetes::KubeApi;
use crate::swarm::SwarmApi;

type ApiResult<T> = std::result::Result<T, BackendError>;

/// Address every fake container reports on its bridge network.
pub const FAKE_CONTAINER_IP: &str = "172.17.0.2";

/// Virtual IP every fake swarm service reports.
pub const FAKE_SERVICE_VIP: &str = "10.0.0.5";

/// Cluster IP every fake Kubernetes service receives.
pub const FAKE_CLUSTER_IP: &str = "10.96.0.10";

// ===== Docker engine =====

struct FakeContainer {
    name: String,
    config: Config<String>,
    host_port: u16,
    running: bool,
}

/// Single Docker engine held in memory.
pub struct FakeDocker {
    images: Mutex<HashSet<String>>,
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    next_port: AtomicU16,
    create_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    publish_ports: AtomicBool,
}

impl Default for FakeDocker {
    fn default() -> Self {
        Self {
            images: Mutex::default(),
            containers: Mutex::default(),
            next_id: AtomicUsize::new(0),
            next_port: AtomicU16::new(32768),
            create_calls: AtomicUsize::new(0),
            pull_calls: AtomicUsize::new(0),
            publish_ports: AtomicBool::new(true),
        }
    }
}

impl FakeDocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `image` is already present on the engine.
    pub fn with_image(self, image: impl Into<String>) -> Self {
        self.images.lock().unwrap().insert(image.into());
        self
    }

    /// Stop publishing host ports, as an engine without free ports would.
    pub fn set_publish_ports(&self, publish: bool) {
        self.publish_ports.store(publish, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.containers.lock().unwrap().contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// Configuration the container was created with.
    pub fn config_of(&self, id: &str) -> Option<Config<String>> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.config.clone())
    }

    /// Remove a container behind the driver's back.
    pub fn remove_out_of_band(&self, id: &str) -> bool {
        self.containers.lock().unwrap().remove(id).is_some()
    }

    fn missing(id: &str) -> BackendError {
        BackendError::from_status(404, format!("No such container: {}", id))
    }
}

#[async_trait]
impl DockerApi for FakeDocker {
    async fn create_container(&self, name: &str, config: Config<String>) -> ApiResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let image = config.image.clone().unwrap_or_default();
        if !self.images.lock().unwrap().contains(&image) {
            return Err(BackendError::from_status(
                404,
                format!("No such image: {}", image),
            ));
        }

        let mut containers = self.containers.lock().unwrap();
        if containers.values().any(|c| c.name == name) {
            return Err(BackendError::from_status(
                409,
                format!("Conflict. The container name \"/{}\" is already in use", name),
            ));
        }

        let id = format!("ctr{:061}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            id.clone(),
            FakeContainer {
                name: name.to_string(),
                config,
                host_port: self.next_port.fetch_add(1, Ordering::SeqCst),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> ApiResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(id).ok_or_else(|| Self::missing(id))?;
        container.running = true;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> ApiResult<ContainerInspectResponse> {
        let containers = self.containers.lock().unwrap();
        let container = containers.get(id).ok_or_else(|| Self::missing(id))?;

        let ports = if self.publish_ports.load(Ordering::SeqCst) {
            container
                .config
                .exposed_ports
                .as_ref()
                .map(|exposed| {
                    exposed
                        .keys()
                        .map(|key| {
                            let binding = PortBinding {
                                host_ip: Some("0.0.0.0".to_string()),
                                host_port: Some(container.host_port.to_string()),
                            };
                            (key.clone(), Some(vec![binding]))
                        })
                        .collect()
                })
        } else {
            None
        };

        Ok(ContainerInspectResponse {
            id: Some(id.to_string()),
            name: Some(format!("/{}", container.name)),
            network_settings: Some(NetworkSettings {
                networks: Some(HashMap::from([(
                    "bridge".to_string(),
                    EndpointSettings {
                        ip_address: Some(FAKE_CONTAINER_IP.to_string()),
                        ..Default::default()
                    },
                )])),
                ports,
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn pull_image(
        &self,
        image: &str,
        _credentials: Option<DockerCredentials>,
    ) -> ApiResult<()> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.images.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> ApiResult<()> {
        let mut containers = self.containers.lock().unwrap();
        let key = containers
            .iter()
            .find(|(key, c)| key.as_str() == id || c.name == id)
            .map(|(key, _)| key.clone())
            .ok_or_else(|| Self::missing(id))?;
        containers.remove(&key);
        Ok(())
    }
}

// ===== Docker Swarm =====

struct FakeServiceEntry {
    spec: ServiceSpec,
    inspections: usize,
    published_port: u16,
}

/// Swarm manager held in memory.
pub struct FakeSwarm {
    services: Mutex<HashMap<String, FakeServiceEntry>>,
    next_port: AtomicU16,
    create_calls: AtomicUsize,
    inspect_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    always_conflict: AtomicBool,
    ready_after: AtomicUsize,
}

impl Default for FakeSwarm {
    fn default() -> Self {
        Self {
            services: Mutex::default(),
            next_port: AtomicU16::new(30000),
            create_calls: AtomicUsize::new(0),
            inspect_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
            always_conflict: AtomicBool::new(false),
            ready_after: AtomicUsize::new(0),
        }
    }
}

impl FakeSwarm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every create with a name conflict.
    pub fn set_always_conflict(&self, conflict: bool) {
        self.always_conflict.store(conflict, Ordering::SeqCst);
    }

    /// Publish the endpoint only after `n` inspections; `usize::MAX` never does.
    pub fn set_ready_after(&self, n: usize) {
        self.ready_after.store(n, Ordering::SeqCst);
    }

    /// Leave a service named `name` behind, as an earlier launch would.
    pub fn insert_stale(&self, name: &str) {
        self.services.lock().unwrap().insert(
            name.to_string(),
            FakeServiceEntry {
                spec: ServiceSpec {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                inspections: 0,
                published_port: self.next_port.fetch_add(1, Ordering::SeqCst),
            },
        );
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.lock().unwrap().contains_key(name)
    }

    pub fn spec_of(&self, name: &str) -> Option<ServiceSpec> {
        self.services
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.spec.clone())
    }

    pub fn remove_out_of_band(&self, name: &str) -> bool {
        self.services.lock().unwrap().remove(name).is_some()
    }

    fn missing(name: &str) -> BackendError {
        BackendError::from_status(404, format!("service {} not found", name))
    }
}

#[async_trait]
impl SwarmApi for FakeSwarm {
    async fn create_service(
        &self,
        spec: ServiceSpec,
        _credentials: Option<DockerCredentials>,
    ) -> ApiResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let name = spec.name.clone().unwrap_or_default();
        let mut services = self.services.lock().unwrap();
        if self.always_conflict.load(Ordering::SeqCst) || services.contains_key(&name) {
            return Err(BackendError::from_status(
                409,
                format!("rpc error: name conflicts with an existing object: {}", name),
            ));
        }

        services.insert(
            name.clone(),
            FakeServiceEntry {
                spec,
                inspections: 0,
                published_port: self.next_port.fetch_add(1, Ordering::SeqCst),
            },
        );
        Ok(name)
    }

    async fn inspect_service(&self, name: &str) -> ApiResult<SwarmService> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        let mut services = self.services.lock().unwrap();
        let entry = services.get_mut(name).ok_or_else(|| Self::missing(name))?;
        entry.inspections += 1;

        let ready = entry.inspections > self.ready_after.load(Ordering::SeqCst);
        let endpoint = ready.then(|| {
            let ports = entry
                .spec
                .endpoint_spec
                .as_ref()
                .and_then(|e| e.ports.clone())
                .unwrap_or_default()
                .into_iter()
                .map(|port| EndpointPortConfig {
                    published_port: Some(i64::from(entry.published_port)),
                    ..port
                })
                .collect();
            ServiceEndpoint {
                ports: Some(ports),
                virtual_ips: Some(vec![ServiceEndpointVirtualIps {
                    network_id: Some("ingress".to_string()),
                    addr: Some(format!("{}/24", FAKE_SERVICE_VIP)),
                }]),
                ..Default::default()
            }
        });

        Ok(SwarmService {
            id: Some(name.to_string()),
            spec: Some(entry.spec.clone()),
            endpoint,
            ..Default::default()
        })
    }

    async fn delete_service(&self, name: &str) -> ApiResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.services
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing(name))
    }
}

// ===== Kubernetes =====

/// Single Kubernetes namespace held in memory.
pub struct FakeKube {
    pods: Mutex<HashMap<String, Pod>>,
    services: Mutex<HashMap<String, Service>>,
    next_node_port: AtomicU16,
    fail_service_create: AtomicBool,
    omit_node_port: AtomicBool,
}

impl Default for FakeKube {
    fn default() -> Self {
        Self {
            pods: Mutex::default(),
            services: Mutex::default(),
            next_node_port: AtomicU16::new(30000),
            fail_service_create: AtomicBool::new(false),
            omit_node_port: AtomicBool::new(false),
        }
    }
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every Service creation with a server error.
    pub fn set_fail_service_create(&self, fail: bool) {
        self.fail_service_create.store(fail, Ordering::SeqCst);
    }

    /// Create NodePort services without assigning a node port.
    pub fn set_omit_node_port(&self, omit: bool) {
        self.omit_node_port.store(omit, Ordering::SeqCst);
    }

    pub fn pod_count(&self) -> usize {
        self.pods.lock().unwrap().len()
    }

    pub fn service_count(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.pods.lock().unwrap().get(name).cloned()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.services.lock().unwrap().get(name).cloned()
    }

    /// Delete both objects behind the driver's back.
    pub fn remove_out_of_band(&self, name: &str) -> bool {
        let pod = self.pods.lock().unwrap().remove(name).is_some();
        let service = self.services.lock().unwrap().remove(name).is_some();
        pod || service
    }

    fn missing(kind: &str, name: &str) -> BackendError {
        BackendError::from_status(404, format!("{} \"{}\" not found", kind, name))
    }

    fn exists(kind: &str, name: &str) -> BackendError {
        BackendError::from_status(409, format!("{} \"{}\" already exists", kind, name))
    }
}

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

#[async_trait]
impl KubeApi for FakeKube {
    async fn create_pod(&self, pod: &Pod) -> ApiResult<Pod> {
        let name = object_name(&pod.metadata);
        let mut pods = self.pods.lock().unwrap();
        if pods.contains_key(&name) {
            return Err(Self::exists("pods", &name));
        }
        pods.insert(name, pod.clone());
        Ok(pod.clone())
    }

    async fn create_service(&self, service: &Service) -> ApiResult<Service> {
        if self.fail_service_create.load(Ordering::SeqCst) {
            return Err(BackendError::from_status(
                500,
                "Internal error occurred: failed to allocate a nodePort",
            ));
        }

        let name = object_name(&service.metadata);
        let mut services = self.services.lock().unwrap();
        if services.contains_key(&name) {
            return Err(Self::exists("services", &name));
        }

        let mut created = service.clone();
        if let Some(spec) = created.spec.as_mut() {
            spec.cluster_ip = Some(FAKE_CLUSTER_IP.to_string());
            let node_port = spec.type_.as_deref() == Some("NodePort")
                && !self.omit_node_port.load(Ordering::SeqCst);
            if node_port {
                for port in spec.ports.iter_mut().flatten() {
                    let assigned = self.next_node_port.fetch_add(1, Ordering::SeqCst);
                    port.node_port = Some(i32::from(assigned));
                }
            }
        }

        services.insert(name, created.clone());
        Ok(created)
    }

    async fn delete_pod(&self, name: &str) -> ApiResult<()> {
        self.pods
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing("pods", name))
    }

    async fn delete_service(&self, name: &str) -> ApiResult<()> {
        self.services
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing("services", name))
    }
}
