use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub container_provider: ContainerProviderConfig,
    pub store: StoreConfig,
    pub instance: InstanceConfig,
    pub reaper: ReaperConfig,
    pub telemetry: TelemetryConfig,
}

/// Which backend runs the challenge sandboxes.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerProviderType {
    Docker,
    Swarm,
    Kubernetes,
}

impl ContainerProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Swarm => "swarm",
            Self::Kubernetes => "kubernetes",
        }
    }
}

/// How players reach a sandbox.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PortMappingType {
    /// The backend publishes a port on `public_entry`.
    #[default]
    Default,
    /// Traffic is relayed by the platform; nothing is published.
    PlatformProxy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContainerProviderConfig {
    pub provider: ContainerProviderType,
    #[serde(default)]
    pub port_mapping: PortMappingType,
    /// Externally advertised host for directly exposed sandboxes.
    pub public_entry: String,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
    #[serde(default)]
    pub registries: Vec<RegistryConfig>,
}

impl ContainerProviderConfig {
    /// Find the configured registry serving `image`, if any.
    pub fn registry_for(&self, image: &str) -> Option<&RegistryConfig> {
        let host = registry_host(image)?;
        self.registries
            .iter()
            .find(|r| r.server_address.trim_end_matches('/') == host)
    }
}

/// Registry host of an image reference, when it names one explicitly.
///
/// `registry.local:5000/web/app:1` yields `registry.local:5000`; `nginx` and
/// `library/nginx` yield `None` (Docker Hub).
pub fn registry_host(image: &str) -> Option<&str> {
    let (first, rest) = image.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DockerConfig {
    /// `unix:///var/run/docker.sock`, `tcp://host:2375`, ... Local defaults when unset.
    pub uri: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KubernetesConfig {
    pub namespace: String,
    /// Kubeconfig file; in-cluster / default inference when unset.
    pub config_path: Option<String>,
    pub dns: Vec<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "arena-challenges".into(),
            config_path: None,
            dns: vec!["8.8.8.8".into(), "223.5.5.5".into(), "114.114.114.114".into()],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    pub server_address: String,
    pub username: Option<String>,
    pub password: Option<Secret<String>>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub sqlite_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    pub extension_minutes: i64,
    pub renewal_window_minutes: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    pub interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    pub json_logs: bool,
    pub metrics_addr: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("ARENA_ENV").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default"))
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Map APP__CONTAINER_PROVIDER__PROVIDER=kubernetes to container_provider.provider
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            container_provider: ContainerProviderConfig {
                provider: ContainerProviderType::Docker,
                port_mapping: PortMappingType::Default,
                public_entry: "127.0.0.1".into(),
                docker: DockerConfig::default(),
                kubernetes: KubernetesConfig::default(),
                registries: Vec::new(),
            },
            store: StoreConfig {
                backend: StoreBackend::Memory,
                sqlite_path: "data/containers.db".into(),
            },
            instance: InstanceConfig {
                extension_minutes: 120,
                renewal_window_minutes: 10,
            },
            reaper: ReaperConfig { interval_secs: 30 },
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("nginx:latest"), None);
        assert_eq!(registry_host("library/nginx"), None);
        assert_eq!(
            registry_host("registry.local:5000/web/app:1"),
            Some("registry.local:5000")
        );
        assert_eq!(registry_host("localhost/app"), Some("localhost"));
        assert_eq!(registry_host("ghcr.io/org/chal"), Some("ghcr.io"));
    }

    #[test]
    fn test_registry_for_matches_host() {
        let mut config = AppConfig::default().container_provider;
        config.registries.push(RegistryConfig {
            server_address: "ghcr.io".into(),
            username: Some("bot".into()),
            password: None,
        });

        assert!(config.registry_for("ghcr.io/org/chal:1").is_some());
        assert!(config.registry_for("docker.io/org/chal:1").is_none());
        assert!(config.registry_for("chal:1").is_none());
    }

    #[test]
    fn test_defaults_publish_ports() {
        let config = AppConfig::default();
        assert_eq!(config.container_provider.port_mapping, PortMappingType::Default);
        assert_eq!(config.container_provider.kubernetes.dns.len(), 3);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }
}
