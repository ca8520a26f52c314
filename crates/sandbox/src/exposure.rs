//! Network-exposure resolution.
//!
//! Whether players connect to a sandbox directly or through the platform
//! proxy is a platform-wide decision (`PortMappingType`). Drivers only supply
//! the port their backend published; this module turns it into the record's
//! `public` / `is_proxy` pair.

use arena_core::config::{ContainerProviderConfig, PortMappingType};
use arena_core::types::{Container, Endpoint};

/// Resolved exposure for one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exposure {
    pub is_proxy: bool,
    pub public: Option<Endpoint>,
}

impl Exposure {
    pub fn apply(self, container: &mut Container) {
        container.is_proxy = self.is_proxy;
        container.public = self.public;
    }
}

/// Platform exposure settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ExposurePolicy {
    mode: PortMappingType,
    public_entry: String,
}

impl ExposurePolicy {
    pub fn new(mode: PortMappingType, public_entry: impl Into<String>) -> Self {
        Self {
            mode,
            public_entry: public_entry.into(),
        }
    }

    pub fn from_config(config: &ContainerProviderConfig) -> Self {
        Self::new(config.port_mapping, config.public_entry.clone())
    }

    /// Whether the backend should publish a port at all.
    pub fn expose_ports(&self) -> bool {
        self.mode == PortMappingType::Default
    }

    /// Resolve the exposure for a sandbox whose backend published `published_port`.
    ///
    /// Returns `None` when ports are exposed directly but the backend did not
    /// publish one; such a sandbox is unreachable and must not be handed out.
    pub fn resolve(&self, published_port: Option<u16>) -> Option<Exposure> {
        match self.mode {
            PortMappingType::PlatformProxy => Some(Exposure {
                is_proxy: true,
                public: None,
            }),
            PortMappingType::Default => published_port.map(|port| Exposure {
                is_proxy: false,
                public: Some(Endpoint::new(self.public_entry.clone(), port)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_exposure() {
        let policy = ExposurePolicy::new(PortMappingType::Default, "ctf.example.com");
        assert!(policy.expose_ports());

        let exposure = policy.resolve(Some(31337)).unwrap();
        assert!(!exposure.is_proxy);
        assert_eq!(
            exposure.public,
            Some(Endpoint::new("ctf.example.com", 31337))
        );

        assert!(policy.resolve(None).is_none());
    }

    #[test]
    fn test_proxied_exposure_ignores_port() {
        let policy = ExposurePolicy::new(PortMappingType::PlatformProxy, "ctf.example.com");
        assert!(!policy.expose_ports());

        for port in [None, Some(31337)] {
            let exposure = policy.resolve(port).unwrap();
            assert!(exposure.is_proxy);
            assert!(exposure.public.is_none());
        }
    }
}
