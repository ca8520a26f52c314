//! Resource request types.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Everything a driver needs to launch one challenge sandbox.
///
/// Built by the caller per launch and never persisted. `team_id`, `user_id`
/// and `challenge_id` are attribution only; drivers turn them into labels and
/// never interpret them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Backend-native image reference.
    pub image: String,
    /// The single TCP port the challenge listens on.
    pub exposed_port: u16,
    /// CPU cap in tenths of a core.
    pub cpu_count: u32,
    /// Memory cap in MiB.
    pub memory_limit: u32,
    /// Ephemeral storage cap in MiB.
    pub storage_limit: u32,
    pub privileged: bool,
    /// Per-team secret injected into the sandbox environment.
    pub flag: Option<String>,
    pub team_id: String,
    pub user_id: String,
    pub challenge_id: String,
}

impl ContainerConfig {
    /// Create a request with platform defaults (0.1 core, 64 MiB, 256 MiB storage).
    pub fn new(image: impl Into<String>, exposed_port: u16) -> Self {
        Self {
            image: image.into(),
            exposed_port,
            cpu_count: 1,
            memory_limit: 64,
            storage_limit: 256,
            privileged: false,
            flag: None,
            team_id: String::new(),
            user_id: String::new(),
            challenge_id: String::new(),
        }
    }

    pub fn with_limits(mut self, cpu_count: u32, memory_limit: u32, storage_limit: u32) -> Self {
        self.cpu_count = cpu_count;
        self.memory_limit = memory_limit;
        self.storage_limit = storage_limit;
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flag = Some(flag.into());
        self
    }

    pub fn with_owner(
        mut self,
        team_id: impl Into<String>,
        user_id: impl Into<String>,
        challenge_id: impl Into<String>,
    ) -> Self {
        self.team_id = team_id.into();
        self.user_id = user_id.into();
        self.challenge_id = challenge_id.into();
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    /// Reject requests no backend can honor.
    pub fn validate(&self) -> Result<()> {
        if self.image.trim().is_empty() {
            return Err(Error::invalid_request("image reference is empty"));
        }
        if self.exposed_port == 0 {
            return Err(Error::invalid_request("exposed port must be non-zero"));
        }
        if self.cpu_count == 0 {
            return Err(Error::invalid_request(
                "cpu count is in tenths of a core and must be at least 1",
            ));
        }
        if self.memory_limit == 0 {
            return Err(Error::invalid_request("memory limit must be non-zero"));
        }
        if self.storage_limit == 0 {
            return Err(Error::invalid_request("storage limit must be non-zero"));
        }
        Ok(())
    }

    /// CPU cap in millicores.
    pub fn cpu_millicores(&self) -> u64 {
        u64::from(self.cpu_count) * 100
    }

    /// Memory cap in bytes.
    pub fn memory_bytes(&self) -> i64 {
        i64::from(self.memory_limit) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ContainerConfig::new("echo:latest", 7).validate().is_ok());
        assert!(ContainerConfig::new("", 7).validate().is_err());
        assert!(ContainerConfig::new("echo", 0).validate().is_err());
        assert!(ContainerConfig::new("echo", 7)
            .with_limits(0, 64, 256)
            .validate()
            .is_err());
    }

    #[test]
    fn test_zero_storage_is_rejected() {
        let err = ContainerConfig::new("echo", 7)
            .with_limits(1, 64, 0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_unit_conversions() {
        for (cpu, millis) in [(1, 100), (10, 1000), (1024, 102_400)] {
            let config = ContainerConfig::new("echo", 7).with_limits(cpu, 64, 256);
            assert_eq!(config.cpu_millicores(), millis);
        }
        let config = ContainerConfig::new("echo", 7).with_limits(1, 64, 256);
        assert_eq!(config.memory_bytes(), 64 * 1024 * 1024);
    }
}
