//! Sandbox record types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Lifetime granted to a freshly created sandbox, in minutes.
pub const DEFAULT_LIFETIME_MINUTES: i64 = 120;

/// Lifetime granted to a freshly created sandbox.
pub fn default_lifetime() -> Duration {
    Duration::minutes(DEFAULT_LIFETIME_MINUTES)
}

/// Lifecycle status of a sandbox. Moves forward only.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Pending,
    Running,
    Destroyed,
}

impl ContainerStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Destroyed => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "destroyed" => Some(Self::Destroyed),
            _ => None,
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(host, port)` pair.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Persisted record of one sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Backend identifier: container id, swarm service name or pod name.
    pub id: String,
    pub image: String,
    pub status: ContainerStatus,
    pub started_at: DateTime<Utc>,
    /// Auto-stop deadline; may only move forward.
    pub expect_stop_at: DateTime<Utc>,
    /// Address reachable from inside the platform network.
    pub internal: Endpoint,
    /// External traffic must be relayed by the platform.
    pub is_proxy: bool,
    /// Directly reachable address, when the backend publishes one.
    pub public: Option<Endpoint>,
    pub team_id: String,
    pub challenge_id: String,
}

impl Container {
    /// Create a `Pending` record starting now with the default lifetime.
    pub fn new(id: impl Into<String>, image: impl Into<String>, internal: Endpoint) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            image: image.into(),
            status: ContainerStatus::Pending,
            started_at: now,
            expect_stop_at: now + default_lifetime(),
            internal,
            is_proxy: true,
            public: None,
            team_id: String::new(),
            challenge_id: String::new(),
        }
    }

    pub fn with_owner(mut self, team_id: impl Into<String>, challenge_id: impl Into<String>) -> Self {
        self.team_id = team_id.into();
        self.challenge_id = challenge_id.into();
        self
    }

    pub fn is_active(&self) -> bool {
        self.status != ContainerStatus::Destroyed
    }

    /// Move to `to`. Backward moves are rejected, same-state moves are no-ops.
    pub fn transition(&mut self, to: ContainerStatus) -> Result<()> {
        if to.rank() < self.status.rank() {
            return Err(Error::invalid_state(format!(
                "container {} cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    /// Terminal flip performed by drivers once the backend resource is gone.
    pub fn mark_destroyed(&mut self) {
        self.status = ContainerStatus::Destroyed;
    }

    /// Push the deadline out to `deadline`. Earlier deadlines are ignored.
    pub fn extend_to(&mut self, deadline: DateTime<Utc>) {
        if deadline > self.expect_stop_at {
            self.expect_stop_at = deadline;
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expect_stop_at < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> Container {
        Container::new("c1", "echo:latest", Endpoint::new("10.0.0.2", 7))
    }

    #[test]
    fn test_new_record_defaults() {
        let c = record();
        assert_eq!(c.status, ContainerStatus::Pending);
        assert!(c.is_proxy);
        assert!(c.public.is_none());
        assert_eq!(c.expect_stop_at - c.started_at, default_lifetime());
    }

    #[test]
    fn test_transitions_forward_only() {
        let mut c = record();
        c.transition(ContainerStatus::Running).unwrap();
        c.transition(ContainerStatus::Running).unwrap();
        assert!(c.transition(ContainerStatus::Pending).is_err());
        c.transition(ContainerStatus::Destroyed).unwrap();
        assert!(c.transition(ContainerStatus::Running).is_err());
        assert!(!c.is_active());
    }

    #[test]
    fn test_extend_never_moves_backward() {
        let mut c = record();
        let original = c.expect_stop_at;
        c.extend_to(original - Duration::minutes(5));
        assert_eq!(c.expect_stop_at, original);
        c.extend_to(original + Duration::minutes(5));
        assert_eq!(c.expect_stop_at, original + Duration::minutes(5));
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            ContainerStatus::Pending,
            ContainerStatus::Running,
            ContainerStatus::Destroyed,
        ] {
            assert_eq!(ContainerStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ContainerStatus::parse("gone"), None);
    }
}
