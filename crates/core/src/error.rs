//! Error types for Arena.

use thiserror::Error;

/// Result type alias using Arena's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for Arena.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Request / Lifecycle Errors
    // =========================================================================
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Instance already running for team {team_id} on challenge {challenge_id}")]
    AlreadyRunning {
        team_id: String,
        challenge_id: String,
    },

    #[error("Sandbox unavailable: {0}")]
    ContainerUnavailable(String),

    #[error("Destroy did not complete for container {0}")]
    DestroyIncomplete(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Backend / Platform Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an invalid request error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a backend error.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
