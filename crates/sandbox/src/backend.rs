//! Backend error normalization and shared call plumbing.
//!
//! Docker, Swarm and Kubernetes each report "missing", "conflict" and
//! "missing image" in their own way. Every client error is folded into
//! `BackendError` before a driver decides what it means, so the drivers
//! never match on library-specific error shapes.

use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Normalized backend failure.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The resource does not exist (any backend's 404 shape).
    #[error("resource not found: {0}")]
    NotFound(String),

    /// A resource with the same name already exists.
    #[error("name conflict: {0}")]
    Conflict(String),

    /// The engine has no local copy of the image.
    #[error("image not found: {0}")]
    ImageNotFound(String),

    /// Any other response from the backend API.
    #[error("backend returned status {status}: {body}")]
    Api { status: u16, body: String },

    /// The request never produced an API response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The resource exists but exposes no reachable address.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// The caller's cancellation token fired first.
    #[error("operation cancelled")]
    Cancelled,
}

impl BackendError {
    /// Map an HTTP status and response body to a backend error.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let lower = body.to_ascii_lowercase();

        if lower.contains("no such image") {
            return Self::ImageNotFound(body);
        }
        // Older engines answer a missing container with a 500 and this text.
        if status == 404 || lower.contains("no such container") {
            return Self::NotFound(body);
        }
        if status == 409 {
            return Self::Conflict(body);
        }
        Self::Api { status, body }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Backend status code for logging, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) | Self::ImageNotFound(_) => Some(404),
            Self::Conflict(_) => Some(409),
            Self::Api { status, .. } => Some(*status),
            Self::Transport(_) | Self::Unreachable(_) | Self::Cancelled => None,
        }
    }
}

impl From<bollard::errors::Error> for BackendError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => Self::from_status(status_code, message),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<kube::Error> for BackendError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => Self::from_status(response.code, response.message),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Treat "not found" as a completed teardown.
pub fn idempotent(result: Result<(), BackendError>) -> Result<(), BackendError> {
    match result {
        Err(err) if err.is_not_found() => Ok(()),
        other => other,
    }
}

/// Race a backend call against the caller's cancellation token.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackendError::Cancelled),
        res = fut => res,
    }
}

/// Sleep unless cancelled. Returns `false` when the token fired.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: std::time::Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

pub(crate) fn record_create(backend: &'static str, outcome: &'static str) {
    metrics::counter!("container_create_total", "backend" => backend, "outcome" => outcome)
        .increment(1);
}

pub(crate) fn record_destroy(backend: &'static str, outcome: &'static str) {
    metrics::counter!("container_destroy_total", "backend" => backend, "outcome" => outcome)
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            BackendError::from_status(404, "No such image: echo:latest"),
            BackendError::ImageNotFound(_)
        ));
        assert!(BackendError::from_status(404, "No such container: abc").is_not_found());
        assert!(BackendError::from_status(500, "Error: No such container: abc").is_not_found());
        assert!(BackendError::from_status(404, "service web not found").is_not_found());
        assert!(matches!(
            BackendError::from_status(409, "name is already in use"),
            BackendError::Conflict(_)
        ));
        assert!(matches!(
            BackendError::from_status(500, "daemon exploded"),
            BackendError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn test_bollard_error_normalized() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: gone".into(),
        };
        assert!(BackendError::from(err).is_not_found());
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: Result<(), BackendError> = cancellable(&cancel, async { Ok(()) }).await;
        assert!(matches!(res, Err(BackendError::Cancelled)));

        let live = CancellationToken::new();
        let res: Result<u8, BackendError> = cancellable(&live, async { Ok(7) }).await;
        assert_eq!(res.unwrap(), 7);
    }
}
