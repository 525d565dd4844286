//! Error types for the operator crate.

use thiserror::Error;

/// A specialized Result type for operator operations.
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur during controller operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// Pod not found in the cluster.
    #[error("pod not found: {0}")]
    PodNotFound(String),

    /// Control-plane error.
    #[error("control plane error: {0}")]
    Beads(#[from] gastown_beads::BeadsError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The event watcher terminated while the controller was running.
    #[error("event watcher stopped unexpectedly")]
    WatcherStopped,

    /// A status sync completed with per-pod failures.
    #[error("status sync failed for {failed} of {total} pods")]
    SyncIncomplete {
        /// Pods whose status report failed.
        failed: usize,
        /// Pods visited.
        total: usize,
    },
}

/// Whether a kube error is an API error with the given status code.
#[must_use]
pub fn is_api_code(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(api) if api.code == code)
}

/// Whether a kube error is a 409 AlreadyExists conflict.
#[must_use]
pub fn is_already_exists(err: &kube::Error) -> bool {
    is_api_code(err, 409)
}

/// Whether a kube error is a 404 NotFound.
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    is_api_code(err, 404)
}
