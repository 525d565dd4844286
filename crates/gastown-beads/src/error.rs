//! Error types for the beads client and event transports.

use thiserror::Error;

/// A specialized Result type for control-plane operations.
pub type Result<T> = std::result::Result<T, BeadsError>;

/// Errors that can occur while talking to the beads control plane.
#[derive(Debug, Error)]
pub enum BeadsError {
    /// HTTP transport failure (connect, timeout, body read).
    #[error("beads request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The daemon answered with a non-success status.
    #[error("beads daemon returned {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        message: String,
    },

    /// A response body could not be decoded.
    #[error("invalid beads response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The event stream failed mid-read.
    #[error("event stream error: {0}")]
    Stream(String),

    /// The event bus connection or consumer failed.
    #[error("event bus error: {0}")]
    Bus(String),
}
