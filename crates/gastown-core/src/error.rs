//! Error types for identity parsing.

use thiserror::Error;

/// Errors produced while parsing agent identities off the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// The role string is not one of the known agent roles.
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// An actor reference did not have the `rig/role/name` shape.
    #[error("malformed actor reference: {0}")]
    MalformedActor(String),

    /// A bead id could not be split into rig, role, and agent.
    #[error("malformed bead id: {0}")]
    MalformedBeadId(String),

    /// A required identity component was empty.
    #[error("empty identity component: {0}")]
    EmptyComponent(&'static str),
}
