//! Beads control-plane client and event transports.
//!
//! The beads daemon holds the canonical set of desired agent work
//! items. This crate provides everything the controller needs to talk
//! to it:
//!
//! - [`BeadsClient`]: JSON-over-HTTP client for listing agent beads
//!   and rigs and writing notes back
//! - Wire types ([`Issue`], [`MutationEvent`]) and the `key: value`
//!   notes bag parsing
//! - [`SseStream`]: push transport reading mutation events off the
//!   daemon's server-sent-events endpoint
//! - [`DurableConsumer`]: pull transport reading mutation events from
//!   a JetStream durable consumer
//!
//! Reconnect policy and event normalization live in the operator; the
//! transports here surface one connection at a time and report stream
//! errors to the caller.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod consumer;
pub mod error;
pub mod stream;
pub mod types;

pub use client::{BeadsApi, BeadsClient};
pub use consumer::DurableConsumer;
pub use error::{BeadsError, Result};
pub use stream::{SseConnection, SseStream};
pub use types::{label_value, parse_notes, render_notes, AgentBead, Issue, MutationEvent, RigRecord};

#[cfg(any(test, feature = "test-utils"))]
pub use client::mock::MockBeads;
