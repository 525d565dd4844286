//! Core types for the gastown controller.
//!
//! This crate provides the identity model shared by the control-plane
//! client and the operator:
//!
//! - **Roles**: the closed set of agent roles and their properties
//! - **Agent identity**: the (rig, role, agent) triple, with the pod
//!   name and bead id derivations used for desired/actual matching
//!
//! # Example
//!
//! ```
//! use gastown_core::{AgentId, Role};
//!
//! let id = AgentId::new("gastown", Role::Polecat, "furiosa");
//! assert_eq!(id.pod_name(), "gt-gastown-polecat-furiosa");
//! assert_eq!(id.bead_id("gastown"), "gastown-polecat-furiosa");
//!
//! // Singletons use the legacy short form
//! let mayor = AgentId::new("gastown", Role::Mayor, "hq");
//! assert_eq!(mayor.bead_id("gastown"), "hq-mayor");
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;

pub use error::IdError;
pub use ids::{AgentId, Role};
