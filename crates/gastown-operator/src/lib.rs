//! Kubernetes controller for gastown agent pods.
//!
//! The controller converges the set of agent pods in one namespace to
//! the desired set held by the beads control plane. Two inputs feed
//! the convergence engine:
//!
//! - a **push** stream of mutation events (SSE or a JetStream durable
//!   consumer), normalized into agent lifecycle events for low
//!   latency, and
//! - a **pull** reconciler that periodically diffs desired against
//!   actual and is the authority for correctness.
//!
//! The event stream is an optimization: anything it misses (dropped
//! events, disconnects, controller downtime) is recovered by the next
//! reconcile pass. A broken pull path inhibits deletions entirely, so
//! a control-plane outage can never wipe running agents.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     beads control plane                      │
//! └──────────────────────────────────────────────────────────────┘
//!        │ events (SSE / JetStream)        │ List / Update
//!        ▼                                 ▼
//! ┌─────────────┐                   ┌─────────────┐
//! │   watcher    │──lifecycle──▶    │  reconciler  │
//! └─────────────┘    events    ┌───┴─────────────┴───┐
//!                              │    controller loop    │
//!                              └───┬─────────────┬───┘
//!                    ┌─────────────┘             └──────────────┐
//!                    ▼                                          ▼
//!             ┌─────────────┐                           ┌─────────────┐
//!             │ pod manager  │                           │   reporter   │
//!             └─────────────┘                           └─────────────┘
//!                    │                                          │
//!                    ▼                                          ▼
//!            Kubernetes API                            bead notes / bugs
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod controller;
pub mod error;
pub mod manager;
pub mod mirror;
pub mod pod;
pub mod reconcile;
pub mod reporter;
pub mod rigs;
pub mod watcher;

pub use config::{ControllerConfig, CoopPlacement, EventTransport};
pub use controller::Controller;
pub use error::{OperatorError, Result};
pub use manager::{PodManager, PodStore};
pub use mirror::MirrorProvisioner;
pub use pod::{build_agent_pod, build_workspace_pvc, SpawnOverrides};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use reporter::{BackendMeta, MetricsSnapshot, StatusReporter};
pub use rigs::RigCache;
pub use watcher::{event_channel, EventWatcher, LifecycleEvent, LifecycleKind};

#[cfg(any(test, feature = "test-utils"))]
pub use manager::mock::MockPodStore;
