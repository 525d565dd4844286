//! Event watcher: push stream of normalized lifecycle events.
//!
//! Consumes raw mutation events from the configured transport (SSE or
//! the JetStream durable consumer), filters out everything that is not
//! an agent mutation, normalizes the rest, and feeds a bounded channel
//! read by the controller loop. When the channel is full the newest
//! event is dropped with a warning; the periodic reconciler is the
//! backstop for any missed transition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gastown_beads::{BeadsError, DurableConsumer, MutationEvent, SseStream};
use gastown_core::AgentId;

use crate::config::{ControllerConfig, EventTransport};
use crate::error::Result;
use crate::pod::SpawnOverrides;

/// Capacity of the normalized event channel.
pub const EVENT_QUEUE_DEPTH: usize = 64;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// The lifecycle transitions the controller acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    /// Create the agent's pod.
    Spawn,
    /// The agent finished; tear the pod down.
    Done,
    /// The agent was killed; tear the pod down.
    Kill,
    /// The agent is stuck; replace its pod.
    Stuck,
    /// Metadata changed; the next reconcile checks for drift.
    Update,
}

/// A normalized agent lifecycle event.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// What happened.
    pub kind: LifecycleKind,
    /// Which agent it happened to.
    pub id: AgentId,
    /// The bead id, for status writes.
    pub bead: String,
    /// Per-event overrides plus attached controller defaults.
    pub overrides: SpawnOverrides,
}

/// Create the bounded channel between watcher and dispatcher.
#[must_use]
pub fn event_channel() -> (mpsc::Sender<LifecycleEvent>, mpsc::Receiver<LifecycleEvent>) {
    mpsc::channel(EVENT_QUEUE_DEPTH)
}

/// Normalize one mutation event.
///
/// Returns `None` for non-agent mutations, unknown kinds, status
/// transitions the controller does not act on, and events whose
/// identity cannot be completed; all are dropped silently (debug log
/// only), never surfaced.
#[must_use]
pub fn normalize(event: &MutationEvent, config: &ControllerConfig) -> Option<LifecycleEvent> {
    if !event.is_agent() {
        return None;
    }

    let kind = match event.kind.as_str() {
        "create" => LifecycleKind::Spawn,
        "status" => match event.new_status.as_deref() {
            Some("closed") => LifecycleKind::Done,
            Some("in_progress") => LifecycleKind::Spawn,
            other => {
                debug!(bead = %event.id, status = ?other, "ignoring status transition");
                return None;
            }
        },
        "delete" => LifecycleKind::Kill,
        "update" => LifecycleKind::Update,
        "stuck" => LifecycleKind::Stuck,
        other => {
            debug!(bead = %event.id, kind = other, "ignoring unknown mutation kind");
            return None;
        }
    };

    let Some(id) = event.identity(&config.town) else {
        debug!(bead = %event.id, "dropping event with incomplete identity");
        return None;
    };

    let meta: BTreeMap<String, String> = event
        .labels
        .iter()
        .filter_map(|label| {
            let (k, v) = label.split_once(':')?;
            Some((k.to_string(), v.to_string()))
        })
        .collect();
    let mut overrides = SpawnOverrides::from_meta(&meta);

    // attach controller defaults as event metadata
    overrides
        .namespace
        .get_or_insert_with(|| config.namespace.clone());
    overrides
        .image
        .get_or_insert_with(|| config.default_image.clone());
    overrides
        .daemon_host
        .get_or_insert_with(|| config.daemon_host.clone());
    overrides.daemon_port.get_or_insert(config.daemon_port);

    let bead = if event.id.is_empty() {
        id.bead_id(&config.town)
    } else {
        event.id.clone()
    };

    Some(LifecycleEvent {
        kind,
        id,
        bead,
        overrides,
    })
}

/// The grown backoff after a failed connection attempt.
#[must_use]
pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Long-lived watcher task feeding the event channel.
///
/// Runs until the cancellation token fires; the channel closes when
/// the watcher returns and drops its sender.
pub struct EventWatcher {
    config: Arc<ControllerConfig>,
    tx: mpsc::Sender<LifecycleEvent>,
}

impl EventWatcher {
    /// Create a watcher writing to `tx`.
    #[must_use]
    pub fn new(config: Arc<ControllerConfig>, tx: mpsc::Sender<LifecycleEvent>) -> Self {
        Self { config, tx }
    }

    /// Run the watch loop until cancelled.
    ///
    /// On any stream error or end-of-stream the watcher reconnects
    /// after an exponential backoff (1 s doubling to 30 s), reset on
    /// every successful connection.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.pump(&shutdown, &mut backoff).await {
                Ok(()) => break,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(error = %e, delay = ?backoff, "event stream failed, reconnecting");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }
        info!("event watcher stopped");
    }

    /// Connect once and pump events until cancellation or failure.
    ///
    /// `Ok(())` means a clean exit (cancelled or channel closed).
    async fn pump(&self, shutdown: &CancellationToken, backoff: &mut Duration) -> Result<()> {
        match self.config.event_transport {
            EventTransport::Sse => self.pump_sse(shutdown, backoff).await,
            EventTransport::Nats => self.pump_nats(shutdown, backoff).await,
        }
    }

    async fn pump_sse(&self, shutdown: &CancellationToken, backoff: &mut Duration) -> Result<()> {
        let stream = SseStream::new(self.config.events_url(), self.config.beads_token.clone());
        let mut conn = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            conn = stream.connect() => conn?,
        };
        *backoff = INITIAL_BACKOFF;
        info!(url = %self.config.events_url(), "event stream connected");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                event = conn.next_event() => match event? {
                    Some(raw) => {
                        if !self.forward(&raw) {
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(BeadsError::Stream("event stream ended".to_string()).into());
                    }
                },
            }
        }
    }

    async fn pump_nats(&self, shutdown: &CancellationToken, backoff: &mut Duration) -> Result<()> {
        let consumer = DurableConsumer::new(
            self.config.nats_url.clone(),
            self.config.nats_token.clone(),
            self.config.events_subject(),
            self.config.durable_name(),
        );
        let mut messages = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            messages = consumer.connect() => messages?,
        };
        *backoff = INITIAL_BACKOFF;
        info!(
            subject = %self.config.events_subject(),
            durable = %self.config.durable_name(),
            "event bus connected"
        );

        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                event = messages.next_event() => match event? {
                    Some(raw) => {
                        if !self.forward(&raw) {
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(BeadsError::Bus("event subscription ended".to_string()).into());
                    }
                },
            }
        }
    }

    /// Normalize and enqueue one raw event. Returns `false` when the
    /// receiving side is gone and the watcher should stop.
    fn forward(&self, raw: &MutationEvent) -> bool {
        let Some(event) = normalize(raw, &self.config) else {
            return true;
        };
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                // the reconciler covers the missed edge on its next tick
                warn!(
                    agent = %event.id,
                    kind = ?event.kind,
                    "event queue full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, stopping watcher");
                false
            }
        }
    }
}
