//! The controller loop.
//!
//! Owns the watcher, reconciler, rig cache, mirror provisioner, and
//! reporter. On start it catches up on anything that happened while
//! the controller was down (cache refresh, mirror ensure, one
//! reconcile pass), then runs until cancelled: a dispatcher over the
//! event channel and a periodic sync ticker.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use gastown_beads::BeadsApi;

use crate::config::ControllerConfig;
use crate::error::{OperatorError, Result};
use crate::manager::PodStore;
use crate::mirror::MirrorProvisioner;
use crate::pod::{build_agent_pod, build_workspace_pvc};
use crate::reconcile::Reconciler;
use crate::reporter::{coop_url, BackendMeta, StatusReporter};
use crate::rigs::RigCache;
use crate::watcher::{event_channel, EventWatcher, LifecycleEvent, LifecycleKind};

/// The convergence engine: event dispatch plus periodic reconcile.
pub struct Controller {
    config: Arc<ControllerConfig>,
    beads: Arc<dyn BeadsApi>,
    pods: Arc<dyn PodStore>,
    rigs: Arc<RigCache>,
    reporter: StatusReporter,
    reconciler: Reconciler,
    mirrors: Option<MirrorProvisioner>,
}

impl Controller {
    /// Wire up a controller from its collaborators.
    #[must_use]
    pub fn new(
        config: Arc<ControllerConfig>,
        beads: Arc<dyn BeadsApi>,
        pods: Arc<dyn PodStore>,
    ) -> Self {
        let rigs = Arc::new(RigCache::new());
        let reporter = StatusReporter::new(&config, Arc::clone(&beads), Arc::clone(&pods));
        let reconciler = Reconciler::new(
            Arc::clone(&config),
            Arc::clone(&beads),
            Arc::clone(&pods),
            Arc::clone(&rigs),
        );
        Self {
            config,
            beads,
            pods,
            rigs,
            reporter,
            reconciler,
            mirrors: None,
        }
    }

    /// Attach a mirror provisioner (absent in tests without a
    /// cluster).
    #[must_use]
    pub fn with_mirrors(mut self, mirrors: MirrorProvisioner) -> Self {
        self.mirrors = Some(mirrors);
        self
    }

    /// Run until the token is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::WatcherStopped`] if the event watcher
    /// dies while the controller is still supposed to be running.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.startup().await;

        let (tx, mut rx) = event_channel();
        let watcher = EventWatcher::new(Arc::clone(&self.config), tx);
        let watcher_task = tokio::spawn(watcher.run(shutdown.clone()));

        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the interval fires immediately; startup already synced
        ticker.tick().await;

        let result = self.serve(&shutdown, &mut rx, &mut ticker).await;

        shutdown.cancel();
        if let Err(e) = watcher_task.await {
            warn!(error = %e, "watcher task join failed");
        }
        info!("controller stopped");
        result
    }

    /// Catch up on state that changed while the controller was down.
    async fn startup(&self) {
        info!(
            namespace = %self.config.namespace,
            town = %self.config.town,
            transport = ?self.config.event_transport,
            "controller starting"
        );
        if let Err(e) = self.rigs.refresh(self.beads.as_ref()).await {
            warn!(error = %e, "startup rig refresh failed");
        }
        if let Some(mirrors) = &self.mirrors {
            mirrors.ensure_all(&self.rigs).await;
        }
        if let Err(e) = self.reconciler.reconcile().await {
            warn!(error = %e, "startup reconcile failed, next tick retries");
        }
    }

    async fn serve(
        &self,
        shutdown: &CancellationToken,
        rx: &mut mpsc::Receiver<LifecycleEvent>,
        ticker: &mut tokio::time::Interval,
    ) -> Result<()> {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                event = rx.recv() => match event {
                    Some(event) => self.dispatch(event).await,
                    None => {
                        if shutdown.is_cancelled() {
                            return Ok(());
                        }
                        error!("event channel closed while running");
                        return Err(OperatorError::WatcherStopped);
                    }
                },
                _ = ticker.tick() => self.sync_tick().await,
            }
        }
    }

    /// Apply one lifecycle event.
    async fn dispatch(&self, event: LifecycleEvent) {
        debug!(agent = %event.id, kind = ?event.kind, "dispatching event");
        match event.kind {
            LifecycleKind::Spawn => self.handle_spawn(&event, None).await,
            LifecycleKind::Done => self.handle_teardown(&event, "done").await,
            LifecycleKind::Kill => self.handle_teardown(&event, "failed").await,
            LifecycleKind::Stuck => {
                // best-effort delete, then a fresh pod
                match self.pods.delete_pod(&event.id.pod_name()).await {
                    Ok(()) => {}
                    Err(OperatorError::PodNotFound(name)) => {
                        warn!(pod = %name, "stuck pod already gone");
                    }
                    Err(e) => {
                        warn!(agent = %event.id, error = %e, "stuck pod delete failed");
                    }
                }
                self.handle_spawn(&event, Some("stuck")).await;
            }
            LifecycleKind::Update => {
                debug!(agent = %event.id, "metadata updated, next reconcile checks for drift");
            }
        }
    }

    async fn handle_spawn(&self, event: &LifecycleEvent, restart_reason: Option<&str>) {
        let rig = self.rigs.get(&event.id.rig);
        let pod = build_agent_pod(
            &self.config,
            &event.id,
            rig.as_ref(),
            &self.rigs.gt_rigs_env(),
            &event.overrides,
        );
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| self.config.namespace.clone());
        let workspace = build_workspace_pvc(&event.id, rig.as_ref(), &namespace);

        if let Err(e) = self.pods.create_pod(&pod, workspace.as_ref()).await {
            // surfaced by the next reconcile pass
            error!(agent = %event.id, error = %e, "spawn failed");
            return;
        }

        self.reporter
            .report_state(&event.id, "spawning", restart_reason)
            .await;

        if self.config.coop.is_enabled() {
            let pod_name = event.id.pod_name();
            let meta = BackendMeta {
                backend: "coop".to_string(),
                coop_url: coop_url(&pod_name, &namespace),
                coop_token: self.config.coop_token.clone().unwrap_or_default(),
                pod_name,
                pod_namespace: namespace,
            };
            self.reporter.report_backend(&event.id, &meta).await;
        }
    }

    async fn handle_teardown(&self, event: &LifecycleEvent, state: &str) {
        let name = event.id.pod_name();
        match self.pods.delete_pod(&name).await {
            Ok(()) => {}
            Err(OperatorError::PodNotFound(_)) => {
                warn!(pod = %name, "pod already gone on teardown");
            }
            Err(e) => {
                error!(agent = %event.id, error = %e, "teardown delete failed");
                return;
            }
        }

        // clearing metadata writes the empty payload, a documented
        // no-op; the bead is closing on the control-plane side
        self.reporter
            .report_backend(&event.id, &BackendMeta::default())
            .await;
        self.reporter.report_state(&event.id, state, None).await;
    }

    /// One periodic sync pass.
    async fn sync_tick(&self) {
        debug!("sync tick");
        if let Err(e) = self.reporter.sync_all().await {
            warn!(error = %e, "status sync incomplete");
        }
        if let Err(e) = self.rigs.refresh(self.beads.as_ref()).await {
            warn!(error = %e, "rig refresh failed");
        }
        if let Some(mirrors) = &self.mirrors {
            mirrors.ensure_all(&self.rigs).await;
        }
        if let Err(e) = self.reconciler.reconcile().await {
            warn!(error = %e, "reconcile failed");
        }
        info!(metrics = ?self.reporter.metrics(), "sync tick complete");
    }
}
