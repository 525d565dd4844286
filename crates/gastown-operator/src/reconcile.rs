//! Desired-vs-actual reconciliation.
//!
//! One pass pulls the desired agent set from the control plane, lists
//! the actual agent-labeled pods, and converges: orphans are deleted,
//! missing pods created, failed and drifted pods replaced. The pass
//! guard makes reconciliation serial; every operation is idempotent,
//! so interleaving with event-driven actions is safe.
//!
//! The non-negotiable fail-safe: if the desired pull fails, the pass
//! makes no changes at all. A control-plane outage must never delete
//! running agents.

use std::collections::HashMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use gastown_beads::{AgentBead, BeadsApi};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::manager::PodStore;
use crate::pod::{build_agent_pod, build_workspace_pvc, drift_fingerprint, SpawnOverrides};
use crate::rigs::RigCache;

/// What one reconcile pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Pods created for desired agents with no pod.
    pub created: usize,
    /// Orphan pods deleted.
    pub deleted: usize,
    /// Failed or drifted pods replaced.
    pub recreated: usize,
    /// Desired agents whose pod was already in shape.
    pub unchanged: usize,
}

/// Serial, idempotent desired-vs-actual convergence.
pub struct Reconciler {
    config: Arc<ControllerConfig>,
    beads: Arc<dyn BeadsApi>,
    pods: Arc<dyn PodStore>,
    rigs: Arc<RigCache>,
    pass: Mutex<()>,
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        config: Arc<ControllerConfig>,
        beads: Arc<dyn BeadsApi>,
        pods: Arc<dyn PodStore>,
        rigs: Arc<RigCache>,
    ) -> Self {
        Self {
            config,
            beads,
            pods,
            rigs,
            pass: Mutex::new(()),
        }
    }

    /// Run one reconcile pass.
    ///
    /// # Errors
    ///
    /// Returns an error when the desired pull fails (in which case
    /// nothing was changed), or when a pod operation fails (aborting
    /// the rest of the pass; the next tick retries).
    pub async fn reconcile(&self) -> Result<ReconcileOutcome> {
        let _guard = self.pass.lock().await;

        // Pull desired first; a failure here must not delete anything.
        let desired = self.beads.list_agents().await?;
        let desired_by_pod: HashMap<String, AgentBead> = desired
            .into_iter()
            .map(|bead| (bead.identity.pod_name(), bead))
            .collect();

        let actual = self.pods.list_agent_pods().await?;
        let mut outcome = ReconcileOutcome::default();

        // Delete actual pods with no matching desired bead.
        for pod in &actual {
            let Some(name) = pod.metadata.name.as_deref() else {
                continue;
            };
            if !desired_by_pod.contains_key(name) {
                info!(pod = name, "deleting orphan pod");
                self.pods.delete_pod(name).await?;
                outcome.deleted += 1;
            }
        }

        // Create, replace, or keep each desired pod.
        for (name, bead) in &desired_by_pod {
            let existing = actual
                .iter()
                .find(|p| p.metadata.name.as_deref() == Some(name));

            match existing {
                None => {
                    debug!(pod = %name, "creating pod for desired agent");
                    self.create(bead).await?;
                    outcome.created += 1;
                }
                Some(pod) => match phase_of(pod) {
                    "Failed" => {
                        info!(pod = %name, "replacing failed pod");
                        self.pods.delete_pod(name).await?;
                        self.create(bead).await?;
                        outcome.recreated += 1;
                    }
                    "Pending" | "Running" | "" => {
                        let wanted = self.build(bead);
                        if drift_fingerprint(&wanted) == drift_fingerprint(pod) {
                            outcome.unchanged += 1;
                        } else {
                            info!(pod = %name, "replacing drifted pod");
                            self.pods.delete_pod(name).await?;
                            self.create(bead).await?;
                            outcome.recreated += 1;
                        }
                    }
                    other => {
                        // Succeeded one-shots and the like; leave them
                        // for the status reporter and bead closure
                        debug!(pod = %name, phase = other, "leaving pod as is");
                        outcome.unchanged += 1;
                    }
                },
            }
        }

        info!(
            created = outcome.created,
            deleted = outcome.deleted,
            recreated = outcome.recreated,
            unchanged = outcome.unchanged,
            "reconcile pass complete"
        );
        Ok(outcome)
    }

    fn build(&self, bead: &AgentBead) -> Pod {
        let mut overrides = SpawnOverrides::from_meta(&bead.meta);
        if overrides.image.is_none() {
            overrides.image.clone_from(&bead.image);
        }
        let rig = self.rigs.get(&bead.identity.rig);
        build_agent_pod(
            &self.config,
            &bead.identity,
            rig.as_ref(),
            &self.rigs.gt_rigs_env(),
            &overrides,
        )
    }

    async fn create(&self, bead: &AgentBead) -> Result<()> {
        let pod = self.build(bead);
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| self.config.namespace.clone());
        let rig = self.rigs.get(&bead.identity.rig);
        let workspace = build_workspace_pvc(&bead.identity, rig.as_ref(), &namespace);
        if let Err(e) = self.pods.create_pod(&pod, workspace.as_ref()).await {
            warn!(agent = %bead.identity, error = %e, "pod creation failed");
            return Err(e);
        }
        Ok(())
    }
}

fn phase_of(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}
