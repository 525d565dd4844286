//! Status reporting back to the control plane.
//!
//! Translates observed pod phases into agent lifecycle states and
//! writes them, plus backend connection metadata, into bead notes.
//! Every report is best-effort: failures are logged and counted, never
//! propagated into pod operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use gastown_beads::{render_notes, BeadsApi};
use gastown_core::AgentId;

use crate::config::ControllerConfig;
use crate::error::{OperatorError, Result};
use crate::manager::PodStore;
use crate::pod::{identity_from_pod, COOP_HTTP_PORT};

/// Backend connection metadata written to a bead's notes.
///
/// Empty fields are omitted; a payload with no remaining fields is a
/// no-op and produces no control-plane call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendMeta {
    /// Backend kind, `coop` when a coop surface is reachable.
    pub backend: String,
    /// Pod name callers connect to.
    pub pod_name: String,
    /// Namespace the pod runs in.
    pub pod_namespace: String,
    /// Coop HTTP endpoint.
    pub coop_url: String,
    /// Token for the coop endpoint.
    pub coop_token: String,
}

impl BackendMeta {
    /// Render the non-empty fields as notes lines.
    #[must_use]
    pub fn to_notes(&self) -> String {
        render_notes([
            ("backend", self.backend.as_str()),
            ("pod_name", self.pod_name.as_str()),
            ("pod_namespace", self.pod_namespace.as_str()),
            ("coop_url", self.coop_url.as_str()),
            ("coop_token", self.coop_token.as_str()),
        ])
    }
}

/// The in-cluster coop URL for an agent pod.
#[must_use]
pub fn coop_url(pod_name: &str, namespace: &str) -> String {
    format!("http://{pod_name}.{namespace}.svc.cluster.local:{COOP_HTTP_PORT}")
}

/// Counters kept by the reporter, logged as a snapshot on every sync
/// tick.
#[derive(Debug, Default)]
pub struct ReporterMetrics {
    reports: AtomicU64,
    report_errors: AtomicU64,
    sync_runs: AtomicU64,
    sync_errors: AtomicU64,
}

/// A point-in-time copy of the reporter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Status reports attempted.
    pub reports: u64,
    /// Status reports that failed.
    pub report_errors: u64,
    /// Sync passes run.
    pub sync_runs: u64,
    /// Sync passes that failed outright or partially.
    pub sync_errors: u64,
}

impl ReporterMetrics {
    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reports: self.reports.load(Ordering::Relaxed),
            report_errors: self.report_errors.load(Ordering::Relaxed),
            sync_runs: self.sync_runs.load(Ordering::Relaxed),
            sync_errors: self.sync_errors.load(Ordering::Relaxed),
        }
    }
}

/// Writes lifecycle state and backend metadata through the beads
/// client.
pub struct StatusReporter {
    beads: Arc<dyn BeadsApi>,
    pods: Arc<dyn PodStore>,
    namespace: String,
    town: String,
    metrics: ReporterMetrics,
}

impl StatusReporter {
    /// Create a reporter.
    #[must_use]
    pub fn new(
        config: &ControllerConfig,
        beads: Arc<dyn BeadsApi>,
        pods: Arc<dyn PodStore>,
    ) -> Self {
        Self {
            beads,
            pods,
            namespace: config.namespace.clone(),
            town: config.town.clone(),
            metrics: ReporterMetrics::default(),
        }
    }

    /// Report the lifecycle state for an observed pod phase.
    ///
    /// Phase mapping: `Pending` is `spawning`, `Running` is `working`,
    /// `Succeeded` is `done`, `Failed` is `failed`; anything else is
    /// skipped. A `failed` report additionally files a bug bead with
    /// the pod name, namespace, and last message. Best-effort: errors
    /// are counted and logged, never returned.
    pub async fn report_pod_status(&self, id: &AgentId, phase: &str, message: Option<&str>) {
        if let Err(e) = self.try_report_phase(id, phase, message).await {
            self.metrics.report_errors.fetch_add(1, Ordering::Relaxed);
            warn!(agent = %id, phase, error = %e, "status report failed");
        }
    }

    /// Report a lifecycle state directly, with an optional restart
    /// reason. Best-effort.
    pub async fn report_state(&self, id: &AgentId, state: &str, restart_reason: Option<&str>) {
        if let Err(e) = self.try_report_state(id, state, restart_reason).await {
            self.metrics.report_errors.fetch_add(1, Ordering::Relaxed);
            warn!(agent = %id, state, error = %e, "status report failed");
        }
    }

    /// Write backend connection metadata to the bead's notes.
    ///
    /// An entirely empty payload is a no-op, used to clear metadata on
    /// teardown. Best-effort.
    pub async fn report_backend(&self, id: &AgentId, meta: &BackendMeta) {
        let notes = meta.to_notes();
        if notes.is_empty() {
            debug!(agent = %id, "empty backend payload, skipping write");
            return;
        }
        self.metrics.reports.fetch_add(1, Ordering::Relaxed);
        let bead = id.bead_id(&self.town);
        if let Err(e) = self.beads.update_notes(&bead, &notes).await {
            self.metrics.report_errors.fetch_add(1, Ordering::Relaxed);
            warn!(agent = %id, error = %e, "backend metadata report failed");
        }
    }

    /// Report status for every agent pod in the namespace.
    ///
    /// Per-pod failures are collected, not fatal; the aggregate comes
    /// back as [`OperatorError::SyncIncomplete`].
    ///
    /// # Errors
    ///
    /// Returns an error when the pod list fails or any per-pod report
    /// failed.
    pub async fn sync_all(&self) -> Result<()> {
        self.metrics.sync_runs.fetch_add(1, Ordering::Relaxed);

        let pods = match self.pods.list_agent_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                self.metrics.sync_errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        let total = pods.len();
        let mut failed = 0;
        for pod in pods {
            let Some(id) = identity_from_pod(&pod) else {
                // listing already filters these; a race is harmless
                continue;
            };
            let status = pod.status.as_ref();
            let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or_default();
            let message = status.and_then(|s| s.message.as_deref());
            if let Err(e) = self.try_report_phase(&id, phase, message).await {
                warn!(agent = %id, error = %e, "sync report failed");
                failed += 1;
            }
        }

        if failed > 0 {
            self.metrics.sync_errors.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .report_errors
                .fetch_add(failed as u64, Ordering::Relaxed);
            return Err(OperatorError::SyncIncomplete { failed, total });
        }
        Ok(())
    }

    /// Current counter values.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn try_report_phase(
        &self,
        id: &AgentId,
        phase: &str,
        message: Option<&str>,
    ) -> Result<()> {
        let state = match phase {
            "Pending" => "spawning",
            "Running" => "working",
            "Succeeded" => "done",
            "Failed" => "failed",
            other => {
                debug!(agent = %id, phase = other, "skipping report for unmapped phase");
                return Ok(());
            }
        };

        self.try_report_state(id, state, None).await?;

        if state == "failed" {
            let pod_name = id.pod_name();
            let description = format!(
                "pod {pod_name} in namespace {} failed: {}",
                self.namespace,
                message.unwrap_or("no message"),
            );
            self.beads
                .create_bug(&format!("agent pod failed: {pod_name}"), &description)
                .await?;
        }
        Ok(())
    }

    async fn try_report_state(
        &self,
        id: &AgentId,
        state: &str,
        restart_reason: Option<&str>,
    ) -> Result<()> {
        self.metrics.reports.fetch_add(1, Ordering::Relaxed);
        let bead = id.bead_id(&self.town);
        let notes = render_notes([
            ("state", state),
            ("restart_reason", restart_reason.unwrap_or_default()),
        ]);
        self.beads.update_notes(&bead, &notes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::mock::MockPodStore;
    use crate::pod::{build_agent_pod, SpawnOverrides};
    use gastown_beads::MockBeads;
    use gastown_core::Role;

    fn reporter() -> (Arc<MockBeads>, Arc<MockPodStore>, StatusReporter) {
        let beads = Arc::new(MockBeads::new());
        let pods = Arc::new(MockPodStore::new());
        let config = ControllerConfig::default();
        let reporter = StatusReporter::new(
            &config,
            Arc::clone(&beads) as Arc<dyn BeadsApi>,
            Arc::clone(&pods) as Arc<dyn PodStore>,
        );
        (beads, pods, reporter)
    }

    fn mayor() -> AgentId {
        AgentId::new("gastown", Role::Mayor, "hq")
    }

    #[tokio::test]
    async fn phase_mapping_writes_state_notes() {
        let (beads, _, reporter) = reporter();
        let id = mayor();

        reporter.report_pod_status(&id, "Pending", None).await;
        reporter.report_pod_status(&id, "Running", None).await;
        reporter.report_pod_status(&id, "Succeeded", None).await;
        reporter.report_pod_status(&id, "Unknown", None).await;

        let log = beads.notes_log();
        assert_eq!(
            log,
            vec![
                ("hq-mayor".to_string(), "state: spawning\n".to_string()),
                ("hq-mayor".to_string(), "state: working\n".to_string()),
                ("hq-mayor".to_string(), "state: done\n".to_string()),
            ]
        );
        assert!(beads.bugs_filed().is_empty());
    }

    #[tokio::test]
    async fn failed_phase_files_a_bug() {
        let (beads, _, reporter) = reporter();
        let id = AgentId::new("gastown", Role::Crew, "nux");

        reporter
            .report_pod_status(&id, "Failed", Some("OOMKilled"))
            .await;

        let bugs = beads.bugs_filed();
        assert_eq!(bugs.len(), 1);
        assert!(bugs[0].0.contains("gt-gastown-crew-nux"));
        assert!(bugs[0].1.contains("namespace gastown"));
        assert!(bugs[0].1.contains("OOMKilled"));

        let log = beads.notes_log();
        assert_eq!(log[0].1, "state: failed\n");
    }

    #[tokio::test]
    async fn restart_reason_is_included() {
        let (beads, _, reporter) = reporter();
        reporter
            .report_state(&mayor(), "spawning", Some("stuck"))
            .await;
        assert_eq!(
            beads.notes_log()[0].1,
            "state: spawning\nrestart_reason: stuck\n"
        );
    }

    #[tokio::test]
    async fn backend_metadata_omits_empty_fields() {
        let (beads, _, reporter) = reporter();
        let id = mayor();

        let meta = BackendMeta {
            backend: "coop".to_string(),
            pod_name: "gt-gastown-mayor-hq".to_string(),
            pod_namespace: "gastown".to_string(),
            coop_url: coop_url("gt-gastown-mayor-hq", "gastown"),
            coop_token: String::new(),
        };
        reporter.report_backend(&id, &meta).await;

        let log = beads.notes_log();
        assert_eq!(log.len(), 1);
        let notes = &log[0].1;
        assert!(notes.contains("backend: coop\n"));
        assert!(notes.contains(
            "coop_url: http://gt-gastown-mayor-hq.gastown.svc.cluster.local:8080\n"
        ));
        assert!(!notes.contains("coop_token"));
    }

    #[tokio::test]
    async fn empty_backend_payload_is_a_no_op() {
        let (beads, _, reporter) = reporter();
        reporter
            .report_backend(&mayor(), &BackendMeta::default())
            .await;
        assert!(beads.notes_log().is_empty());
    }

    #[tokio::test]
    async fn sync_all_reports_every_agent_pod() {
        let (beads, pods, reporter) = reporter();
        let config = ControllerConfig::default();

        for (role, agent) in [(Role::Mayor, "hq"), (Role::Crew, "nux")] {
            let id = AgentId::new("gastown", role, agent);
            let pod = build_agent_pod(&config, &id, None, "", &SpawnOverrides::default());
            pods.insert_pod(pod);
        }
        pods.set_phase("gt-gastown-mayor-hq", "Running");
        pods.set_phase("gt-gastown-crew-nux", "Pending");

        reporter.sync_all().await.unwrap();

        let mut log = beads.notes_log();
        log.sort();
        assert_eq!(
            log,
            vec![
                ("gastown-crew-nux".to_string(), "state: spawning\n".to_string()),
                ("hq-mayor".to_string(), "state: working\n".to_string()),
            ]
        );

        let metrics = reporter.metrics();
        assert_eq!(metrics.sync_runs, 1);
        assert_eq!(metrics.reports, 2);
        assert_eq!(metrics.report_errors, 0);
    }

    #[tokio::test]
    async fn skipped_phases_do_not_count_as_reports() {
        let (beads, _, reporter) = reporter();
        reporter.report_pod_status(&mayor(), "Unknown", None).await;
        reporter.report_pod_status(&mayor(), "", None).await;

        assert!(beads.notes_log().is_empty());
        assert_eq!(reporter.metrics().report_errors, 0);
    }
}
