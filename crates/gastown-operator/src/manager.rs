//! Idempotent pod CRUD against the Kubernetes API.
//!
//! The manager executes lifecycle decisions, it never makes them.
//! Workspace PVCs are ensured before the pod that references them;
//! `AlreadyExists` is success on both the PVC and pod create paths so
//! duplicate events stay harmless.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, info};

use crate::error::{is_already_exists, is_not_found, OperatorError, Result};
use crate::pod::{has_agent_labels, APP_LABEL, APP_NAME};

/// Pod storage interface used by the reconciler, dispatcher, and
/// reporter. Implemented by the kube-backed [`PodManager`] and an
/// in-memory mock for tests.
#[async_trait]
pub trait PodStore: Send + Sync {
    /// Create a pod, ensuring its workspace PVC first when given.
    ///
    /// Both creations treat `AlreadyExists` as success.
    ///
    /// # Errors
    ///
    /// Returns an error on any other Kubernetes API failure.
    async fn create_pod(
        &self,
        pod: &Pod,
        workspace: Option<&PersistentVolumeClaim>,
    ) -> Result<()>;

    /// Delete a pod by name.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::PodNotFound`] when the pod does not
    /// exist; callers decide whether that matters.
    async fn delete_pod(&self, name: &str) -> Result<()>;

    /// List pods carrying the full agent label set.
    ///
    /// Pods with the app label but without the agent identity labels
    /// (the controller itself, unrelated infrastructure) are filtered
    /// out and never surfaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the list call fails.
    async fn list_agent_pods(&self) -> Result<Vec<Pod>>;

    /// Fetch a pod by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the get call fails.
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;
}

/// Kubernetes-backed pod store for one namespace.
pub struct PodManager {
    client: Client,
    namespace: String,
}

impl PodManager {
    /// Create a manager for the given namespace.
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn ensure_workspace(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        let name = pvc.metadata.name.as_deref().unwrap_or_default();
        match self.pvcs().create(&PostParams::default(), pvc).await {
            Ok(_) => {
                info!(pvc = name, "created workspace PVC");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!(pvc = name, "workspace PVC already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PodStore for PodManager {
    async fn create_pod(
        &self,
        pod: &Pod,
        workspace: Option<&PersistentVolumeClaim>,
    ) -> Result<()> {
        if let Some(pvc) = workspace {
            self.ensure_workspace(pvc).await?;
        }

        let name = pod.metadata.name.as_deref().unwrap_or_default();
        match self.pods().create(&PostParams::default(), pod).await {
            Ok(_) => {
                info!(pod = name, "created agent pod");
                Ok(())
            }
            Err(e) if is_already_exists(&e) => {
                debug!(pod = name, "pod already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = name, "deleted agent pod");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Err(OperatorError::PodNotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_agent_pods(&self) -> Result<Vec<Pod>> {
        let params = ListParams::default().labels(&format!("{APP_LABEL}={APP_NAME}"));
        let list = self.pods().list(&params).await?;
        Ok(list.items.into_iter().filter(has_agent_labels).collect())
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods().get_opt(name).await?)
    }
}

/// An in-memory pod store for testing without a cluster.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::{has_agent_labels, OperatorError, PersistentVolumeClaim, Pod, PodStore, Result};
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::PodStatus;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Pod store backed by a map, with phase control and a deletion
    /// log for invariant checks.
    #[derive(Default)]
    pub struct MockPodStore {
        pods: Mutex<BTreeMap<String, Pod>>,
        pvcs: Mutex<BTreeMap<String, PersistentVolumeClaim>>,
        deleted: Mutex<Vec<String>>,
        fail_creates: Mutex<bool>,
    }

    impl MockPodStore {
        /// Create an empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Insert a pod directly, bypassing create bookkeeping.
        pub fn insert_pod(&self, pod: Pod) {
            let name = pod.metadata.name.clone().unwrap_or_default();
            self.pods.lock().insert(name, pod);
        }

        /// Set a pod's phase.
        pub fn set_phase(&self, name: &str, phase: &str) {
            if let Some(pod) = self.pods.lock().get_mut(name) {
                pod.status = Some(PodStatus {
                    phase: Some(phase.to_string()),
                    ..pod.status.clone().unwrap_or_default()
                });
            }
        }

        /// Make subsequent creates fail.
        pub fn set_fail_creates(&self, fail: bool) {
            *self.fail_creates.lock() = fail;
        }

        /// Names of all pods currently in the store, sorted.
        #[must_use]
        pub fn pod_names(&self) -> Vec<String> {
            self.pods.lock().keys().cloned().collect()
        }

        /// Whether a pod exists.
        #[must_use]
        pub fn contains(&self, name: &str) -> bool {
            self.pods.lock().contains_key(name)
        }

        /// Fetch a pod by name.
        #[must_use]
        pub fn get(&self, name: &str) -> Option<Pod> {
            self.pods.lock().get(name).cloned()
        }

        /// The phase of a pod, if set.
        #[must_use]
        pub fn phase(&self, name: &str) -> Option<String> {
            self.pods
                .lock()
                .get(name)
                .and_then(|p| p.status.as_ref())
                .and_then(|s| s.phase.clone())
        }

        /// Every delete call made so far, in order.
        #[must_use]
        pub fn deleted_log(&self) -> Vec<String> {
            self.deleted.lock().clone()
        }

        /// Names of workspace PVCs ensured so far, sorted.
        #[must_use]
        pub fn pvc_names(&self) -> Vec<String> {
            self.pvcs.lock().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl PodStore for MockPodStore {
        async fn create_pod(
            &self,
            pod: &Pod,
            workspace: Option<&PersistentVolumeClaim>,
        ) -> Result<()> {
            if *self.fail_creates.lock() {
                return Err(OperatorError::Config("simulated create failure".to_string()));
            }
            if let Some(pvc) = workspace {
                let name = pvc.metadata.name.clone().unwrap_or_default();
                // AlreadyExists is success
                self.pvcs.lock().entry(name).or_insert_with(|| pvc.clone());
            }
            let name = pod.metadata.name.clone().unwrap_or_default();
            let mut pods = self.pods.lock();
            if pods.contains_key(&name) {
                return Ok(());
            }
            let mut pod = pod.clone();
            pod.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            });
            pods.insert(name, pod);
            Ok(())
        }

        async fn delete_pod(&self, name: &str) -> Result<()> {
            self.deleted.lock().push(name.to_string());
            if self.pods.lock().remove(name).is_none() {
                return Err(OperatorError::PodNotFound(name.to_string()));
            }
            Ok(())
        }

        async fn list_agent_pods(&self) -> Result<Vec<Pod>> {
            Ok(self
                .pods
                .lock()
                .values()
                .filter(|p| has_agent_labels(p))
                .cloned()
                .collect())
        }

        async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
            Ok(self.pods.lock().get(name).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPodStore;
    use super::*;
    use crate::config::ControllerConfig;
    use crate::pod::{build_agent_pod, build_workspace_pvc, SpawnOverrides};
    use gastown_core::{AgentId, Role};

    fn crew_pod_and_pvc() -> (Pod, Option<PersistentVolumeClaim>) {
        let config = ControllerConfig::default();
        let id = AgentId::new("gastown", Role::Crew, "nux");
        let pod = build_agent_pod(&config, &id, None, "", &SpawnOverrides::default());
        let pvc = build_workspace_pvc(&id, None, &config.namespace);
        (pod, pvc)
    }

    #[tokio::test]
    async fn create_is_idempotent_on_name() {
        let store = MockPodStore::new();
        let (pod, pvc) = crew_pod_and_pvc();

        store.create_pod(&pod, pvc.as_ref()).await.unwrap();
        store.create_pod(&pod, pvc.as_ref()).await.unwrap();

        assert_eq!(store.pod_names(), vec!["gt-gastown-crew-nux".to_string()]);
        assert_eq!(store.pvc_names(), vec!["gt-gastown-crew-nux-ws".to_string()]);
    }

    #[tokio::test]
    async fn delete_missing_pod_is_a_typed_error() {
        let store = MockPodStore::new();
        let err = store.delete_pod("gt-nowhere-crew-x").await.unwrap_err();
        assert!(matches!(err, OperatorError::PodNotFound(_)));
    }

    #[tokio::test]
    async fn listing_filters_foreign_pods() {
        let store = MockPodStore::new();
        let (pod, _) = crew_pod_and_pvc();
        store.insert_pod(pod);

        // a pod with only the app label, like the controller itself
        let mut foreign = Pod::default();
        foreign.metadata.name = Some("gastown-controller".to_string());
        let mut labels = std::collections::BTreeMap::new();
        labels.insert(APP_LABEL.to_string(), APP_NAME.to_string());
        foreign.metadata.labels = Some(labels);
        store.insert_pod(foreign);

        let listed = store.list_agent_pods().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].metadata.name.as_deref(),
            Some("gt-gastown-crew-nux")
        );
    }
}
