//! In-memory rig cache.
//!
//! Refreshed at startup and on every sync tick from the control
//! plane. A failed refresh keeps the previous entries; entries only
//! disappear when the control plane stops returning them. The mirror
//! provisioner writes discovered service names back so the spec
//! builder can wire init clone containers.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};

use gastown_beads::{BeadsApi, RigRecord};

use crate::error::Result;

/// Shared map of rig name to rig metadata.
#[derive(Debug, Default)]
pub struct RigCache {
    entries: RwLock<HashMap<String, RigRecord>>,
}

impl RigCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refresh the cache from the control plane.
    ///
    /// On success the entry set is replaced wholesale, except that a
    /// mirror service name discovered by the provisioner survives a
    /// refresh that does not carry one. On failure the previous
    /// entries stay untouched.
    ///
    /// # Errors
    ///
    /// Returns the underlying control-plane error after logging it.
    pub async fn refresh(&self, beads: &dyn BeadsApi) -> Result<()> {
        let rigs = match beads.list_rigs().await {
            Ok(rigs) => rigs,
            Err(e) => {
                warn!(error = %e, "rig refresh failed, keeping previous entries");
                return Err(e.into());
            }
        };

        let mut entries = self.entries.write();
        let mut fresh: HashMap<String, RigRecord> = HashMap::with_capacity(rigs.len());
        for mut rig in rigs {
            if rig.git_mirror.is_none() {
                if let Some(previous) = entries.get(&rig.name) {
                    rig.git_mirror.clone_from(&previous.git_mirror);
                }
            }
            fresh.insert(rig.name.clone(), rig);
        }
        debug!(rigs = fresh.len(), "refreshed rig cache");
        *entries = fresh;
        Ok(())
    }

    /// Look up one rig.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<RigRecord> {
        self.entries.read().get(name).cloned()
    }

    /// Record the in-cluster mirror service for a rig.
    pub fn set_mirror_service(&self, name: &str, service: impl Into<String>) {
        if let Some(rig) = self.entries.write().get_mut(name) {
            rig.git_mirror = Some(service.into());
        }
    }

    /// All entries, sorted by rig name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RigRecord> {
        let mut rigs: Vec<RigRecord> = self.entries.read().values().cloned().collect();
        rigs.sort_by(|a, b| a.name.cmp(&b.name));
        rigs
    }

    /// The aggregated `GT_RIGS` value injected into agent pods:
    /// comma-joined `name=git_url` pairs, bare names for rigs without
    /// an upstream, sorted by name.
    #[must_use]
    pub fn gt_rigs_env(&self) -> String {
        let parts: Vec<String> = self
            .snapshot()
            .into_iter()
            .map(|rig| match rig.git_url {
                Some(url) => format!("{}={url}", rig.name),
                None => rig.name,
            })
            .collect();
        parts.join(",")
    }

    /// Number of cached rigs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gastown_beads::MockBeads;

    fn rig(name: &str, git_url: Option<&str>) -> RigRecord {
        RigRecord {
            name: name.to_string(),
            git_url: git_url.map(ToString::to_string),
            ..RigRecord::default()
        }
    }

    #[tokio::test]
    async fn refresh_replaces_entries() {
        let beads = MockBeads::new();
        let cache = RigCache::new();

        beads.set_rigs(vec![rig("gastown", Some("https://g/g.git")), rig("citadel", None)]);
        cache.refresh(&beads).await.unwrap();
        assert_eq!(cache.len(), 2);

        beads.set_rigs(vec![rig("gastown", Some("https://g/g.git"))]);
        cache.refresh(&beads).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get("citadel").is_none());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_entries() {
        let beads = MockBeads::new();
        let cache = RigCache::new();

        beads.set_rigs(vec![rig("gastown", None)]);
        cache.refresh(&beads).await.unwrap();

        beads.set_fail_lists(true);
        assert!(cache.refresh(&beads).await.is_err());
        assert_eq!(cache.len(), 1);
        assert!(cache.get("gastown").is_some());
    }

    #[tokio::test]
    async fn mirror_service_survives_refresh() {
        let beads = MockBeads::new();
        let cache = RigCache::new();

        beads.set_rigs(vec![rig("gastown", Some("https://g/g.git"))]);
        cache.refresh(&beads).await.unwrap();
        cache.set_mirror_service("gastown", "git-mirror-gastown");

        cache.refresh(&beads).await.unwrap();
        assert_eq!(
            cache.get("gastown").unwrap().git_mirror.as_deref(),
            Some("git-mirror-gastown")
        );

        // an explicit mirror label from the control plane wins
        let mut labeled = rig("gastown", Some("https://g/g.git"));
        labeled.git_mirror = Some("external-mirror".to_string());
        beads.set_rigs(vec![labeled]);
        cache.refresh(&beads).await.unwrap();
        assert_eq!(
            cache.get("gastown").unwrap().git_mirror.as_deref(),
            Some("external-mirror")
        );
    }

    #[tokio::test]
    async fn gt_rigs_env_format() {
        let beads = MockBeads::new();
        let cache = RigCache::new();
        assert_eq!(cache.gt_rigs_env(), "");

        beads.set_rigs(vec![
            rig("gastown", Some("https://g/g.git")),
            rig("citadel", None),
        ]);
        cache.refresh(&beads).await.unwrap();
        assert_eq!(cache.gt_rigs_env(), "citadel,gastown=https://g/g.git");
    }
}
