//! Git-mirror provisioner.
//!
//! Every rig with an upstream URL gets a read-only in-cluster mirror:
//! a PVC holding the bare clone, a single-replica Deployment running
//! `git daemon` with a periodic fetch loop, and a ClusterIP Service on
//! the git port. All three creations are independently idempotent and
//! never deleted by the controller.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use gastown_beads::RigRecord;

use crate::error::{is_already_exists, Result};
use crate::rigs::RigCache;

/// Port `git daemon` serves on.
pub const GIT_DAEMON_PORT: i32 = 9418;

/// Image running the clone and daemon containers.
const GIT_IMAGE: &str = "alpine/git:v2.45.2";

/// Size of the mirror volume.
const MIRROR_STORAGE: &str = "2Gi";

/// Seconds between upstream fetches.
const FETCH_INTERVAL_SECS: u32 = 300;

/// The mirror resource name for a rig.
#[must_use]
pub fn mirror_name(rig: &str) -> String {
    format!("git-mirror-{rig}")
}

fn mirror_labels(rig: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        "git-mirror".to_string(),
    );
    labels.insert("gastown.io/rig".to_string(), rig.to_string());
    labels
}

/// Build the PVC backing a rig's mirror.
#[must_use]
pub fn build_mirror_pvc(rig: &RigRecord, namespace: &str) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(MIRROR_STORAGE.to_string()));

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(mirror_name(&rig.name)),
            namespace: Some(namespace.to_string()),
            labels: Some(mirror_labels(&rig.name)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the Deployment running the mirror daemon for a rig.
///
/// One replica with a `Recreate` strategy so the bare repository is
/// never written by two daemons at once.
#[must_use]
pub fn build_mirror_deployment(rig: &RigRecord, namespace: &str) -> Deployment {
    let name = mirror_name(&rig.name);
    let labels = mirror_labels(&rig.name);
    let upstream = rig.git_url.clone().unwrap_or_default();

    let clone_script = format!(
        "set -e\n\
         if [ ! -d /mirror/{rig}.git ]; then\n\
         \x20 git clone --bare --mirror {upstream} /mirror/{rig}.git\n\
         fi\n",
        rig = rig.name,
    );
    let daemon_script = format!(
        "git daemon --export-all --base-path=/mirror --reuseaddr --port={GIT_DAEMON_PORT} &\n\
         while true; do\n\
         \x20 sleep {FETCH_INTERVAL_SECS}\n\
         \x20 git --git-dir=/mirror/{rig}.git fetch --prune origin || true\n\
         done\n",
        rig = rig.name,
    );

    let mirror_mount = VolumeMount {
        name: "mirror".to_string(),
        mount_path: "/mirror".to_string(),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![Container {
                        name: "clone".to_string(),
                        image: Some(GIT_IMAGE.to_string()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            clone_script,
                        ]),
                        volume_mounts: Some(vec![mirror_mount.clone()]),
                        ..Default::default()
                    }]),
                    containers: vec![Container {
                        name: "daemon".to_string(),
                        image: Some(GIT_IMAGE.to_string()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            daemon_script,
                        ]),
                        ports: Some(vec![ContainerPort {
                            container_port: GIT_DAEMON_PORT,
                            name: Some("git".to_string()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![mirror_mount]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: "mirror".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: name,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the ClusterIP Service exposing a rig's mirror daemon.
#[must_use]
pub fn build_mirror_service(rig: &RigRecord, namespace: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(mirror_name(&rig.name)),
            namespace: Some(namespace.to_string()),
            labels: Some(mirror_labels(&rig.name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(mirror_labels(&rig.name)),
            ports: Some(vec![ServicePort {
                name: Some("git".to_string()),
                port: GIT_DAEMON_PORT,
                target_port: Some(IntOrString::Int(GIT_DAEMON_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ensures mirror resources exist for every rig with an upstream URL.
pub struct MirrorProvisioner {
    client: Client,
    namespace: String,
}

impl MirrorProvisioner {
    /// Create a provisioner for the given namespace.
    #[must_use]
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Walk the rig cache and ensure mirrors for rigs that need one.
    ///
    /// Failures are logged and skipped; the next sync tick retries.
    /// Successfully provisioned service names are written back into
    /// the cache.
    pub async fn ensure_all(&self, cache: &RigCache) {
        for rig in cache.snapshot() {
            if rig.git_url.is_none() {
                continue;
            }
            match self.ensure(&rig).await {
                Ok(service) => cache.set_mirror_service(&rig.name, service),
                Err(e) => {
                    warn!(rig = %rig.name, error = %e, "mirror provisioning failed");
                }
            }
        }
    }

    /// Ensure PVC, Deployment, and Service for one rig, returning the
    /// service name.
    ///
    /// # Errors
    ///
    /// Returns an error on any Kubernetes API failure other than
    /// `AlreadyExists`.
    pub async fn ensure(&self, rig: &RigRecord) -> Result<String> {
        let name = mirror_name(&rig.name);

        let pvcs: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &self.namespace);
        create_ignoring_conflict(&pvcs, &build_mirror_pvc(rig, &self.namespace), &name).await?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        create_ignoring_conflict(
            &deployments,
            &build_mirror_deployment(rig, &self.namespace),
            &name,
        )
        .await?;

        let services: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        create_ignoring_conflict(&services, &build_mirror_service(rig, &self.namespace), &name)
            .await?;

        info!(rig = %rig.name, service = name.as_str(), "git mirror ready");
        Ok(name)
    }
}

async fn create_ignoring_conflict<K>(api: &Api<K>, resource: &K, name: &str) -> Result<()>
where
    K: Clone + std::fmt::Debug + serde::Serialize + serde::de::DeserializeOwned,
{
    match api.create(&PostParams::default(), resource).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => {
            debug!(resource = name, "mirror resource already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
