//! Pod specification builder for agent pods.
//!
//! A pure function from (controller config, rig cache entry, per-event
//! overrides, agent identity) to a complete pod spec. Layered merge
//! order, later wins: role defaults, rig defaults, controller-wide
//! config, per-event overrides. Secret-sourced env entries are
//! appended last and never overwrite an existing name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ExecAction, HTTPGetAction, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec, Probe,
    ResourceRequirements, SecretKeySelector, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use gastown_beads::RigRecord;
use gastown_core::{AgentId, Role};

use crate::config::{ControllerConfig, CoopPlacement};
use crate::mirror::GIT_DAEMON_PORT;

/// Standard app label key.
pub const APP_LABEL: &str = "app.kubernetes.io/name";
/// App label value for agent pods.
pub const APP_NAME: &str = "gastown-agent";
/// Rig identity label.
pub const RIG_LABEL: &str = "gastown.io/rig";
/// Role identity label.
pub const ROLE_LABEL: &str = "gastown.io/role";
/// Agent identity label.
pub const AGENT_LABEL: &str = "gastown.io/agent";

/// Coop HTTP port, also the port callers connect to.
pub const COOP_HTTP_PORT: i32 = 8080;
/// Coop control port.
pub const COOP_CONTROL_PORT: i32 = 9090;

const AGENT_CONTAINER: &str = "agent";
const COOP_CONTAINER: &str = "coop";
const CLONE_CONTAINER: &str = "clone-rig";

/// Per-event metadata overrides applied on top of the controller-wide
/// configuration. Built either from a bead's notes bag or from a
/// mutation event's labels; both use the same key names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnOverrides {
    /// Target namespace override.
    pub namespace: Option<String>,
    /// Agent image override.
    pub image: Option<String>,
    /// Daemon host override.
    pub daemon_host: Option<String>,
    /// Daemon port override.
    pub daemon_port: Option<u16>,
    /// Service account for the pod.
    pub service_account: Option<String>,
    /// Config map mounted into the pod.
    pub config_map: Option<String>,
    /// Secret holding the agent API key.
    pub api_key_secret: Option<String>,
    /// Key (and env name) of the API key within the secret.
    pub api_key_key: Option<String>,
    /// NATS URL for the coop sidecar.
    pub coop_nats_url: Option<String>,
    /// Secret with coop NATS auth material (`auth` key).
    pub coop_nats_auth_secret: Option<String>,
    /// Secret with the coop NATS token (`token` key).
    pub coop_nats_token_secret: Option<String>,
}

impl SpawnOverrides {
    /// Build overrides from a `key: value` metadata bag.
    #[must_use]
    pub fn from_meta(meta: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| meta.get(key).filter(|v| !v.is_empty()).cloned();

        Self {
            namespace: get("namespace"),
            image: get("image"),
            daemon_host: get("daemon_host"),
            daemon_port: meta.get("daemon_port").and_then(|v| v.parse().ok()),
            service_account: get("service_account"),
            config_map: get("config_map"),
            api_key_secret: get("api_key_secret"),
            api_key_key: get("api_key_key"),
            coop_nats_url: get("coop_nats_url"),
            coop_nats_auth_secret: get("coop_nats_auth_secret"),
            coop_nats_token_secret: get("coop_nats_token_secret"),
        }
    }
}

/// The label set identifying a managed agent pod.
#[must_use]
pub fn agent_labels(id: &AgentId) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(APP_LABEL.to_string(), APP_NAME.to_string());
    labels.insert(RIG_LABEL.to_string(), id.rig.clone());
    labels.insert(ROLE_LABEL.to_string(), id.role.to_string());
    labels.insert(AGENT_LABEL.to_string(), id.agent.clone());
    labels
}

/// Whether a pod carries the full agent label set.
///
/// The controller must never touch a pod without it; this is the guard
/// that keeps the reconciler away from the controller's own pod and
/// unrelated infrastructure.
#[must_use]
pub fn has_agent_labels(pod: &Pod) -> bool {
    identity_from_pod(pod).is_some()
}

/// Derive the agent identity from a pod's labels.
#[must_use]
pub fn identity_from_pod(pod: &Pod) -> Option<AgentId> {
    let labels = pod.metadata.labels.as_ref()?;
    if labels.get(APP_LABEL).map(String::as_str) != Some(APP_NAME) {
        return None;
    }
    let rig = labels.get(RIG_LABEL)?;
    let role = labels.get(ROLE_LABEL)?;
    let agent = labels.get(AGENT_LABEL)?;
    AgentId::from_parts(rig, role, agent).ok()
}

/// The workspace PVC name for an agent.
#[must_use]
pub fn workspace_pvc_name(id: &AgentId) -> String {
    format!("{}-ws", id.pod_name())
}

/// The image whose change forces a pod replacement.
///
/// A coop sidecar is the reference when present; otherwise the
/// toolchain init container. Pods with neither never drift.
#[must_use]
pub fn drift_fingerprint(pod: &Pod) -> Option<String> {
    let spec = pod.spec.as_ref()?;
    if let Some(coop) = spec.containers.iter().find(|c| c.name == COOP_CONTAINER) {
        return coop.image.clone();
    }
    spec.init_containers
        .as_ref()?
        .iter()
        .find(|c| c.name == CLONE_CONTAINER)
        .and_then(|c| c.image.clone())
}

/// Workspace size in Gi for persistent roles.
const fn workspace_gi(role: Role) -> Option<u8> {
    match role {
        Role::Crew => Some(10),
        Role::Witness | Role::Refinery => Some(5),
        Role::Polecat | Role::Mayor | Role::Deacon => None,
    }
}

/// Role resource defaults in (cpu millicores, memory Mi), requests
/// then limits.
const fn role_resources(role: Role) -> (u32, u32, u32, u32) {
    match role {
        Role::Polecat | Role::Mayor => (250, 512, 2000, 4096),
        Role::Crew | Role::Refinery => (500, 1024, 4000, 8192),
        Role::Witness => (100, 256, 1000, 1024),
        Role::Deacon => (100, 256, 1000, 2048),
    }
}

/// Build the workspace PVC for an agent, when its role keeps one.
///
/// The claim must exist before the first pod referencing it; creation
/// is idempotent on the manager side.
#[must_use]
pub fn build_workspace_pvc(
    id: &AgentId,
    rig: Option<&RigRecord>,
    namespace: &str,
) -> Option<PersistentVolumeClaim> {
    let size = workspace_gi(id.role)?;
    let storage_class = rig.and_then(|r| r.storage_class.clone());

    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(format!("{size}Gi")));

    Some(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(workspace_pvc_name(id)),
            namespace: Some(namespace.to_string()),
            labels: Some(agent_labels(id)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: storage_class,
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the complete pod spec for an agent.
///
/// `gt_rigs` is the aggregated rig summary derived from the rig cache
/// and injected as `GT_RIGS`.
#[must_use]
pub fn build_agent_pod(
    config: &ControllerConfig,
    id: &AgentId,
    rig: Option<&RigRecord>,
    gt_rigs: &str,
    overrides: &SpawnOverrides,
) -> Pod {
    let pod_name = id.pod_name();
    let namespace = overrides
        .namespace
        .clone()
        .unwrap_or_else(|| config.namespace.clone());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        "gastown.io/created-at".to_string(),
        chrono::Utc::now().to_rfc3339(),
    );

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            namespace: Some(namespace),
            labels: Some(agent_labels(id)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(build_pod_spec(config, id, rig, gt_rigs, overrides)),
        ..Default::default()
    }
}

fn build_pod_spec(
    config: &ControllerConfig,
    id: &AgentId,
    rig: Option<&RigRecord>,
    gt_rigs: &str,
    overrides: &SpawnOverrides,
) -> PodSpec {
    let sidecar = config.coop == CoopPlacement::Sidecar;
    let (volumes, mounts) = build_volumes(config, id, overrides);

    let mut containers = vec![build_agent_container(
        config,
        id,
        rig,
        gt_rigs,
        overrides,
        mounts.clone(),
    )];
    if sidecar {
        containers.push(build_coop_sidecar(config, overrides, mounts));
    }

    let init_containers = build_clone_container(config, id, rig);

    let restart_policy = if id.role.is_one_shot() {
        "Never"
    } else {
        "Always"
    };

    PodSpec {
        containers,
        init_containers: init_containers.map(|c| vec![c]),
        volumes: Some(volumes),
        restart_policy: Some(restart_policy.to_string()),
        termination_grace_period_seconds: Some(30),
        security_context: Some(build_pod_security_context()),
        service_account_name: overrides.service_account.clone(),
        // a coop sidecar watches the agent process directly
        share_process_namespace: sidecar.then_some(true),
        ..Default::default()
    }
}

fn build_volumes(
    config: &ControllerConfig,
    id: &AgentId,
    overrides: &SpawnOverrides,
) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    let workspace_source = if id.role.is_persistent() {
        Volume {
            name: "workspace".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: workspace_pvc_name(id),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: "workspace".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    };
    volumes.push(workspace_source);
    mounts.push(VolumeMount {
        name: "workspace".to_string(),
        mount_path: "/workspace".to_string(),
        ..Default::default()
    });

    volumes.push(Volume {
        name: "tmp".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    mounts.push(VolumeMount {
        name: "tmp".to_string(),
        mount_path: "/tmp".to_string(),
        ..Default::default()
    });

    if let Some(secret) = &config.credentials_secret {
        volumes.push(Volume {
            name: "credentials".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "credentials".to_string(),
            mount_path: "/etc/gastown/credentials".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    if let Some(config_map) = &overrides.config_map {
        volumes.push(Volume {
            name: "config".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: config_map.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(VolumeMount {
            name: "config".to_string(),
            mount_path: "/etc/gastown/config".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }

    (volumes, mounts)
}

fn build_agent_container(
    config: &ControllerConfig,
    id: &AgentId,
    rig: Option<&RigRecord>,
    gt_rigs: &str,
    overrides: &SpawnOverrides,
    mounts: Vec<VolumeMount>,
) -> Container {
    let image = overrides
        .image
        .clone()
        .or_else(|| rig.and_then(|r| r.image.clone()))
        .unwrap_or_else(|| config.default_image.clone());

    let env = build_env(config, id, gt_rigs, overrides);

    let builtin = config.coop == CoopPlacement::Builtin;
    let ports = builtin.then(|| {
        vec![
            ContainerPort {
                container_port: COOP_HTTP_PORT,
                name: Some("http".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: COOP_CONTROL_PORT,
                name: Some("control".to_string()),
                ..Default::default()
            },
        ]
    });

    let (readiness, liveness) = if builtin {
        (
            http_probe("/healthz", COOP_HTTP_PORT, 5, 10),
            http_probe("/healthz", COOP_HTTP_PORT, 30, 30),
        )
    } else {
        (exec_pgrep_probe(), exec_pgrep_probe())
    };

    Container {
        name: AGENT_CONTAINER.to_string(),
        image: Some(image),
        ports,
        env: Some(env),
        resources: Some(build_resources(config, id.role)),
        volume_mounts: Some(mounts),
        readiness_probe: Some(readiness),
        liveness_probe: Some(liveness),
        security_context: Some(build_container_security_context()),
        ..Default::default()
    }
}

fn build_coop_sidecar(
    config: &ControllerConfig,
    overrides: &SpawnOverrides,
    mounts: Vec<VolumeMount>,
) -> Container {
    let mut env = BTreeMap::new();
    let nats_url = overrides
        .coop_nats_url
        .clone()
        .or_else(|| config.coop_nats_url.clone());
    if let Some(url) = nats_url {
        env.insert("COOP_NATS_URL".to_string(), url);
    }
    if let Some(url) = &config.coop_broker_url {
        env.insert("COOP_BROKER_URL".to_string(), url.clone());
    }
    if let Some(url) = &config.coop_mux_url {
        env.insert("COOP_MUX_URL".to_string(), url.clone());
    }

    let mut env = env_vars(&env);
    append_secret_env(
        &mut env,
        "COOP_NATS_TOKEN",
        overrides
            .coop_nats_token_secret
            .as_ref()
            .or(config.nats_token_secret.as_ref()),
        "token",
    );
    append_secret_env(
        &mut env,
        "COOP_NATS_AUTH",
        overrides.coop_nats_auth_secret.as_ref(),
        "auth",
    );
    append_secret_env(
        &mut env,
        "COOP_BROKER_TOKEN",
        config.coop_broker_token_secret.as_ref(),
        "token",
    );

    Container {
        name: COOP_CONTAINER.to_string(),
        image: Some(config.coop_image.clone()),
        ports: Some(vec![
            ContainerPort {
                container_port: COOP_HTTP_PORT,
                name: Some("http".to_string()),
                ..Default::default()
            },
            ContainerPort {
                container_port: COOP_CONTROL_PORT,
                name: Some("control".to_string()),
                ..Default::default()
            },
        ]),
        env: Some(env),
        volume_mounts: Some(mounts),
        readiness_probe: Some(http_probe("/healthz", COOP_HTTP_PORT, 5, 10)),
        liveness_probe: Some(http_probe("/healthz", COOP_HTTP_PORT, 30, 30)),
        // slow first boot: 12 x 5s gives the coop a full minute
        startup_probe: Some(Probe {
            period_seconds: Some(5),
            failure_threshold: Some(12),
            ..http_probe("/healthz", COOP_HTTP_PORT, 0, 5)
        }),
        security_context: Some(build_container_security_context()),
        ..Default::default()
    }
}

fn build_clone_container(
    config: &ControllerConfig,
    id: &AgentId,
    rig: Option<&RigRecord>,
) -> Option<Container> {
    if !id.role.needs_clone() {
        return None;
    }
    let rig = rig?;
    let mirror = rig.git_mirror.as_ref()?;

    let work = format!("/workspace/{}/work", rig.name);
    let branch = rig.default_branch.as_deref().unwrap_or("main");
    let mut script = format!(
        "set -e\n\
         if [ ! -d {work}/.git ]; then\n\
         \x20 git clone git://{mirror}:{GIT_DAEMON_PORT}/{rig_name}.git {work}\n\
         fi\n\
         cd {work}\n",
        rig_name = rig.name,
    );
    if let Some(upstream) = &rig.git_url {
        script.push_str(&format!("git remote set-url origin {upstream}\n"));
    }
    script.push_str(&format!(
        "git checkout {branch}\n\
         git config user.name \"{agent}\"\n\
         git config user.email \"{agent}@{town}.local\"\n",
        agent = id.agent,
        town = config.town,
    ));

    Some(Container {
        name: CLONE_CONTAINER.to_string(),
        image: Some(config.toolchain_image.clone()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), script]),
        volume_mounts: Some(vec![VolumeMount {
            name: "workspace".to_string(),
            mount_path: "/workspace".to_string(),
            ..Default::default()
        }]),
        security_context: Some(build_container_security_context()),
        ..Default::default()
    })
}

fn build_env(
    config: &ControllerConfig,
    id: &AgentId,
    gt_rigs: &str,
    overrides: &SpawnOverrides,
) -> Vec<EnvVar> {
    let mut env = BTreeMap::new();

    // Role-derived identity
    env.insert("GT_ROLE".to_string(), id.role.to_string());
    env.insert("GT_RIG".to_string(), id.rig.clone());
    env.insert("GT_AGENT".to_string(), id.agent.clone());
    env.insert("HOME".to_string(), "/workspace".to_string());
    let scope = if id.role.is_singleton() {
        config.town.clone()
    } else {
        id.rig.clone()
    };
    env.insert("GT_SCOPE".to_string(), scope);
    env.insert("BD_ACTOR".to_string(), id.actor());
    env.insert("GIT_AUTHOR_NAME".to_string(), id.agent.clone());
    match id.role {
        Role::Polecat => {
            env.insert("GT_POLECAT".to_string(), id.agent.clone());
        }
        Role::Crew => {
            env.insert("GT_CREW".to_string(), id.agent.clone());
        }
        _ => {}
    }

    // Controller-wide, then per-event overrides on the daemon address
    let daemon_host = overrides
        .daemon_host
        .clone()
        .unwrap_or_else(|| config.daemon_host.clone());
    let daemon_port = overrides.daemon_port.unwrap_or(config.daemon_port);
    env.insert("GT_TOWN_NAME".to_string(), config.town.clone());
    env.insert("BD_DAEMON_HOST".to_string(), daemon_host.clone());
    env.insert("BD_DAEMON_PORT".to_string(), daemon_port.to_string());
    env.insert(
        "BD_DAEMON_HTTP_PORT".to_string(),
        config.daemon_http_port.to_string(),
    );
    env.insert(
        "BD_DAEMON_HTTP_URL".to_string(),
        format!("http://{}:{}", daemon_host, config.daemon_http_port),
    );
    env.insert("BD_NATS_URL".to_string(), config.nats_url.clone());
    if let Some(url) = overrides
        .coop_nats_url
        .clone()
        .or_else(|| config.coop_nats_url.clone())
    {
        env.insert("COOP_NATS_URL".to_string(), url);
    }
    if let Some(url) = &config.coop_broker_url {
        env.insert("COOP_BROKER_URL".to_string(), url.clone());
    }
    if let Some(url) = &config.coop_mux_url {
        env.insert("COOP_MUX_URL".to_string(), url.clone());
    }
    if !gt_rigs.is_empty() {
        env.insert("GT_RIGS".to_string(), gt_rigs.to_string());
    }

    let mut env = env_vars(&env);

    // Secret-sourced entries; first write wins on name collisions
    append_secret_env(
        &mut env,
        "BD_DAEMON_TOKEN",
        config.daemon_token_secret.as_ref(),
        "token",
    );
    append_secret_env(
        &mut env,
        "COOP_NATS_TOKEN",
        overrides
            .coop_nats_token_secret
            .as_ref()
            .or(config.nats_token_secret.as_ref()),
        "token",
    );
    append_secret_env(
        &mut env,
        "COOP_BROKER_TOKEN",
        config.coop_broker_token_secret.as_ref(),
        "token",
    );
    let api_key_name = overrides.api_key_key.as_deref().unwrap_or("ANTHROPIC_API_KEY");
    append_secret_env(
        &mut env,
        api_key_name,
        overrides
            .api_key_secret
            .as_ref()
            .or(config.api_key_secret.as_ref()),
        api_key_name,
    );

    env
}

/// Render a sorted env map as `EnvVar`s.
fn env_vars(map: &BTreeMap<String, String>) -> Vec<EnvVar> {
    map.iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect()
}

/// Append a secret-sourced env var unless the name is already taken.
fn append_secret_env(env: &mut Vec<EnvVar>, name: &str, secret: Option<&String>, key: &str) {
    let Some(secret) = secret else { return };
    if env.iter().any(|e| e.name == name) {
        return;
    }
    env.push(EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.clone(),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    });
}

fn build_resources(config: &ControllerConfig, role: Role) -> ResourceRequirements {
    let (cpu_req, mem_req, cpu_lim, mem_lim) = role_resources(role);
    let cpu_lim = cpu_lim.min(config.max_cpu_millicores);
    let mem_lim = mem_lim.min(config.max_memory_mb);
    let cpu_req = cpu_req.min(cpu_lim);
    let mem_req = mem_req.min(mem_lim);

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), Quantity(format!("{cpu_req}m")));
    requests.insert("memory".to_string(), Quantity(format!("{mem_req}Mi")));

    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(format!("{cpu_lim}m")));
    limits.insert("memory".to_string(), Quantity(format!("{mem_lim}Mi")));

    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: (initial_delay > 0).then_some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn exec_pgrep_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "pgrep".to_string(),
                "-f".to_string(),
                "gt-agent".to_string(),
            ]),
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(30),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn build_pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        run_as_non_root: Some(true),
        run_as_user: Some(1000),
        fs_group: Some(1000),
        ..Default::default()
    }
}

fn build_container_security_context() -> SecurityContext {
    SecurityContext {
        run_as_non_root: Some(true),
        allow_privilege_escalation: Some(false),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
