//! Controller configuration.
//!
//! Process-wide and immutable after startup; only the rig cache
//! mutates later. Loaded from environment variables with opinionated
//! defaults, the same way the rest of the deployment is wired.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the coop management surface runs for agent pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CoopPlacement {
    /// No coop; pods fall back to exec probes.
    Disabled,
    /// The agent container itself serves the coop HTTP endpoints.
    #[default]
    Builtin,
    /// A separate coop container shares the pod's process namespace.
    Sidecar,
}

impl CoopPlacement {
    /// Whether any coop surface is active.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, CoopPlacement::Disabled)
    }

    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "disabled" | "none" | "off" => Some(CoopPlacement::Disabled),
            "builtin" => Some(CoopPlacement::Builtin),
            "sidecar" => Some(CoopPlacement::Sidecar),
            _ => None,
        }
    }
}

/// Which transport delivers mutation events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventTransport {
    /// Long-lived HTTP event stream from the daemon.
    #[default]
    Sse,
    /// JetStream durable pull consumer.
    Nats,
}

impl EventTransport {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "sse" | "http" => Some(EventTransport::Sse),
            "nats" | "jetstream" => Some(EventTransport::Nats),
            _ => None,
        }
    }
}

/// Configuration for the controller process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Namespace all agent resources live in.
    pub namespace: String,
    /// Town name, used for singleton identity and `GT_TOWN_NAME`.
    pub town: String,

    /// Base URL of the beads daemon HTTP API.
    pub beads_url: String,
    /// Bearer token for the daemon, if any.
    pub beads_token: Option<String>,
    /// Events endpoint override; defaults to `{beads_url}/events`.
    pub events_url: Option<String>,
    /// Event transport selection.
    pub event_transport: EventTransport,
    /// NATS server URL for the bus transport and `BD_NATS_URL`.
    pub nats_url: String,
    /// Auth token for the controller's own NATS connection.
    pub nats_token: Option<String>,
    /// Durable consumer name override; defaults to
    /// `gastown-controller-{namespace}`.
    pub consumer_name: Option<String>,

    /// Seconds between periodic sync passes.
    pub sync_interval_seconds: u64,

    /// Default agent container image.
    pub default_image: String,
    /// Toolchain image used by init clone containers; also the drift
    /// fingerprint for pods without a coop sidecar.
    pub toolchain_image: String,
    /// Daemon host injected into agent pods.
    pub daemon_host: String,
    /// Daemon wire port injected into agent pods.
    pub daemon_port: u16,
    /// Daemon HTTP port injected into agent pods.
    pub daemon_http_port: u16,

    /// Secret with agent credentials, mounted into pods when set.
    pub credentials_secret: Option<String>,
    /// Secret holding the daemon token (`token` key).
    pub daemon_token_secret: Option<String>,
    /// Default secret for the agent API key.
    pub api_key_secret: Option<String>,
    /// Secret with git credentials for agent pods.
    pub git_credentials_secret: Option<String>,
    /// Secret holding the NATS token injected into pods (`token` key).
    pub nats_token_secret: Option<String>,
    /// Secret holding the coop broker token (`token` key).
    pub coop_broker_token_secret: Option<String>,

    /// Coop placement for agent pods.
    pub coop: CoopPlacement,
    /// Coop sidecar image; the drift fingerprint when a sidecar runs.
    pub coop_image: String,
    /// Coop broker URL injected into pods.
    pub coop_broker_url: Option<String>,
    /// Coop mux URL injected into pods.
    pub coop_mux_url: Option<String>,
    /// NATS URL the coop connects to, when different from the bus.
    pub coop_nats_url: Option<String>,
    /// Token callers use to talk to an agent's coop endpoint.
    pub coop_token: Option<String>,

    /// Maximum CPU any agent container may request, in millicores.
    pub max_cpu_millicores: u32,
    /// Maximum memory any agent container may request, in megabytes.
    pub max_memory_mb: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "gastown".to_string(),
            town: "gastown".to_string(),
            beads_url: "http://beads-daemon:8888".to_string(),
            beads_token: None,
            events_url: None,
            event_transport: EventTransport::default(),
            nats_url: "nats://beads-nats:4222".to_string(),
            nats_token: None,
            consumer_name: None,
            sync_interval_seconds: 60,
            default_image: "ghcr.io/gastown/agent:latest".to_string(),
            toolchain_image: "ghcr.io/gastown/toolchain:latest".to_string(),
            daemon_host: "beads-daemon".to_string(),
            daemon_port: 9470,
            daemon_http_port: 8888,
            credentials_secret: None,
            daemon_token_secret: None,
            api_key_secret: None,
            git_credentials_secret: None,
            nats_token_secret: None,
            coop_broker_token_secret: None,
            coop: CoopPlacement::default(),
            coop_image: "ghcr.io/gastown/coop:latest".to_string(),
            coop_broker_url: None,
            coop_mux_url: None,
            coop_nats_url: None,
            coop_token: None,
            max_cpu_millicores: 8000,
            max_memory_mb: 16384,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every field has a default; unset or unparsable variables keep
    /// it. String-valued variables:
    /// `GT_NAMESPACE`, `GT_TOWN`, `BD_URL`, `BD_TOKEN`,
    /// `GT_EVENTS_URL`, `GT_EVENT_TRANSPORT`, `BD_NATS_URL`,
    /// `BD_NATS_TOKEN`, `GT_CONSUMER_NAME`, `GT_SYNC_INTERVAL`,
    /// `GT_AGENT_IMAGE`, `GT_TOOLCHAIN_IMAGE`, `BD_DAEMON_HOST`,
    /// `BD_DAEMON_PORT`, `BD_DAEMON_HTTP_PORT`,
    /// `GT_CREDENTIALS_SECRET`, `BD_TOKEN_SECRET`,
    /// `GT_API_KEY_SECRET`, `GT_GIT_CREDENTIALS_SECRET`,
    /// `GT_NATS_TOKEN_SECRET`, `COOP_BROKER_TOKEN_SECRET`, `GT_COOP`,
    /// `GT_COOP_IMAGE`, `COOP_BROKER_URL`, `COOP_MUX_URL`,
    /// `COOP_NATS_URL`, `COOP_TOKEN`, `GT_MAX_CPU_MILLICORES`,
    /// `GT_MAX_MEMORY_MB`.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let set_string = |target: &mut String, var: &str| {
            if let Ok(val) = std::env::var(var) {
                *target = val;
            }
        };
        let set_opt = |target: &mut Option<String>, var: &str| {
            if let Ok(val) = std::env::var(var) {
                if !val.is_empty() {
                    *target = Some(val);
                }
            }
        };

        set_string(&mut config.namespace, "GT_NAMESPACE");
        set_string(&mut config.town, "GT_TOWN");
        set_string(&mut config.beads_url, "BD_URL");
        set_opt(&mut config.beads_token, "BD_TOKEN");
        set_opt(&mut config.events_url, "GT_EVENTS_URL");
        if let Ok(val) = std::env::var("GT_EVENT_TRANSPORT") {
            if let Some(transport) = EventTransport::parse(&val) {
                config.event_transport = transport;
            }
        }
        set_string(&mut config.nats_url, "BD_NATS_URL");
        set_opt(&mut config.nats_token, "BD_NATS_TOKEN");
        set_opt(&mut config.consumer_name, "GT_CONSUMER_NAME");
        if let Ok(val) = std::env::var("GT_SYNC_INTERVAL") {
            if let Ok(n) = val.parse() {
                config.sync_interval_seconds = n;
            }
        }
        set_string(&mut config.default_image, "GT_AGENT_IMAGE");
        set_string(&mut config.toolchain_image, "GT_TOOLCHAIN_IMAGE");
        set_string(&mut config.daemon_host, "BD_DAEMON_HOST");
        if let Ok(val) = std::env::var("BD_DAEMON_PORT") {
            if let Ok(n) = val.parse() {
                config.daemon_port = n;
            }
        }
        if let Ok(val) = std::env::var("BD_DAEMON_HTTP_PORT") {
            if let Ok(n) = val.parse() {
                config.daemon_http_port = n;
            }
        }
        set_opt(&mut config.credentials_secret, "GT_CREDENTIALS_SECRET");
        set_opt(&mut config.daemon_token_secret, "BD_TOKEN_SECRET");
        set_opt(&mut config.api_key_secret, "GT_API_KEY_SECRET");
        set_opt(
            &mut config.git_credentials_secret,
            "GT_GIT_CREDENTIALS_SECRET",
        );
        set_opt(&mut config.nats_token_secret, "GT_NATS_TOKEN_SECRET");
        set_opt(
            &mut config.coop_broker_token_secret,
            "COOP_BROKER_TOKEN_SECRET",
        );
        if let Ok(val) = std::env::var("GT_COOP") {
            if let Some(placement) = CoopPlacement::parse(&val) {
                config.coop = placement;
            }
        }
        set_string(&mut config.coop_image, "GT_COOP_IMAGE");
        set_opt(&mut config.coop_broker_url, "COOP_BROKER_URL");
        set_opt(&mut config.coop_mux_url, "COOP_MUX_URL");
        set_opt(&mut config.coop_nats_url, "COOP_NATS_URL");
        set_opt(&mut config.coop_token, "COOP_TOKEN");
        if let Ok(val) = std::env::var("GT_MAX_CPU_MILLICORES") {
            if let Ok(n) = val.parse() {
                config.max_cpu_millicores = n;
            }
        }
        if let Ok(val) = std::env::var("GT_MAX_MEMORY_MB") {
            if let Ok(n) = val.parse() {
                config.max_memory_mb = n;
            }
        }

        config
    }

    /// The events endpoint for the SSE transport.
    #[must_use]
    pub fn events_url(&self) -> String {
        self.events_url
            .clone()
            .unwrap_or_else(|| format!("{}/events", self.beads_url))
    }

    /// The durable consumer name for the bus transport.
    ///
    /// Incorporates the namespace so controllers in different
    /// namespaces never share a consumer.
    #[must_use]
    pub fn durable_name(&self) -> String {
        self.consumer_name
            .clone()
            .unwrap_or_else(|| format!("gastown-controller-{}", self.namespace))
    }

    /// The subject mutation events are published on.
    #[must_use]
    pub fn events_subject(&self) -> String {
        format!("beads.mutations.{}", self.town)
    }

    /// The periodic sync interval as a `Duration`.
    #[must_use]
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    /// The daemon HTTP URL injected into agent pods.
    #[must_use]
    pub fn daemon_http_url(&self) -> String {
        format!("http://{}:{}", self.daemon_host, self.daemon_http_port)
    }
}
