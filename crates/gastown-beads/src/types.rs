//! Wire types for the beads control plane.
//!
//! Issues and mutation events arrive as loosely-structured JSON; this
//! module decodes only the fields the controller consumes and derives
//! the typed records (agent beads, rig records) from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use gastown_core::AgentId;

/// One issue as returned by the `List` RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// The bead id.
    pub id: String,
    /// Issue title; for rig issues this is the rig name.
    #[serde(default)]
    pub title: String,
    /// Current status (`open`, `in_progress`, `closed`, ...).
    #[serde(default)]
    pub status: String,
    /// Flat `key:value` label strings.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Free-form notes, used as a `key: value` line bag.
    #[serde(default)]
    pub notes: String,
}

/// A mutation event pushed by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Mutation kind: `create`, `status`, `delete`, `update`, ...
    #[serde(default)]
    pub kind: String,
    /// The bead id the mutation applies to.
    #[serde(default, alias = "issue_id")]
    pub id: String,
    /// Status before the mutation, for `status` kinds.
    #[serde(default)]
    pub old_status: Option<String>,
    /// Status after the mutation, for `status` kinds.
    #[serde(default)]
    pub new_status: Option<String>,
    /// Actor in `rig/role/name` form, when known.
    #[serde(default)]
    pub actor: Option<String>,
    /// Flat `key:value` label strings.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Bead type tag (`agent`, `rig`, ...), when known.
    #[serde(default, rename = "type")]
    pub bead_type: Option<String>,
}

impl MutationEvent {
    /// Whether this mutation concerns an agent bead.
    ///
    /// True when the type tag says `agent` or the labels carry the
    /// `gt:agent` marker; everything else is dropped silently by the
    /// watcher.
    #[must_use]
    pub fn is_agent(&self) -> bool {
        self.bead_type.as_deref() == Some("agent")
            || self.labels.iter().any(|l| l == "gt:agent")
    }

    /// Extract the agent identity from this event.
    ///
    /// Priority: identity labels, then the actor reference, then
    /// bead-id parsing. Returns `None` when no form yields a complete
    /// identity.
    #[must_use]
    pub fn identity(&self, town: &str) -> Option<AgentId> {
        if let (Some(rig), Some(role), Some(agent)) = (
            label_value(&self.labels, "rig"),
            label_value(&self.labels, "role"),
            label_value(&self.labels, "agent"),
        ) {
            if let Ok(id) = AgentId::from_parts(rig, role, agent) {
                return Some(id);
            }
        }
        if let Some(actor) = &self.actor {
            if let Ok(id) = AgentId::from_actor(actor) {
                return Some(id);
            }
        }
        AgentId::from_bead_id(&self.id, town).ok()
    }
}

/// The control plane's desired record for one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBead {
    /// The bead id, used for notes writes.
    pub id: String,
    /// The agent identity derived from labels or the bead id.
    pub identity: AgentId,
    /// Optional image override.
    pub image: Option<String>,
    /// The notes bag, parsed into key/value metadata.
    pub meta: BTreeMap<String, String>,
}

impl AgentBead {
    /// Build an agent bead from a listed issue.
    ///
    /// Returns `None` when the issue is not targeted at this backend
    /// (`execution_target:k8s` label missing) or no complete identity
    /// can be extracted.
    #[must_use]
    pub fn from_issue(issue: &Issue, town: &str) -> Option<Self> {
        if !issue
            .labels
            .iter()
            .any(|l| l == "execution_target:k8s")
        {
            return None;
        }

        let identity = identity_from_labels(&issue.labels)
            .or_else(|| AgentId::from_bead_id(&issue.id, town).ok());
        let Some(identity) = identity else {
            tracing::debug!(bead = %issue.id, "skipping agent bead with incomplete identity");
            return None;
        };

        let meta = parse_notes(&issue.notes);
        let image = label_value(&issue.labels, "image")
            .map(ToString::to_string)
            .or_else(|| meta.get("image").cloned());

        Some(Self {
            id: issue.id.clone(),
            identity,
            image,
            meta,
        })
    }
}

/// One rig as listed from the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RigRecord {
    /// Rig name (the issue title).
    pub name: String,
    /// Bead id prefix for the rig.
    pub prefix: Option<String>,
    /// Upstream git URL; rigs without one get no mirror.
    pub git_url: Option<String>,
    /// In-cluster git-mirror service, when already provisioned.
    pub git_mirror: Option<String>,
    /// Default branch checked out by init clone containers.
    pub default_branch: Option<String>,
    /// Per-rig agent image override.
    pub image: Option<String>,
    /// Per-rig storage class override for workspace PVCs.
    pub storage_class: Option<String>,
}

impl RigRecord {
    /// Build a rig record from a listed issue.
    ///
    /// The rig name comes from the issue title, falling back to the
    /// bead id; everything else comes from prefixed labels.
    #[must_use]
    pub fn from_issue(issue: &Issue) -> Self {
        let name = if issue.title.is_empty() {
            issue.id.clone()
        } else {
            issue.title.clone()
        };
        let get = |key| label_value(&issue.labels, key).map(ToString::to_string);

        Self {
            name,
            prefix: get("prefix"),
            git_url: get("git_url"),
            git_mirror: get("git_mirror"),
            default_branch: get("default_branch"),
            image: get("image"),
            storage_class: get("storage_class"),
        }
    }
}

/// Look up the value of a `key:value` label.
#[must_use]
pub fn label_value<'a>(labels: &'a [String], key: &str) -> Option<&'a str> {
    labels.iter().find_map(|label| {
        let (k, v) = label.split_once(':')?;
        (k == key && !v.is_empty()).then_some(v)
    })
}

/// Extract a full identity from `rig:` / `role:` / `agent:` labels.
fn identity_from_labels(labels: &[String]) -> Option<AgentId> {
    let rig = label_value(labels, "rig")?;
    let role = label_value(labels, "role")?;
    let agent = label_value(labels, "agent")?;
    AgentId::from_parts(rig, role, agent).ok()
}

/// Parse a notes field into its `key: value` lines.
///
/// Lines without a colon are ignored; keys and values are trimmed.
/// Later lines overwrite earlier ones for the same key.
#[must_use]
pub fn parse_notes(notes: &str) -> BTreeMap<String, String> {
    notes
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Render key/value pairs as `key: value` notes lines.
///
/// Pairs with empty values are omitted; the result is empty when
/// nothing remains.
#[must_use]
pub fn render_notes<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        if value.is_empty() {
            continue;
        }
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gastown_core::Role;

    fn agent_issue() -> Issue {
        Issue {
            id: "gastown-polecat-furiosa".to_string(),
            title: "Fix the war rig".to_string(),
            status: "open".to_string(),
            labels: vec![
                "gt:agent".to_string(),
                "execution_target:k8s".to_string(),
                "rig:gastown".to_string(),
                "role:polecat".to_string(),
                "agent:furiosa".to_string(),
            ],
            notes: "daemon_host: bd.example\ndaemon_port: 9470\n".to_string(),
        }
    }

    #[test]
    fn label_lookup() {
        let labels = vec!["rig:gastown".to_string(), "gt:agent".to_string()];
        assert_eq!(label_value(&labels, "rig"), Some("gastown"));
        assert_eq!(label_value(&labels, "role"), None);
        // a flat marker label has no value
        assert_eq!(label_value(&labels, "gt"), Some("agent"));
    }

    #[test]
    fn notes_round_trip() {
        let parsed = parse_notes("backend: coop\npod_name: gt-a-crew-b\n\nnot a pair\n");
        assert_eq!(parsed.get("backend").map(String::as_str), Some("coop"));
        assert_eq!(
            parsed.get("pod_name").map(String::as_str),
            Some("gt-a-crew-b")
        );
        assert_eq!(parsed.len(), 2);

        let rendered = render_notes([("backend", "coop"), ("coop_url", ""), ("pod_name", "x")]);
        assert_eq!(rendered, "backend: coop\npod_name: x\n");
        assert!(render_notes([("a", ""), ("b", "")]).is_empty());
    }

    #[test]
    fn notes_later_lines_win() {
        let parsed = parse_notes("state: spawning\nstate: working\n");
        assert_eq!(parsed.get("state").map(String::as_str), Some("working"));
    }

    #[test]
    fn agent_bead_prefers_labels() {
        let bead = AgentBead::from_issue(&agent_issue(), "town").unwrap();
        assert_eq!(
            bead.identity,
            AgentId::new("gastown", Role::Polecat, "furiosa")
        );
        assert_eq!(bead.meta.get("daemon_port").map(String::as_str), Some("9470"));
        assert!(bead.image.is_none());
    }

    #[test]
    fn agent_bead_falls_back_to_id_parsing() {
        let mut issue = agent_issue();
        issue.labels = vec![
            "gt:agent".to_string(),
            "execution_target:k8s".to_string(),
        ];
        let bead = AgentBead::from_issue(&issue, "town").unwrap();
        assert_eq!(bead.identity.rig, "gastown");
        assert_eq!(bead.identity.role, Role::Polecat);
        assert_eq!(bead.identity.agent, "furiosa");
    }

    #[test]
    fn agent_bead_requires_k8s_target() {
        let mut issue = agent_issue();
        issue.labels.retain(|l| l != "execution_target:k8s");
        assert!(AgentBead::from_issue(&issue, "town").is_none());
    }

    #[test]
    fn agent_bead_image_label_wins_over_notes() {
        let mut issue = agent_issue();
        issue.labels.push("image:ghcr.io/gastown/custom:1".to_string());
        issue.notes.push_str("image: ghcr.io/gastown/other:2\n");
        let bead = AgentBead::from_issue(&issue, "town").unwrap();
        assert_eq!(bead.image.as_deref(), Some("ghcr.io/gastown/custom:1"));
    }

    #[test]
    fn rig_record_from_issue() {
        let issue = Issue {
            id: "rig-gastown".to_string(),
            title: "gastown".to_string(),
            status: "open".to_string(),
            labels: vec![
                "prefix:gt".to_string(),
                "git_url:https://github.com/example/gastown.git".to_string(),
                "default_branch:main".to_string(),
                "storage_class:fast-ssd".to_string(),
            ],
            notes: String::new(),
        };
        let rig = RigRecord::from_issue(&issue);
        assert_eq!(rig.name, "gastown");
        assert_eq!(rig.prefix.as_deref(), Some("gt"));
        assert_eq!(
            rig.git_url.as_deref(),
            Some("https://github.com/example/gastown.git")
        );
        assert_eq!(rig.default_branch.as_deref(), Some("main"));
        assert_eq!(rig.storage_class.as_deref(), Some("fast-ssd"));
        assert!(rig.git_mirror.is_none());
        assert!(rig.image.is_none());
    }

    #[test]
    fn mutation_event_agent_detection() {
        let event: MutationEvent = serde_json::from_str(
            r#"{"kind":"create","id":"x","type":"agent"}"#,
        )
        .unwrap();
        assert!(event.is_agent());

        let event: MutationEvent = serde_json::from_str(
            r#"{"kind":"create","id":"x","labels":["gt:agent"]}"#,
        )
        .unwrap();
        assert!(event.is_agent());

        let event: MutationEvent =
            serde_json::from_str(r#"{"kind":"create","id":"x"}"#).unwrap();
        assert!(!event.is_agent());
    }

    #[test]
    fn mutation_event_identity_priority() {
        let event = MutationEvent {
            kind: "create".to_string(),
            id: "other-crew-thing".to_string(),
            old_status: None,
            new_status: None,
            actor: Some("acted/witness/watcher".to_string()),
            labels: vec![
                "rig:gastown".to_string(),
                "role:polecat".to_string(),
                "agent:furiosa".to_string(),
            ],
            bead_type: Some("agent".to_string()),
        };
        // labels win over actor and id
        let id = event.identity("town").unwrap();
        assert_eq!(id, AgentId::new("gastown", Role::Polecat, "furiosa"));

        let event = MutationEvent {
            labels: Vec::new(),
            ..event
        };
        // actor wins over id
        let id = event.identity("town").unwrap();
        assert_eq!(id, AgentId::new("acted", Role::Witness, "watcher"));

        let event = MutationEvent {
            actor: None,
            ..event
        };
        let id = event.identity("town").unwrap();
        assert_eq!(id, AgentId::new("other", Role::Crew, "thing"));
    }

    #[test]
    fn mutation_event_singleton_identity() {
        let event = MutationEvent {
            kind: "create".to_string(),
            id: "hq-mayor".to_string(),
            old_status: None,
            new_status: None,
            actor: None,
            labels: vec!["gt:agent".to_string()],
            bead_type: None,
        };
        let id = event.identity("gastown").unwrap();
        assert_eq!(id, AgentId::new("gastown", Role::Mayor, "hq"));
    }
}
