//! Agent identity: roles and the (rig, role, agent) triple.
//!
//! Every managed agent is identified by a rig, a role, and an agent
//! name. The canonical pod name `gt-{rig}-{role}-{agent}` is derived
//! from the triple and is the equality key between the desired set
//! (beads) and the actual set (pods).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::IdError;

/// The closed set of agent roles.
///
/// The role determines restart policy, workspace storage, and the
/// role-specific environment injected into the agent pod. Plural wire
/// forms ("polecats", "crews") normalize to the singular variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// One-shot worker; never restarted, ephemeral scratch space.
    Polecat,
    /// Long-lived worker with a persistent workspace.
    Crew,
    /// Observer role with a persistent workspace.
    Witness,
    /// Long-lived processing role with a persistent workspace.
    Refinery,
    /// Town-level singleton coordinator.
    Mayor,
    /// Town-level singleton housekeeping role.
    Deacon,
}

impl Role {
    /// All known roles, in a stable order.
    pub const ALL: [Role; 6] = [
        Role::Polecat,
        Role::Crew,
        Role::Witness,
        Role::Refinery,
        Role::Mayor,
        Role::Deacon,
    ];

    /// The singular lowercase name used in pod names and labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Polecat => "polecat",
            Role::Crew => "crew",
            Role::Witness => "witness",
            Role::Refinery => "refinery",
            Role::Mayor => "mayor",
            Role::Deacon => "deacon",
        }
    }

    /// Whether pods of this role keep a PVC-backed workspace.
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        matches!(self, Role::Crew | Role::Witness | Role::Refinery)
    }

    /// Whether pods of this role run to completion exactly once.
    #[must_use]
    pub const fn is_one_shot(self) -> bool {
        matches!(self, Role::Polecat)
    }

    /// Whether pods of this role get an init container that clones
    /// the rig repository from the in-cluster mirror.
    #[must_use]
    pub const fn needs_clone(self) -> bool {
        matches!(self, Role::Polecat | Role::Crew | Role::Refinery)
    }

    /// Whether this role is a town-level singleton (one per town,
    /// addressed by the legacy `hq-{role}` bead id).
    #[must_use]
    pub const fn is_singleton(self) -> bool {
        matches!(self, Role::Mayor | Role::Deacon)
    }
}

impl FromStr for Role {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polecat" | "polecats" => Ok(Role::Polecat),
            "crew" | "crews" => Ok(Role::Crew),
            "witness" | "witnesses" => Ok(Role::Witness),
            "refinery" | "refineries" => Ok(Role::Refinery),
            "mayor" | "mayors" => Ok(Role::Mayor),
            "deacon" | "deacons" => Ok(Role::Deacon),
            other => Err(IdError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stable identity of a managed agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId {
    /// The rig (project scope) the agent works in.
    pub rig: String,
    /// The agent's role.
    pub role: Role,
    /// The agent's name within the rig.
    pub agent: String,
}

impl AgentId {
    /// Create an identity from its parts.
    #[must_use]
    pub fn new(rig: impl Into<String>, role: Role, agent: impl Into<String>) -> Self {
        Self {
            rig: rig.into(),
            role,
            agent: agent.into(),
        }
    }

    /// Parse an identity from raw rig/role/agent strings, normalizing
    /// the role.
    ///
    /// # Errors
    ///
    /// Returns an error if the role is unknown or a component is empty.
    pub fn from_parts(rig: &str, role: &str, agent: &str) -> Result<Self, IdError> {
        if rig.is_empty() {
            return Err(IdError::EmptyComponent("rig"));
        }
        if agent.is_empty() {
            return Err(IdError::EmptyComponent("agent"));
        }
        Ok(Self::new(rig, role.parse()?, agent))
    }

    /// Parse an identity from a `rig/role/name` actor reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference does not have exactly three
    /// non-empty segments or the role is unknown.
    pub fn from_actor(actor: &str) -> Result<Self, IdError> {
        let mut parts = actor.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(rig), Some(role), Some(agent), None) if !rig.is_empty() && !agent.is_empty() => {
                Self::from_parts(rig, role, agent)
            }
            _ => Err(IdError::MalformedActor(actor.to_string())),
        }
    }

    /// Parse an identity from a bead id.
    ///
    /// The singletons `hq-mayor` and `hq-deacon` resolve to
    /// `(town, mayor, hq)` and `(town, deacon, hq)`. Any other id is
    /// split on `-` around the first role-parsing segment that leaves
    /// a non-empty rig before it and a non-empty agent after it.
    ///
    /// # Errors
    ///
    /// Returns an error if no such role segment is found.
    pub fn from_bead_id(id: &str, town: &str) -> Result<Self, IdError> {
        match id {
            "hq-mayor" => return Ok(Self::new(town, Role::Mayor, "hq")),
            "hq-deacon" => return Ok(Self::new(town, Role::Deacon, "hq")),
            _ => {}
        }

        let segments: Vec<&str> = id.split('-').collect();
        for (i, segment) in segments.iter().enumerate() {
            if let Ok(role) = segment.parse::<Role>() {
                let rig = segments[..i].join("-");
                let agent = segments[i + 1..].join("-");
                if rig.is_empty() || agent.is_empty() {
                    // a rig or agent name may itself collide with a
                    // role string; keep scanning
                    continue;
                }
                return Ok(Self::new(rig, role, agent));
            }
        }
        Err(IdError::MalformedBeadId(id.to_string()))
    }

    /// The canonical pod name: `gt-{rig}-{role}-{agent}`.
    #[must_use]
    pub fn pod_name(&self) -> String {
        format!("gt-{}-{}-{}", self.rig, self.role, self.agent)
    }

    /// The bead id for this identity.
    ///
    /// Town singletons (mayor/deacon named `hq`) use the legacy
    /// `hq-{role}` form; everything else is `{rig}-{role}-{agent}`.
    /// The `town` argument is accepted for symmetry with
    /// [`AgentId::from_bead_id`] and ignored for non-singletons.
    #[must_use]
    pub fn bead_id(&self, _town: &str) -> String {
        if self.role.is_singleton() && self.agent == "hq" {
            format!("hq-{}", self.role)
        } else {
            format!("{}-{}-{}", self.rig, self.role, self.agent)
        }
    }

    /// The `rig/role/name` actor reference for this identity.
    #[must_use]
    pub fn actor(&self) -> String {
        format!("{}/{}/{}", self.rig, self.role, self.agent)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.rig, self.role, self.agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_parses_singular_and_plural() {
        assert_eq!("polecat".parse::<Role>().unwrap(), Role::Polecat);
        assert_eq!("polecats".parse::<Role>().unwrap(), Role::Polecat);
        assert_eq!("crews".parse::<Role>().unwrap(), Role::Crew);
        assert_eq!("witnesses".parse::<Role>().unwrap(), Role::Witness);
        assert_eq!("refineries".parse::<Role>().unwrap(), Role::Refinery);
        assert_eq!("mayor".parse::<Role>().unwrap(), Role::Mayor);
        assert_eq!("deacons".parse::<Role>().unwrap(), Role::Deacon);
    }

    #[test]
    fn role_rejects_unknown() {
        let err = "imperator".parse::<Role>().unwrap_err();
        assert_eq!(err, IdError::UnknownRole("imperator".to_string()));
    }

    #[test]
    fn pod_name_is_derived_from_identity() {
        let id = AgentId::new("gastown", Role::Polecat, "furiosa");
        assert_eq!(id.pod_name(), "gt-gastown-polecat-furiosa");

        let id = AgentId::new("town", Role::Mayor, "hq");
        assert_eq!(id.pod_name(), "gt-town-mayor-hq");
    }

    #[test]
    fn bead_id_round_trips() {
        let id = AgentId::new("gastown", Role::Crew, "nux");
        let bead = id.bead_id("gastown");
        assert_eq!(bead, "gastown-crew-nux");
        assert_eq!(AgentId::from_bead_id(&bead, "gastown").unwrap(), id);
    }

    #[test]
    fn singleton_bead_ids() {
        let mayor = AgentId::from_bead_id("hq-mayor", "gastown").unwrap();
        assert_eq!(mayor, AgentId::new("gastown", Role::Mayor, "hq"));
        assert_eq!(mayor.bead_id("gastown"), "hq-mayor");

        let deacon = AgentId::from_bead_id("hq-deacon", "bartertown").unwrap();
        assert_eq!(deacon, AgentId::new("bartertown", Role::Deacon, "hq"));
        assert_eq!(deacon.bead_id("bartertown"), "hq-deacon");
    }

    #[test]
    fn bead_id_with_dashed_names() {
        let id = AgentId::from_bead_id("gas-town-polecat-fur-iosa", "t").unwrap();
        assert_eq!(id.rig, "gas-town");
        assert_eq!(id.role, Role::Polecat);
        assert_eq!(id.agent, "fur-iosa");
    }

    #[test]
    fn bead_id_without_role_is_rejected() {
        assert!(AgentId::from_bead_id("gt-abc123", "t").is_err());
        assert!(AgentId::from_bead_id("polecat", "t").is_err());
        assert!(AgentId::from_bead_id("rig-polecat-", "t").is_err());
    }

    #[test]
    fn bead_id_with_role_like_rig_or_agent() {
        // the rig name collides with a role string; the leading
        // "crew" segment must not end the scan
        let id = AgentId::from_bead_id("crew-polecat-x", "t").unwrap();
        assert_eq!(id, AgentId::new("crew", Role::Polecat, "x"));

        let id = AgentId::from_bead_id("mayor-crew-nux", "t").unwrap();
        assert_eq!(id, AgentId::new("mayor", Role::Crew, "nux"));

        // the agent name collides too; the first viable role wins
        let id = AgentId::from_bead_id("rig-witness-deacon", "t").unwrap();
        assert_eq!(id, AgentId::new("rig", Role::Witness, "deacon"));
    }

    #[test]
    fn actor_parsing() {
        let id = AgentId::from_actor("gastown/polecat/furiosa").unwrap();
        assert_eq!(id, AgentId::new("gastown", Role::Polecat, "furiosa"));
        assert_eq!(id.actor(), "gastown/polecat/furiosa");

        assert!(AgentId::from_actor("gastown/polecat").is_err());
        assert!(AgentId::from_actor("a/b/c/d").is_err());
        assert!(AgentId::from_actor("gastown/imperator/furiosa").is_err());
    }

    #[test]
    fn from_parts_normalizes_plurals() {
        let id = AgentId::from_parts("gastown", "polecats", "furiosa").unwrap();
        assert_eq!(id.role, Role::Polecat);
        assert!(AgentId::from_parts("", "crew", "nux").is_err());
        assert!(AgentId::from_parts("gastown", "crew", "").is_err());
    }

    #[test]
    fn role_properties() {
        assert!(Role::Polecat.is_one_shot());
        assert!(!Role::Crew.is_one_shot());

        assert!(Role::Crew.is_persistent());
        assert!(Role::Witness.is_persistent());
        assert!(Role::Refinery.is_persistent());
        assert!(!Role::Polecat.is_persistent());
        assert!(!Role::Mayor.is_persistent());

        assert!(Role::Polecat.needs_clone());
        assert!(Role::Crew.needs_clone());
        assert!(Role::Refinery.needs_clone());
        assert!(!Role::Witness.needs_clone());
        assert!(!Role::Deacon.needs_clone());
    }

    #[test]
    fn role_serde_uses_lowercase() {
        let json = serde_json::to_string(&Role::Refinery).unwrap();
        assert_eq!(json, "\"refinery\"");
        let role: Role = serde_json::from_str("\"mayor\"").unwrap();
        assert_eq!(role, Role::Mayor);
    }
}
