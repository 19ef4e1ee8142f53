use crate::meta;
use log::debug;
use serde::Deserialize;
use std::collections::HashMap;
use term_colors::*;

/// The mode every agent bead falls back to when its record does not say
/// otherwise. Crew agents are long-running; `job` agents run to completion.
pub const DEFAULT_MODE: &str = "crew";

/// The mode whose pods are never killed for an in-place upgrade.
pub const JOB_MODE: &str = "job";

/// The four-string tuple that uniquely names an agent across the fleet.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Coordinates {
    pub project: String,
    pub mode: String,
    pub role: String,
    pub agent: String,
}

impl Coordinates {
    /// The canonical pod name for an agent is
    /// `{mode}-{project}-{role}-{agent}`, with each coordinate normalized
    /// into an RFC 1123 fragment and the joined result clamped to the DNS
    /// label limit. The derivation MUST stay deterministic: the reconciler
    /// recomputes it on every pass and matches it against live pods.
    pub fn pod_name(&self) -> String {
        names::clamp_label(format!(
            "{}-{}-{}-{}",
            names::rfc1123_fragment(&self.mode),
            names::rfc1123_fragment(&self.project),
            names::rfc1123_fragment(&self.role),
            names::rfc1123_fragment(&self.agent),
        ))
    }

    /// A bead id derived from coordinates alone, used when a pod predates
    /// the bead-id annotation. Mirrors the pod-name derivation but keeps
    /// the raw coordinate values.
    pub fn fallback_bead_id(&self) -> String {
        format!("{}-{}-{}-{}", self.mode, self.project, self.role, self.agent)
    }

    /// Coordinates are complete when both the role and the agent name are
    /// present. Events or beads without them cannot be mapped to a pod.
    pub fn is_complete(&self) -> bool {
        !self.role.is_empty() && !self.agent.is_empty()
    }
}

/// A bead as it appears on the wire: a flat record with a stable id, a
/// type, a lifecycle status, the four coordinate fields, and an opaque
/// string-to-string metadata map. Unknown keys are ignored on purpose so
/// that store-side additions do not break the controller.
#[derive(Clone, Debug, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(rename = "type", default)]
    pub bead_type: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Bead {
    pub fn is_agent(&self) -> bool {
        self.bead_type == crate::AGENT_BEAD_TYPE
    }

    pub fn coordinates(&self) -> Coordinates {
        let mode = if self.mode.is_empty() {
            DEFAULT_MODE.to_string()
        } else {
            self.mode.clone()
        };
        Coordinates {
            project: self.project.clone(),
            mode,
            role: self.role.clone(),
            agent: self.agent_name.clone(),
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|v| v.as_str())
    }
}

/// An `AgentBead` is a bead that has passed validation: it is of type
/// `agent` and carries complete coordinates. The desired state of the fleet
/// is a set of these.
#[derive(Clone, Debug)]
pub struct AgentBead {
    pub id: String,
    pub coords: Coordinates,
    pub status: String,
    pub metadata: HashMap<String, String>,
}

impl AgentBead {
    /// Validates a raw bead into an `AgentBead`. Beads of other types, or
    /// with incomplete coordinates, yield `None` after a debug log.
    pub fn validate(bead: Bead) -> Option<AgentBead> {
        if !bead.is_agent() {
            return None;
        }
        let coords = bead.coordinates();
        if !coords.is_complete() {
            debug!(
                "dropping agent bead {} with incomplete coordinates (role={:?} agent={:?})",
                cyan(&bead.id),
                bead.role,
                bead.agent_name
            );
            return None;
        }
        Some(AgentBead {
            id: bead.id,
            coords,
            status: bead.status,
            metadata: bead.metadata,
        })
    }

    pub fn pod_name(&self) -> String {
        self.coords.pod_name()
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|v| v.as_str())
    }

    /// An operator asks for an agent to be wound down by stamping
    /// `stop_requested=true` into the bead metadata. Such a bead stays open
    /// but no longer claims a pod.
    pub fn stop_requested(&self) -> bool {
        self.meta(meta::STOP_REQUESTED) == Some("true")
    }

    /// The image override carried by the bead, if any. An empty override is
    /// treated as absent.
    pub fn image(&self) -> Option<&str> {
        self.meta(meta::IMAGE).filter(|image| !image.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pod_name() {
        let coords = Coordinates {
            project: "p".to_string(),
            mode: "crew".to_string(),
            role: "dev".to_string(),
            agent: "alpha".to_string(),
        };
        assert_eq!("crew-p-dev-alpha", coords.pod_name());
    }

    #[test]
    fn pod_name_is_sanitized() {
        let coords = Coordinates {
            project: "My Project".to_string(),
            mode: "crew".to_string(),
            role: "dev_ops".to_string(),
            agent: "Alpha.1".to_string(),
        };
        assert_eq!("crew-my-project-dev-ops-alpha-1", coords.pod_name());
    }

    #[test]
    fn deserialize_bead_record() {
        let raw = r#"{
            "id": "bd-1",
            "type": "agent",
            "status": "open",
            "project": "p",
            "mode": "crew",
            "role": "dev",
            "agent_name": "alpha",
            "metadata": {
                "image": "reg/agent:latest",
                "stop_requested": "false"
            }
        }"#;
        let bead: Bead = serde_json::from_str(raw).unwrap();
        let agent = AgentBead::validate(bead).unwrap();
        assert_eq!("bd-1", agent.id);
        assert_eq!("crew-p-dev-alpha", agent.pod_name());
        assert_eq!(Some("reg/agent:latest"), agent.image());
        assert!(!agent.stop_requested());
    }

    #[test]
    fn mode_defaults_to_crew() {
        let raw = r#"{"id":"bd-2","type":"agent","role":"dev","agent_name":"beta","project":"p"}"#;
        let bead: Bead = serde_json::from_str(raw).unwrap();
        assert_eq!("crew", bead.coordinates().mode);
    }

    #[test]
    fn incomplete_coordinates_are_rejected() {
        let raw = r#"{"id":"bd-3","type":"agent","project":"p","role":"","agent_name":"x"}"#;
        let bead: Bead = serde_json::from_str(raw).unwrap();
        assert!(AgentBead::validate(bead).is_none());
    }

    #[test]
    fn non_agent_beads_are_rejected() {
        let raw = r#"{"id":"bd-4","type":"task","project":"p","role":"dev","agent_name":"x"}"#;
        let bead: Bead = serde_json::from_str(raw).unwrap();
        assert!(AgentBead::validate(bead).is_none());
    }

    #[test]
    fn empty_image_override_is_absent() {
        let raw = r#"{"id":"bd-5","type":"agent","project":"p","role":"dev","agent_name":"x",
                      "metadata":{"image":""}}"#;
        let bead: Bead = serde_json::from_str(raw).unwrap();
        let agent = AgentBead::validate(bead).unwrap();
        assert_eq!(None, agent.image());
    }
}
