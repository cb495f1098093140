//! Agent runtime state.

use crate::ids::AgentId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Building,
    Disabled,
    LostContact,
    Pending,
}

impl AgentStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }

    pub fn is_known_live(&self) -> bool {
        !matches!(self, AgentStatus::LostContact)
    }
}

/// Metadata attached to dynamically provisioned agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ElasticAgentMetadata {
    pub elastic_agent_id: String,
    pub plugin_id: String,
}

/// Runtime view of a registered worker. Mutated by heartbeats and by
/// assignment, never by configuration alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AgentInstance {
    pub id: AgentId,
    pub hostname: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub environments: Vec<String>,
    pub status: AgentStatus,
    #[serde(default)]
    pub elastic: Option<ElasticAgentMetadata>,
    pub registered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl AgentInstance {
    pub fn is_idle(&self) -> bool {
        self.status.is_available()
    }

    pub fn is_elastic(&self) -> bool {
        self.elastic.is_some()
    }

    pub fn has_resources(&self, required: &[String]) -> bool {
        required.iter().all(|r| self.resources.contains(r))
    }

    pub fn is_in_environment(&self, environment: &str) -> bool {
        self.environments.iter().any(|e| e == environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(resources: Vec<&str>, environments: Vec<&str>) -> AgentInstance {
        AgentInstance {
            id: AgentId::new(),
            hostname: "worker-1".to_string(),
            resources: resources.iter().map(|s| s.to_string()).collect(),
            environments: environments.iter().map(|s| s.to_string()).collect(),
            status: AgentStatus::Idle,
            elastic: None,
            registered_at: Utc::now(),
            last_heartbeat_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_resource_matching_requires_all() {
        let a = agent(vec!["linux", "docker"], vec![]);
        assert!(a.has_resources(&["linux".to_string()]));
        assert!(a.has_resources(&["linux".to_string(), "docker".to_string()]));
        assert!(!a.has_resources(&["windows".to_string()]));
    }

    #[test]
    fn test_lost_contact_is_not_live() {
        let mut a = agent(vec![], vec![]);
        a.status = AgentStatus::LostContact;
        assert!(!a.status.is_known_live());
        assert!(!a.is_idle());
    }
}
