//! Pipeline configuration snapshot types.
//!
//! Read-only views of the configuration store. Parsing and merging of
//! configuration files happens elsewhere; the scheduling core only ever sees
//! an immutable snapshot fetched at the start of an operation.

use crate::ids::PipelineName;
use crate::material::Material;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LockBehavior {
    #[default]
    None,
    LockOnFailure,
    UnlockWhenFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    pub name: PipelineName,
    pub materials: Vec<Material>,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub lock_behavior: LockBehavior,
    #[serde(default)]
    pub environment: Option<String>,
}

impl PipelineConfig {
    pub fn first_stage(&self) -> Option<&StageConfig> {
        self.stages.first()
    }

    pub fn stage_named(&self, name: &str) -> Option<&StageConfig> {
        self.stages
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn is_first_stage(&self, name: &str) -> bool {
        self.first_stage()
            .is_some_and(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn next_stage_after(&self, name: &str) -> Option<&StageConfig> {
        let idx = self
            .stages
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))?;
        self.stages.get(idx + 1)
    }

    pub fn previous_stage_before(&self, name: &str) -> Option<&StageConfig> {
        let idx = self
            .stages
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))?;
        if idx == 0 {
            return None;
        }
        self.stages.get(idx - 1)
    }

    pub fn dependency_materials(&self) -> impl Iterator<Item = &Material> {
        self.materials.iter().filter(|m| m.is_dependency())
    }

    pub fn is_lockable(&self) -> bool {
        self.lock_behavior != LockBehavior::None
    }

    pub fn is_unlockable_when_finished(&self) -> bool {
        self.lock_behavior == LockBehavior::UnlockWhenFinished
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// The stage runs automatically when the previous stage passes.
    #[default]
    Success,
    /// The stage waits for an explicit operator approval.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Approval {
    #[serde(default)]
    pub approval_type: ApprovalType,
    #[serde(default)]
    pub authorized_users: Vec<String>,
    #[serde(default)]
    pub authorized_roles: Vec<String>,
}

impl Approval {
    pub fn supports_auto_approval(&self) -> bool {
        self.approval_type == ApprovalType::Success
    }

    /// Empty authorization lists mean anyone may operate the stage.
    pub fn is_authorized(&self, user: &str) -> bool {
        if self.authorized_users.is_empty() && self.authorized_roles.is_empty() {
            return true;
        }
        self.authorized_users.iter().any(|u| u == user)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub approval: Approval,
    pub jobs: Vec<JobConfig>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl StageConfig {
    pub fn supports_auto_approval(&self) -> bool {
        self.approval.supports_auto_approval()
    }

    pub fn requires_approval(&self) -> bool {
        !self.approval.supports_auto_approval()
    }

    pub fn job_named(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub elastic_profile_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str) -> StageConfig {
        StageConfig {
            name: name.to_string(),
            approval: Approval::default(),
            jobs: vec![JobConfig {
                name: "unit".to_string(),
                resources: vec![],
                elastic_profile_id: None,
                variables: HashMap::new(),
                tasks: vec![],
            }],
            variables: HashMap::new(),
        }
    }

    fn pipeline(stages: Vec<StageConfig>) -> PipelineConfig {
        PipelineConfig {
            name: PipelineName::new("app"),
            materials: vec![],
            stages,
            variables: HashMap::new(),
            lock_behavior: LockBehavior::None,
            environment: None,
        }
    }

    #[test]
    fn test_stage_ordering_helpers() {
        let cfg = pipeline(vec![stage("build"), stage("test"), stage("deploy")]);

        assert_eq!(cfg.first_stage().unwrap().name, "build");
        assert_eq!(cfg.next_stage_after("build").unwrap().name, "test");
        assert_eq!(cfg.previous_stage_before("deploy").unwrap().name, "test");
        assert!(cfg.next_stage_after("deploy").is_none());
        assert!(cfg.previous_stage_before("build").is_none());
        assert!(cfg.is_first_stage("BUILD"));
    }

    #[test]
    fn test_empty_authorization_allows_anyone() {
        let approval = Approval::default();
        assert!(approval.is_authorized("anybody"));
    }

    #[test]
    fn test_authorization_list_restricts() {
        let approval = Approval {
            approval_type: ApprovalType::Manual,
            authorized_users: vec!["alice".to_string()],
            authorized_roles: vec![],
        };
        assert!(approval.is_authorized("alice"));
        assert!(!approval.is_authorized("mallory"));
    }
}
