//! Job plans and build assignments.

use crate::buildcause::BuildCause;
use crate::config::{JobConfig, TaskConfig};
use crate::ids::{AgentId, JobIdentifier, JobId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One schedulable unit of work awaiting agent assignment. Created when a
/// stage is scheduled, destroyed when assigned or invalidated by a
/// configuration change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobPlan {
    pub job_id: JobId,
    pub identifier: JobIdentifier,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub elastic_profile_id: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl JobPlan {
    pub fn from_config(
        identifier: JobIdentifier,
        config: &JobConfig,
        environment: Option<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: identifier.job_id,
            identifier,
            scheduled_at,
            resources: config.resources.clone(),
            environment,
            elastic_profile_id: config.elastic_profile_id.clone(),
            variables: config.variables.clone(),
        }
    }

    pub fn requires_elastic_agent(&self) -> bool {
        self.elastic_profile_id.is_some()
    }

    /// Older plans of lower pipeline counters rank first.
    pub fn ordering_key(&self) -> (DateTime<Utc>, u32) {
        (self.scheduled_at, self.identifier.stage.pipeline_counter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WorkDirPolicy {
    #[default]
    Keep,
    Clean,
}

/// One executable step of an assignment, derived from a task configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Builder {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl Builder {
    pub fn from_task(task: &TaskConfig) -> Self {
        Self {
            command: task.command.clone(),
            args: task.args.clone(),
            working_dir: task.working_dir.clone(),
        }
    }
}

/// The materialized unit of work sent to one agent for one job. Created once
/// per assignment attempt and discarded if the attempt aborts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildAssignment {
    pub plan: JobPlan,
    pub agent: AgentId,
    pub build_cause: BuildCause,
    pub builders: Vec<Builder>,
    pub environment_variables: HashMap<String, String>,
    #[serde(default)]
    pub work_dir_policy: WorkDirPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::StageIdentifier;

    #[test]
    fn test_ordering_key_sorts_older_first() {
        let now = Utc::now();
        let earlier = now - chrono::Duration::minutes(10);
        let stage = StageIdentifier::new("app", 1, "build", 1);
        let config = JobConfig {
            name: "unit".to_string(),
            resources: vec![],
            elastic_profile_id: None,
            variables: HashMap::new(),
            tasks: vec![],
        };

        let id_a = JobId::new();
        let a = JobPlan::from_config(
            JobIdentifier::new(stage.clone(), "unit", id_a),
            &config,
            None,
            earlier,
        );
        let id_b = JobId::new();
        let b = JobPlan::from_config(
            JobIdentifier::new(stage, "unit", id_b),
            &config,
            None,
            now,
        );

        assert!(a.ordering_key() < b.ordering_key());
    }
}
