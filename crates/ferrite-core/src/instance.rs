//! Persisted run-state: pipeline, stage and job instances.

use crate::agent::AgentInstance;
use crate::buildcause::BuildCause;
use crate::config::{PipelineConfig, StageConfig};
use crate::error::{Error, Result};
use crate::ids::{
    AgentId, JobId, JobIdentifier, PipelineIdentifier, PipelineInstanceId, PipelineName,
    StageIdentifier, StageInstanceId,
};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Assigned,
    Building,
    Completing,
    Completed,
    /// Superseded by a freshly created instance sharing the same job plan.
    Rescheduled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Rescheduled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobInstance {
    pub id: JobId,
    pub identifier: JobIdentifier,
    pub state: JobState,
    pub result: JobResult,
    pub agent: Option<AgentId>,
    pub scheduled_at: DateTime<Utc>,
    pub transitioned_at: DateTime<Utc>,
    /// Last console/heartbeat activity, used by hung-job detection.
    pub last_activity_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn scheduled(stage: StageIdentifier, job_name: &str, now: DateTime<Utc>) -> Self {
        let id = JobId::new();
        Self {
            id,
            identifier: JobIdentifier::new(stage, job_name, id),
            state: JobState::Scheduled,
            result: JobResult::Unknown,
            agent: None,
            scheduled_at: now,
            transitioned_at: now,
            last_activity_at: now,
        }
    }

    pub fn change_state(&mut self, state: JobState, now: DateTime<Utc>) {
        self.state = state;
        self.transitioned_at = now;
        self.last_activity_at = now;
    }

    pub fn assign(&mut self, agent: AgentId, now: DateTime<Utc>) {
        self.agent = Some(agent);
        self.change_state(JobState::Assigned, now);
    }

    pub fn completing(&mut self, result: JobResult, now: DateTime<Utc>) {
        self.result = result;
        self.change_state(JobState::Completing, now);
    }

    pub fn complete(&mut self, result: JobResult, now: DateTime<Utc>) {
        self.result = result;
        self.change_state(JobState::Completed, now);
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.result = JobResult::Cancelled;
        self.change_state(JobState::Completed, now);
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    pub fn is_rescheduled(&self) -> bool {
        self.state == JobState::Rescheduled
    }

    pub fn is_cancelled(&self) -> bool {
        self.result == JobResult::Cancelled
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Fresh instance replacing this one. Shares the job name and stage;
    /// the caller re-attaches the original job plan to the new id.
    pub fn reschedule_clone(&self, now: DateTime<Utc>) -> JobInstance {
        JobInstance::scheduled(self.identifier.stage.clone(), &self.identifier.job_name, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StageResult {
    Unknown,
    Passed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Stage {
    pub id: StageInstanceId,
    pub identifier: StageIdentifier,
    pub pipeline_id: PipelineInstanceId,
    pub approved_by: String,
    pub jobs: Vec<JobInstance>,
    pub result: StageResult,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Stage {
    /// A stage is active while any of its jobs is non-terminal.
    pub fn is_active(&self) -> bool {
        self.jobs.iter().any(|j| j.is_active())
    }

    pub fn is_completed(&self) -> bool {
        !self.is_active()
    }

    pub fn passed(&self) -> bool {
        self.result == StageResult::Passed
    }

    pub fn is_completed_and_passed(&self) -> bool {
        self.is_completed() && self.passed()
    }

    pub fn job_named(&self, name: &str) -> Option<&JobInstance> {
        self.jobs
            .iter()
            .find(|j| j.identifier.job_name.eq_ignore_ascii_case(name))
    }

    pub fn jobs_with_result(&self, results: &[JobResult]) -> Vec<&JobInstance> {
        self.jobs
            .iter()
            .filter(|j| results.contains(&j.result))
            .collect()
    }

    /// Recomputes the stage result from its jobs once all are terminal.
    /// Active stages stay Unknown.
    pub fn recompute_result(&mut self, now: DateTime<Utc>) {
        if self.is_active() {
            self.result = StageResult::Unknown;
            return;
        }
        let considered: Vec<&JobInstance> =
            self.jobs.iter().filter(|j| !j.is_rescheduled()).collect();
        self.result = if considered.iter().any(|j| j.result == JobResult::Cancelled) {
            StageResult::Cancelled
        } else if considered.iter().any(|j| j.result == JobResult::Failed) {
            StageResult::Failed
        } else {
            StageResult::Passed
        };
        self.completed_at = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub id: PipelineInstanceId,
    pub identifier: PipelineIdentifier,
    pub build_cause: BuildCause,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn name(&self) -> &PipelineName {
        &self.identifier.name
    }

    pub fn counter(&self) -> u32 {
        self.identifier.counter
    }

    pub fn has_stage_been_run(&self, stage_name: &str) -> bool {
        self.stages
            .iter()
            .any(|s| s.identifier.stage_name.eq_ignore_ascii_case(stage_name))
    }
}

/// Everything a stage-scheduling call needs from its surroundings: who
/// approved, which agents are visible to the pipeline's environment, which
/// elastic profiles exist, and the variable overrides accumulated so far.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    pub approved_by: String,
    pub available_agents: Vec<AgentInstance>,
    pub elastic_profile_ids: Vec<String>,
    pub variables: HashMap<String, String>,
}

impl SchedulingContext {
    pub fn new(approved_by: impl Into<String>, available_agents: Vec<AgentInstance>) -> Self {
        Self {
            approved_by: approved_by.into(),
            available_agents,
            elastic_profile_ids: Vec::new(),
            variables: HashMap::new(),
        }
    }

    pub fn with_elastic_profiles(mut self, profile_ids: Vec<String>) -> Self {
        self.elastic_profile_ids = profile_ids;
        self
    }

    /// Later overrides win over earlier ones.
    pub fn override_variables(mut self, overrides: &HashMap<String, String>) -> Self {
        for (k, v) in overrides {
            self.variables.insert(k.clone(), v.clone());
        }
        self
    }
}

/// Builds a new stage instance (and its jobs) from configuration.
///
/// Fails with `CannotSchedule` when the stage has no jobs, or when a job
/// references an elastic profile the context does not know about.
pub fn create_stage_instance(
    pipeline: &PipelineIdentifier,
    pipeline_id: PipelineInstanceId,
    stage_config: &StageConfig,
    stage_counter: u32,
    context: &SchedulingContext,
    now: DateTime<Utc>,
) -> Result<Stage> {
    if stage_config.jobs.is_empty() {
        return Err(Error::CannotSchedule {
            pipeline: pipeline.name.clone(),
            stage: stage_config.name.clone(),
            reason: "stage has no jobs".to_string(),
        });
    }
    for job in &stage_config.jobs {
        if let Some(profile) = &job.elastic_profile_id {
            if !context.elastic_profile_ids.iter().any(|p| p == profile) {
                return Err(Error::CannotSchedule {
                    pipeline: pipeline.name.clone(),
                    stage: stage_config.name.clone(),
                    reason: format!("unknown elastic profile '{}'", profile),
                });
            }
        }
    }

    let identifier = StageIdentifier::new(
        pipeline.name.clone(),
        pipeline.counter,
        stage_config.name.clone(),
        stage_counter,
    );
    let jobs = stage_config
        .jobs
        .iter()
        .map(|j| JobInstance::scheduled(identifier.clone(), &j.name, now))
        .collect();

    Ok(Stage {
        id: StageInstanceId::new(),
        identifier,
        pipeline_id,
        approved_by: context.approved_by.clone(),
        jobs,
        result: StageResult::Unknown,
        completed_at: None,
    })
}

/// Builds a new pipeline instance containing its first stage.
pub fn create_pipeline_instance(
    config: &PipelineConfig,
    build_cause: BuildCause,
    context: &SchedulingContext,
    counter: u32,
    now: DateTime<Utc>,
) -> Result<Pipeline> {
    let first_stage = config
        .first_stage()
        .ok_or_else(|| Error::CannotSchedule {
            pipeline: config.name.clone(),
            stage: String::new(),
            reason: "pipeline has no stages".to_string(),
        })?;

    let identifier = PipelineIdentifier::new(config.name.clone(), counter);
    let id = PipelineInstanceId::new();
    let stage = create_stage_instance(&identifier, id, first_stage, 1, context, now)?;

    Ok(Pipeline {
        id,
        identifier,
        build_cause,
        stages: vec![stage],
    })
}

/// Builds a rerun stage instance: the requested jobs get fresh instances,
/// every other job is carried over with its previous state and result.
pub fn create_stage_for_rerun_of_jobs(
    original: &Stage,
    job_names: &[String],
    stage_config: &StageConfig,
    context: &SchedulingContext,
    now: DateTime<Utc>,
) -> Result<Stage> {
    for name in job_names {
        if stage_config.job_named(name).is_none() {
            return Err(Error::JobNotFound {
                stage: original.identifier.clone(),
                job: name.clone(),
            });
        }
    }

    let identifier = StageIdentifier::new(
        original.identifier.pipeline_name.clone(),
        original.identifier.pipeline_counter,
        original.identifier.stage_name.clone(),
        original.identifier.stage_counter + 1,
    );

    let mut jobs = Vec::with_capacity(original.jobs.len());
    for job in &original.jobs {
        let rerun = job_names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(&job.identifier.job_name));
        if rerun {
            jobs.push(JobInstance::scheduled(
                identifier.clone(),
                &job.identifier.job_name,
                now,
            ));
        } else {
            let mut copied = job.clone();
            copied.id = JobId::new();
            copied.identifier =
                JobIdentifier::new(identifier.clone(), &job.identifier.job_name, copied.id);
            jobs.push(copied);
        }
    }

    Ok(Stage {
        id: StageInstanceId::new(),
        identifier,
        pipeline_id: original.pipeline_id,
        approved_by: context.approved_by.clone(),
        jobs,
        result: StageResult::Unknown,
        completed_at: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Approval, JobConfig, StageConfig};

    fn stage_config(jobs: Vec<&str>) -> StageConfig {
        StageConfig {
            name: "build".to_string(),
            approval: Approval::default(),
            jobs: jobs
                .iter()
                .map(|name| JobConfig {
                    name: name.to_string(),
                    resources: vec![],
                    elastic_profile_id: None,
                    variables: HashMap::new(),
                    tasks: vec![],
                })
                .collect(),
            variables: HashMap::new(),
        }
    }

    fn new_stage(jobs: Vec<&str>) -> Stage {
        let pipeline = PipelineIdentifier::new("app", 3);
        create_stage_instance(
            &pipeline,
            PipelineInstanceId::new(),
            &stage_config(jobs),
            1,
            &SchedulingContext::new("alice", vec![]),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_stage_active_until_all_jobs_terminal() {
        let mut stage = new_stage(vec!["unit", "lint"]);
        assert!(stage.is_active());

        let now = Utc::now();
        stage.jobs[0].complete(JobResult::Passed, now);
        assert!(stage.is_active());

        stage.jobs[1].complete(JobResult::Passed, now);
        assert!(!stage.is_active());
    }

    #[test]
    fn test_recompute_result_prefers_cancelled_over_failed() {
        let mut stage = new_stage(vec!["unit", "lint"]);
        let now = Utc::now();
        stage.jobs[0].complete(JobResult::Failed, now);
        stage.jobs[1].cancel(now);
        stage.recompute_result(now);
        assert_eq!(stage.result, StageResult::Cancelled);
    }

    #[test]
    fn test_recompute_result_ignores_rescheduled_jobs() {
        let mut stage = new_stage(vec!["unit", "lint"]);
        let now = Utc::now();
        stage.jobs[0].change_state(JobState::Rescheduled, now);
        stage.jobs[1].complete(JobResult::Passed, now);
        stage.recompute_result(now);
        assert_eq!(stage.result, StageResult::Passed);
    }

    #[test]
    fn test_empty_stage_cannot_be_scheduled() {
        let pipeline = PipelineIdentifier::new("app", 1);
        let err = create_stage_instance(
            &pipeline,
            PipelineInstanceId::new(),
            &stage_config(vec![]),
            1,
            &SchedulingContext::new("alice", vec![]),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::CannotSchedule { .. }));
    }

    #[test]
    fn test_rerun_clones_unaffected_jobs() {
        let mut original = new_stage(vec!["unit", "lint"]);
        let now = Utc::now();
        original.jobs[0].complete(JobResult::Failed, now);
        original.jobs[1].complete(JobResult::Passed, now);
        original.recompute_result(now);

        let rerun = create_stage_for_rerun_of_jobs(
            &original,
            &["unit".to_string()],
            &stage_config(vec!["unit", "lint"]),
            &SchedulingContext::new("bob", vec![]),
            now,
        )
        .unwrap();

        assert_eq!(rerun.identifier.stage_counter, 2);
        let unit = rerun.job_named("unit").unwrap();
        assert_eq!(unit.state, JobState::Scheduled);
        let lint = rerun.job_named("lint").unwrap();
        assert_eq!(lint.result, JobResult::Passed);
    }

    #[test]
    fn test_rerun_unknown_job_fails() {
        let original = new_stage(vec!["unit"]);
        let err = create_stage_for_rerun_of_jobs(
            &original,
            &["nope".to_string()],
            &stage_config(vec!["unit"]),
            &SchedulingContext::new("bob", vec![]),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::JobNotFound { .. }));
    }
}
