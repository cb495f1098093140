//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and its
//! collaborators: the configuration store, persistence, the agent registry,
//! the elastic-agent subsystem, the material-update subsystem, and health
//! reporting. The core never sees their implementations.

use crate::agent::{AgentInstance, ElasticAgentMetadata};
use crate::buildcause::BuildCause;
use crate::config::{PipelineConfig, StageConfig};
use crate::events::SchedulingEvent;
use crate::ids::{
    AgentId, Fingerprint, JobId, PipelineIdentifier, PipelineInstanceId, PipelineName,
    StageIdentifier, StageInstanceId,
};
use crate::instance::{JobInstance, Pipeline, SchedulingContext, Stage};
use crate::material::{Material, MaterialRevision, MaterialRevisions, Modification};
use crate::plan::JobPlan;
use crate::result::{HealthScope, HealthState};
use crate::Result;
use async_trait::async_trait;
use chrono::Duration;

/// Read access to the current configuration snapshot.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Fails with `Error::PipelineNotFound` for unknown pipelines.
    async fn pipeline_config(&self, name: &PipelineName) -> Result<PipelineConfig>;

    async fn has_pipeline(&self, name: &PipelineName) -> Result<bool>;

    /// Fails with `Error::StageNotFound` for unknown stages.
    async fn stage_config(&self, name: &PipelineName, stage: &str) -> Result<StageConfig>;

    /// Every pipeline the periodic scheduling tick should consider.
    async fn scheduleable_pipelines(&self) -> Result<Vec<PipelineConfig>>;

    /// Elastic profiles currently defined, by id.
    async fn elastic_profile_ids(&self) -> Result<Vec<String>>;
}

/// Persistence for pipeline instances and their history.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Creates and persists a new pipeline instance; the store assigns the
    /// counter and label. Reports `Error::OutOfDate` when a concurrent
    /// configuration or material change invalidated the plan; callers
    /// discard the attempt and retry on the next cycle.
    async fn create_pipeline(
        &self,
        config: &PipelineConfig,
        cause: &BuildCause,
        context: &SchedulingContext,
    ) -> Result<Pipeline>;

    async fn latest_instance(&self, name: &PipelineName) -> Result<Option<Pipeline>>;

    async fn pipeline_by_counter(
        &self,
        name: &PipelineName,
        counter: u32,
    ) -> Result<Option<Pipeline>>;

    async fn load_pipeline(&self, id: PipelineInstanceId) -> Result<Option<Pipeline>>;

    async fn latest_passed_counter(&self, name: &PipelineName) -> Result<Option<u32>>;

    /// Counters of passed instances, newest first, strictly below `below`
    /// when given.
    async fn passed_counters_descending(
        &self,
        name: &PipelineName,
        below: Option<u32>,
        limit: usize,
    ) -> Result<Vec<u32>>;

    /// The revision of `fingerprint` that instance `name/counter` actually
    /// built with, if that instance exists and used the material.
    async fn material_revision_used(
        &self,
        name: &PipelineName,
        counter: u32,
        fingerprint: &Fingerprint,
    ) -> Result<Option<MaterialRevision>>;

    /// The dependency-material modification recorded when `name/counter`
    /// completed its dependency-visible stage. Never synthesized.
    async fn dependency_modification(
        &self,
        name: &PipelineName,
        counter: u32,
    ) -> Result<Option<Modification>>;
}

/// Persistence for stage instances.
#[async_trait]
pub trait StageStore: Send + Sync {
    async fn save_stage(&self, pipeline: &Pipeline, stage: &Stage) -> Result<()>;

    async fn update_stage(&self, stage: &Stage) -> Result<()>;

    async fn stage_by_id(&self, id: StageInstanceId) -> Result<Option<Stage>>;

    async fn stage_by_identifier(&self, identifier: &StageIdentifier) -> Result<Option<Stage>>;

    /// Every stage instance persisted for one pipeline run.
    async fn stages_of_pipeline_run(&self, pipeline: &PipelineIdentifier) -> Result<Vec<Stage>>;

    /// Whether any instance of this stage is active anywhere.
    async fn is_stage_active(&self, name: &PipelineName, stage: &str) -> Result<bool>;

    async fn most_recent_passed(&self, name: &PipelineName, stage: &str)
        -> Result<Option<Stage>>;
}

/// Persistence for job instances and the job-plan backlog.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn job_by_id(&self, id: JobId) -> Result<Option<JobInstance>>;

    async fn save_job(&self, job: &JobInstance) -> Result<()>;

    async fn update_state_and_result(&self, job: &JobInstance) -> Result<()>;

    async fn update_assigned_info(&self, job: &JobInstance) -> Result<()>;

    async fn load_plan(&self, id: JobId) -> Result<Option<JobPlan>>;

    async fn save_plan(&self, plan: &JobPlan) -> Result<()>;

    async fn discard_plan(&self, id: JobId) -> Result<()>;

    /// The pending backlog, in scheduling order.
    async fn scheduled_plans(&self) -> Result<Vec<JobPlan>>;

    /// Jobs assigned to one of `live_agents` with no activity for longer
    /// than `inactive_for`.
    async fn find_hung_jobs(
        &self,
        live_agents: &[AgentId],
        inactive_for: Duration,
    ) -> Result<Vec<JobInstance>>;

    async fn latest_active_job_on_agent(&self, agent: AgentId) -> Result<Option<JobInstance>>;
}

/// Runtime view of registered workers.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn registered_agents(&self) -> Result<Vec<AgentInstance>>;

    async fn agent(&self, id: AgentId) -> Result<Option<AgentInstance>>;
}

/// The elastic-agent subsystem boundary.
#[async_trait]
pub trait ElasticAgentGateway: Send + Sync {
    /// Confirms that this specific elastic agent is still eligible for the
    /// job's profile and environment.
    async fn should_assign_work(
        &self,
        agent: &ElasticAgentMetadata,
        profile_id: &str,
        environment: Option<&str>,
    ) -> Result<bool>;

    /// Requests creation of a new elastic agent for the profile.
    async fn create_agent(&self, profile_id: &str, environment: Option<&str>) -> Result<()>;
}

/// The material-update subsystem boundary.
#[async_trait]
pub trait MaterialSource: Send + Sync {
    async fn latest_revisions(&self, materials: &[Material]) -> Result<MaterialRevisions>;
}

/// Pipeline lock state (persisted alongside the pipeline counter row).
#[async_trait]
pub trait PipelineLocks: Send + Sync {
    async fn lock_if_needed(&self, pipeline: &Pipeline, config: &PipelineConfig) -> Result<()>;

    async fn unlock(&self, name: &PipelineName) -> Result<()>;

    async fn locked_by(&self, name: &PipelineName) -> Result<Option<PipelineIdentifier>>;
}

/// Pipeline pause state.
#[async_trait]
pub trait PauseStore: Send + Sync {
    async fn pause(&self, name: &PipelineName, user: &str, reason: &str) -> Result<()>;

    async fn unpause(&self, name: &PipelineName) -> Result<()>;

    async fn is_paused(&self, name: &PipelineName) -> Result<bool>;
}

/// Boolean authorization predicates consumed by the checker chain.
#[async_trait]
pub trait SecurityService: Send + Sync {
    async fn has_operate_permission(
        &self,
        user: &str,
        pipeline: &PipelineName,
        stage: &str,
    ) -> Result<bool>;
}

/// Human-visible scheduling health, scoped by entity.
#[async_trait]
pub trait HealthReporter: Send + Sync {
    async fn update(&self, state: HealthState);

    async fn remove_by_scope(&self, scope: &HealthScope);
}

/// Post-commit event publication.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: SchedulingEvent) -> Result<()>;
}
