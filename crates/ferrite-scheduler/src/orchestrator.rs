//! State-transition logic for pipelines, stages and jobs.
//!
//! Drives promotion of staged build causes, stage creation and rerun, job
//! rerun, cancellation, hung-job rescheduling, agent status reports and the
//! cascade that auto-triggers the next stage when one completes.
//!
//! Mutual exclusion: promotion and the pause toggle run under the
//! per-pipeline-name scope; cancellation, status updates and the completion
//! cascade under the per-stage-instance scope; reschedule-vs-update races
//! under the per-job scope nested inside it. One global scope serializes
//! queue draining so two timer ticks never double-promote.

use crate::checks::SchedulingChecker;
use crate::config::SchedulerConfig;
use crate::locks::MutexRegistry;
use crate::queue::PipelineScheduleQueue;
use chrono::Utc;
use ferrite_core::buildcause::{BuildCause, DEFAULT_APPROVED_BY};
use ferrite_core::config::{PipelineConfig, StageConfig};
use ferrite_core::events::SchedulingEvent;
use ferrite_core::ids::{AgentId, JobIdentifier, PipelineName, StageInstanceId};
use ferrite_core::instance::{
    create_stage_for_rerun_of_jobs, create_stage_instance, JobInstance, JobResult, JobState,
    Pipeline, SchedulingContext, Stage,
};
use ferrite_core::plan::JobPlan;
use ferrite_core::ports::{
    AgentRegistry, ConfigProvider, EventSink, HealthReporter, JobStore, PauseStore, PipelineLocks,
    PipelineStore, SecurityService, StageStore,
};
use ferrite_core::result::{HealthScope, HealthState, OperationResult};
use ferrite_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How a stage instance comes into being.
pub enum StageInstanceCreator {
    /// A fresh instance of every job in the stage.
    New,
    /// Fresh instances for the named jobs only, everything else carried
    /// over from the original run.
    RerunJobs { original: Stage, jobs: Vec<String> },
}

pub struct ScheduleService {
    configs: Arc<dyn ConfigProvider>,
    pipelines: Arc<dyn PipelineStore>,
    stages: Arc<dyn StageStore>,
    jobs: Arc<dyn JobStore>,
    agents: Arc<dyn AgentRegistry>,
    locks: Arc<dyn PipelineLocks>,
    pauses: Arc<dyn PauseStore>,
    security: Arc<dyn SecurityService>,
    health: Arc<dyn HealthReporter>,
    events: Arc<dyn EventSink>,
    queue: Arc<PipelineScheduleQueue>,
    checker: Arc<SchedulingChecker>,
    mutexes: Arc<MutexRegistry>,
    auto_schedule_scope: Mutex<()>,
    tuning: SchedulerConfig,
}

impl ScheduleService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        configs: Arc<dyn ConfigProvider>,
        pipelines: Arc<dyn PipelineStore>,
        stages: Arc<dyn StageStore>,
        jobs: Arc<dyn JobStore>,
        agents: Arc<dyn AgentRegistry>,
        locks: Arc<dyn PipelineLocks>,
        pauses: Arc<dyn PauseStore>,
        security: Arc<dyn SecurityService>,
        health: Arc<dyn HealthReporter>,
        events: Arc<dyn EventSink>,
        queue: Arc<PipelineScheduleQueue>,
        checker: Arc<SchedulingChecker>,
        mutexes: Arc<MutexRegistry>,
        tuning: SchedulerConfig,
    ) -> Self {
        Self {
            configs,
            pipelines,
            stages,
            jobs,
            agents,
            locks,
            pauses,
            security,
            health,
            events,
            queue,
            checker,
            mutexes,
            auto_schedule_scope: Mutex::new(()),
            tuning,
        }
    }

    /// Drains the schedule queue. Called from a timer; one pipeline's
    /// failure never stops the tick from processing the rest.
    pub async fn auto_schedule_pipelines_from_request_buffer(&self) {
        let _scope = self.auto_schedule_scope.lock().await;

        let mut gate = OperationResult::new();
        if let Err(e) = self.checker.can_schedule(&mut gate).await {
            error!(error = %e, "[Pipeline Schedule] global gate evaluation failed");
            return;
        }
        if !gate.can_continue() {
            debug!("[Pipeline Schedule] scheduling suspended: {:?}", gate.message());
            return;
        }

        for (name, cause) in self.queue.to_be_scheduled() {
            info!(pipeline = %name, "[Pipeline Schedule] scheduling pipeline");
            if let Err(e) = self.schedule_pipeline(&name, &cause).await {
                error!(pipeline = %name, error = %e, "[Pipeline Schedule] error while scheduling");
            }
        }
    }

    /// Promotes one staged cause. Configuration errors purge the staged
    /// entry; precondition failures leave it for a later tick.
    pub async fn schedule_pipeline(
        &self,
        name: &PipelineName,
        cause: &BuildCause,
    ) -> Result<Option<Pipeline>> {
        let lock = self.mutexes.for_pipeline(name);
        let _pipeline_scope = lock.lock().await;

        let config = match self.configs.pipeline_config(name).await {
            Ok(config) => config,
            Err(Error::PipelineNotFound(_)) => {
                error!(pipeline = %name, "pipeline vanished from configuration");
                self.queue.cancel_staged(name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut gate = OperationResult::new();
        self.checker
            .can_auto_trigger_consumer(&config, &mut gate)
            .await?;
        if !gate.can_continue() {
            debug!(pipeline = %name, "not promotable right now, staged cause kept");
            return Ok(None);
        }

        let Some(first_stage) = config.first_stage() else {
            self.queue.cancel_staged(name);
            return Ok(None);
        };
        let context = self
            .scheduling_context(cause.approver(), &config, first_stage)
            .await?;

        match self.queue.promote(name, cause, &config, &context).await {
            Ok(Some(pipeline)) => {
                self.locks.lock_if_needed(&pipeline, &config).await?;
                if let Some(stage) = pipeline.stages.first() {
                    self.persist_plans(stage, first_stage, &config).await?;
                    self.health
                        .update(HealthState::success(HealthScope::for_stage(
                            name.clone(),
                            stage.identifier.stage_name.clone(),
                        )))
                        .await;
                }
                self.publish(SchedulingEvent::PipelineCreated {
                    identifier: pipeline.identifier.clone(),
                    forced: pipeline.build_cause.is_forced(),
                    approver: pipeline.build_cause.approver().to_string(),
                })
                .await;
                Ok(Some(pipeline))
            }
            Ok(None) => Ok(None),
            Err(Error::CannotSchedule {
                pipeline: p,
                stage,
                reason,
            }) => {
                self.queue.cancel_staged(name);
                self.health
                    .update(HealthState::error(
                        format!("Failed to schedule stage {} for pipeline {}", stage, p),
                        reason,
                        HealthScope::for_stage(p.clone(), stage),
                    ))
                    .await;
                Ok(None)
            }
            Err(e) => {
                error!(pipeline = %name, error = %e, "error while scheduling pipeline");
                self.queue.cancel_staged(name);
                Ok(None)
            }
        }
    }

    async fn scheduling_context(
        &self,
        username: &str,
        config: &PipelineConfig,
        stage_config: &StageConfig,
    ) -> Result<SchedulingContext> {
        let all = self.agents.registered_agents().await?;
        let available = match &config.environment {
            Some(env) => all
                .into_iter()
                .filter(|a| a.is_in_environment(env))
                .collect(),
            None => all
                .into_iter()
                .filter(|a| a.environments.is_empty())
                .collect(),
        };
        let profiles = self.configs.elastic_profile_ids().await?;
        Ok(SchedulingContext::new(username, available)
            .with_elastic_profiles(profiles)
            .override_variables(&config.variables)
            .override_variables(&stage_config.variables))
    }

    async fn persist_plans(
        &self,
        stage: &Stage,
        stage_config: &StageConfig,
        config: &PipelineConfig,
    ) -> Result<()> {
        for job in &stage.jobs {
            if job.state != JobState::Scheduled || job.result != JobResult::Unknown {
                continue;
            }
            if let Some(job_config) = stage_config.job_named(&job.identifier.job_name) {
                let plan = JobPlan::from_config(
                    job.identifier.clone(),
                    job_config,
                    config.environment.clone(),
                    job.scheduled_at,
                );
                self.jobs.save_plan(&plan).await?;
            }
        }
        Ok(())
    }

    /// Creates and persists a stage instance (plus job instances and plans).
    /// A missing stage configuration is a configuration inconsistency and
    /// fails the operation.
    pub async fn schedule_stage(
        &self,
        pipeline: &Pipeline,
        stage_name: &str,
        username: &str,
        creator: StageInstanceCreator,
    ) -> Result<Stage> {
        let config = self.configs.pipeline_config(pipeline.name()).await?;
        let stage_config = config
            .stage_named(stage_name)
            .ok_or_else(|| Error::StageNotFound {
                pipeline: pipeline.name().clone(),
                stage: stage_name.to_string(),
            })?;
        let context = self
            .scheduling_context(username, &config, stage_config)
            .await?;
        self.locks.lock_if_needed(pipeline, &config).await?;

        let now = Utc::now();
        let built = match &creator {
            StageInstanceCreator::New => {
                let counter = self
                    .stages
                    .stages_of_pipeline_run(&pipeline.identifier)
                    .await?
                    .iter()
                    .filter(|s| s.identifier.stage_name.eq_ignore_ascii_case(stage_name))
                    .map(|s| s.identifier.stage_counter)
                    .max()
                    .map(|c| c + 1)
                    .unwrap_or(1);
                create_stage_instance(
                    &pipeline.identifier,
                    pipeline.id,
                    stage_config,
                    counter,
                    &context,
                    now,
                )
            }
            StageInstanceCreator::RerunJobs { original, jobs } => {
                create_stage_for_rerun_of_jobs(original, jobs, stage_config, &context, now)
            }
        };

        let stage = match built {
            Ok(stage) => stage,
            Err(e) => {
                if let Error::CannotSchedule { pipeline, stage, reason } = &e {
                    self.health
                        .update(HealthState::error(
                            format!("Failed to schedule stage {} for pipeline {}", stage, pipeline),
                            reason.clone(),
                            HealthScope::for_stage(pipeline.clone(), stage.clone()),
                        ))
                        .await;
                }
                return Err(e);
            }
        };

        self.stages.save_stage(pipeline, &stage).await?;
        self.persist_plans(&stage, stage_config, &config).await?;
        self.health
            .update(HealthState::success(HealthScope::for_stage(
                pipeline.name().clone(),
                stage_name,
            )))
            .await;
        self.publish(SchedulingEvent::StageScheduled {
            identifier: stage.identifier.clone(),
            approved_by: stage.approved_by.clone(),
        })
        .await;
        info!(
            pipeline = %pipeline.name(),
            stage = %stage_name,
            "[Stage Schedule] scheduling stage"
        );
        Ok(stage)
    }

    /// Top-level rerun of a whole stage; reports through `result`.
    pub async fn rerun_stage(
        &self,
        name: &PipelineName,
        counter: u32,
        stage_name: &str,
        user: &str,
        result: &mut OperationResult,
    ) -> Option<Stage> {
        let outcome = self
            .lock_and_rerun_stage(name, counter, stage_name, user, None, result)
            .await;
        self.finish_rerun(name, counter, stage_name, outcome, result)
    }

    /// Top-level rerun of selected jobs within a stage.
    pub async fn rerun_jobs(
        &self,
        stage: &Stage,
        job_names: &[String],
        user: &str,
        result: &mut OperationResult,
    ) -> Option<Stage> {
        let identifier = &stage.identifier;
        if job_names.is_empty() {
            let message = "No job was selected to re-run.";
            result.not_acceptable(
                message,
                message,
                HealthScope::for_stage(
                    identifier.pipeline_name.clone(),
                    identifier.stage_name.clone(),
                ),
            );
            return None;
        }
        let outcome = self
            .lock_and_rerun_stage(
                &identifier.pipeline_name.clone(),
                identifier.pipeline_counter,
                &identifier.stage_name.clone(),
                user,
                Some((stage.clone(), job_names.to_vec())),
                result,
            )
            .await;
        self.finish_rerun(
            &identifier.pipeline_name,
            identifier.pipeline_counter,
            &identifier.stage_name,
            outcome,
            result,
        )
    }

    /// Rerun of every failed or cancelled job in the stage.
    pub async fn rerun_failed_jobs(
        &self,
        stage: &Stage,
        user: &str,
        result: &mut OperationResult,
    ) -> Option<Stage> {
        let names: Vec<String> = stage
            .jobs_with_result(&[JobResult::Cancelled, JobResult::Failed])
            .iter()
            .map(|j| j.identifier.job_name.clone())
            .collect();
        if names.is_empty() {
            let message = "There are no failed jobs in the stage that could be re-run";
            result.not_acceptable(
                message,
                message,
                HealthScope::for_stage(
                    stage.identifier.pipeline_name.clone(),
                    stage.identifier.stage_name.clone(),
                ),
            );
            return None;
        }
        self.rerun_jobs(stage, &names, user, result).await
    }

    fn finish_rerun(
        &self,
        name: &PipelineName,
        counter: u32,
        stage_name: &str,
        outcome: Result<Option<Stage>>,
        result: &mut OperationResult,
    ) -> Option<Stage> {
        match outcome {
            Ok(stage) => {
                if result.can_continue() && stage.is_some() {
                    result.accepted(format!(
                        "Request to schedule stage {}/{}/{} accepted",
                        name, counter, stage_name
                    ));
                }
                stage
            }
            Err(e) => {
                if result.can_continue() {
                    let message = format!(
                        "Stage rerun request for stage [{}/{}/{}] could not be completed because of an unexpected failure. Cause: {}",
                        name, counter, stage_name, e
                    );
                    error!("{}", message);
                    result.internal_error(
                        message,
                        e.to_string(),
                        HealthScope::for_stage(name.clone(), stage_name),
                    );
                }
                None
            }
        }
    }

    async fn lock_and_rerun_stage(
        &self,
        name: &PipelineName,
        counter: u32,
        stage_name: &str,
        user: &str,
        rerun_jobs: Option<(Stage, Vec<String>)>,
        result: &mut OperationResult,
    ) -> Result<Option<Stage>> {
        let lock = self.mutexes.for_pipeline(name);
        let _pipeline_scope = lock.lock().await;

        self.checker.can_schedule(result).await?;
        if !result.can_continue() {
            return Ok(None);
        }

        let Some(pipeline) = self.pipelines.pipeline_by_counter(name, counter).await? else {
            result.not_found(
                format!("Pipeline instance [{}/{}] not found", name, counter),
                String::new(),
                HealthScope::Global,
            );
            return Ok(None);
        };

        let config = self.configs.pipeline_config(name).await?;
        if let Some(previous) = config.previous_stage_before(stage_name) {
            let runs = self
                .stages
                .stages_of_pipeline_run(&pipeline.identifier)
                .await?;
            let previous_run = runs
                .iter()
                .filter(|s| s.identifier.stage_name.eq_ignore_ascii_case(&previous.name))
                .max_by_key(|s| s.identifier.stage_counter);
            match previous_run {
                None => {
                    let message = format!(
                        "Can not run stage [{}] in pipeline [{}] because its previous stage has not been run.",
                        stage_name, name
                    );
                    result.not_acceptable(
                        message.clone(),
                        message,
                        HealthScope::for_stage(name.clone(), stage_name),
                    );
                    return Ok(None);
                }
                Some(run) if !run.passed() => {
                    let message = format!(
                        "Cannot schedule {} as the previous stage {} has {:?}!",
                        stage_name, previous.name, run.result
                    );
                    result.not_acceptable(
                        message.clone(),
                        message,
                        HealthScope::for_stage(name.clone(), stage_name),
                    );
                    return Ok(None);
                }
                _ => {}
            }
        }

        self.checker
            .can_rerun_stage(&config, &pipeline.identifier, stage_name, user, result)
            .await?;
        if !result.can_continue() {
            return Ok(None);
        }

        let creator = match rerun_jobs {
            Some((original, jobs)) => StageInstanceCreator::RerunJobs { original, jobs },
            None => StageInstanceCreator::New,
        };
        match self.schedule_stage(&pipeline, stage_name, user, creator).await {
            Ok(stage) => Ok(Some(stage)),
            Err(Error::CannotSchedule { reason, .. }) => {
                result.conflict(
                    format!("Cannot schedule: {}", reason),
                    reason,
                    HealthScope::for_stage(name.clone(), stage_name),
                );
                Ok(None)
            }
            Err(Error::StageNotFound { pipeline, stage }) => {
                result.not_found(
                    format!("Stage [{}] not found in pipeline [{}]", stage, pipeline),
                    String::new(),
                    HealthScope::for_stage(name.clone(), stage_name),
                );
                Ok(None)
            }
            Err(Error::JobNotFound { job, .. }) => {
                result.not_found(
                    format!("Job [{}] not found", job),
                    String::new(),
                    HealthScope::for_stage(name.clone(), stage_name),
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Cancels every non-terminal job of the stage, then evaluates the
    /// completion cascade under the same stage-instance scope. A cancelled
    /// stage never triggers its successor.
    pub async fn cancel_and_trigger_relevant_stages(
        &self,
        stage_id: StageInstanceId,
        user: Option<&str>,
        result: &mut OperationResult,
    ) -> Result<Option<Stage>> {
        let Some(stage_for_id) = self.stages.stage_by_id(stage_id).await? else {
            result.not_found(
                format!("Stage '{}' not found.", stage_id),
                String::new(),
                HealthScope::Global,
            );
            return Ok(None);
        };
        if !stage_for_id.is_active() {
            result.accepted("Stage is not active. Cancellation Ignored.");
            return Ok(Some(stage_for_id));
        }

        let lock = self.mutexes.for_stage_instance(&stage_for_id.identifier);
        let _stage_scope = lock.lock().await;

        // reload so we see committed state after acquiring the scope
        let Some(mut stage) = self.stages.stage_by_id(stage_id).await? else {
            return Ok(None);
        };

        let pipeline_name = stage.identifier.pipeline_name.clone();
        let stage_name = stage.identifier.stage_name.clone();
        if let Some(user) = user {
            let allowed = self
                .security_check(user, &pipeline_name, &stage_name)
                .await?;
            if !allowed {
                result.unauthorized(
                    format!("Unauthorized to operate stage named {}", stage_name),
                    String::new(),
                    HealthScope::for_stage(pipeline_name, stage_name),
                );
                return Ok(None);
            }
        }

        info!(stage = %stage.identifier, "[Stage Cancellation] cancelling stage");
        let now = Utc::now();
        for job in stage.jobs.iter_mut().filter(|j| j.is_active()) {
            job.cancel(now);
            self.jobs.update_state_and_result(job).await?;
            self.jobs.discard_plan(job.id).await?;
        }
        stage.recompute_result(now);
        self.stages.update_stage(&stage).await?;
        self.publish(SchedulingEvent::StageCancelled {
            identifier: stage.identifier.clone(),
            cancelled_by: user.map(|u| u.to_string()),
        })
        .await;

        // still holding the scope: unlocks and cross-pipeline cascades may
        // fire, the next stage of a cancelled run must not
        self.automatically_trigger_relevant_stages_following_completion_of(&stage)
            .await?;

        result.accepted("Stage cancelled successfully.");
        Ok(Some(stage))
    }

    async fn security_check(
        &self,
        user: &str,
        pipeline: &PipelineName,
        stage: &str,
    ) -> Result<bool> {
        self.security
            .has_operate_permission(user, pipeline, stage)
            .await
    }

    /// On any completed stage: unlock if this was the pipeline's effective
    /// end, re-trigger the same stage in a newer instance when one exists
    /// (re-entrancy protection against stale instances), and auto-trigger
    /// the successor when this stage passed.
    pub async fn automatically_trigger_relevant_stages_following_completion_of(
        &self,
        stage: &Stage,
    ) -> Result<()> {
        if stage.is_active() {
            return Ok(());
        }
        let Some(pipeline) = self.pipelines.load_pipeline(stage.pipeline_id).await? else {
            warn!(stage = %stage.identifier, "pipeline instance missing, skipping cascade");
            return Ok(());
        };

        self.unlock_if_necessary(&pipeline, stage).await?;

        if self.pauses.is_paused(pipeline.name()).await? {
            return Ok(());
        }

        if self
            .should_trigger_this_stage_in_newer_pipeline(&pipeline, stage)
            .await?
        {
            self.trigger_current_stage_in_newer_pipeline(pipeline.name(), stage)
                .await?;
        }

        if stage.is_completed_and_passed() {
            self.trigger_next_stage_in_pipeline(
                &pipeline,
                &stage.identifier.stage_name,
                DEFAULT_APPROVED_BY,
            )
            .await?;
        }
        Ok(())
    }

    /// Unlocks after the last stage, or once an unlockable-when-finished
    /// pipeline's run is effectively complete.
    pub async fn unlock_if_necessary(&self, pipeline: &Pipeline, stage: &Stage) -> Result<()> {
        let config = self.configs.pipeline_config(pipeline.name()).await?;
        let next = config.next_stage_after(&stage.identifier.stage_name);

        let is_last_stage = next.is_none();
        let is_unlockable = config.is_unlockable_when_finished();
        let next_stage_is_manual = next.is_some_and(|n| n.requires_approval());
        let run_considered_complete =
            stage.is_completed() && (!stage.passed() || next_stage_is_manual);

        if is_last_stage || (is_unlockable && run_considered_complete) {
            self.locks.unlock(pipeline.name()).await?;
        }
        Ok(())
    }

    async fn should_trigger_this_stage_in_newer_pipeline(
        &self,
        pipeline: &Pipeline,
        stage: &Stage,
    ) -> Result<bool> {
        let config = self.configs.pipeline_config(pipeline.name()).await?;
        let stage_name = &stage.identifier.stage_name;
        Ok(!config.is_first_stage(stage_name)
            && config
                .stage_named(stage_name)
                .is_some_and(|s| s.supports_auto_approval()))
    }

    /// When a newer pipeline instance has a fresher passing run of the
    /// previous stage and has not yet run this stage, trigger it there
    /// instead of in the older instance.
    async fn trigger_current_stage_in_newer_pipeline(
        &self,
        name: &PipelineName,
        current: &Stage,
    ) -> Result<()> {
        let config = self.configs.pipeline_config(name).await?;
        let Some(previous) = config.previous_stage_before(&current.identifier.stage_name) else {
            return Ok(());
        };
        let Some(most_recent_passed) = self.stages.most_recent_passed(name, &previous.name).await?
        else {
            return Ok(());
        };
        if most_recent_passed.identifier.pipeline_counter <= current.identifier.pipeline_counter {
            return Ok(());
        }
        let Some(newer_pipeline) = self
            .pipelines
            .pipeline_by_counter(name, most_recent_passed.identifier.pipeline_counter)
            .await?
        else {
            return Ok(());
        };
        let already_run = self
            .stages
            .stages_of_pipeline_run(&newer_pipeline.identifier)
            .await?
            .iter()
            .any(|s| {
                s.identifier
                    .stage_name
                    .eq_ignore_ascii_case(&current.identifier.stage_name)
            });
        if !already_run {
            self.trigger_next_stage_in_pipeline(
                &newer_pipeline,
                &most_recent_passed.identifier.stage_name,
                DEFAULT_APPROVED_BY,
            )
            .await?;
        }
        Ok(())
    }

    async fn trigger_next_stage_in_pipeline(
        &self,
        pipeline: &Pipeline,
        stage_name: &str,
        approved_by: &str,
    ) -> Result<()> {
        let config = self.configs.pipeline_config(pipeline.name()).await?;
        let Some(next) = config.next_stage_after(stage_name) else {
            return Ok(());
        };
        if !next.supports_auto_approval() {
            return Ok(());
        }
        if self
            .stages
            .is_stage_active(pipeline.name(), &next.name)
            .await?
        {
            return Ok(());
        }
        self.schedule_stage(
            pipeline,
            &next.name.clone(),
            approved_by,
            StageInstanceCreator::New,
        )
        .await?;
        Ok(())
    }

    /// Timer-driven: finds jobs on live agents with no activity past the
    /// configured threshold and reschedules them. Never propagates errors.
    pub async fn reschedule_hung_jobs(&self) {
        let live: Vec<AgentId> = match self.agents.registered_agents().await {
            Ok(agents) => agents
                .iter()
                .filter(|a| a.status.is_known_live())
                .map(|a| a.id)
                .collect(),
            Err(e) => {
                error!(error = %e, "error occurred during reschedule hung jobs");
                return;
            }
        };
        if live.is_empty() {
            return;
        }
        let hung = match self
            .jobs
            .find_hung_jobs(&live, self.tuning.hung_job_threshold())
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "error occurred during reschedule hung jobs");
                return;
            }
        };
        for job in hung {
            warn!(job = %job.identifier, "found hung job, rescheduling it");
            if let Err(e) = self.reschedule_job(&job).await {
                error!(job = %job.identifier, error = %e, "failed to reschedule hung job");
            }
        }
    }

    /// An agent reporting idle while a job is still assigned to it lost its
    /// assignment; the job is rescheduled before the agent gets new work.
    pub async fn reschedule_abandoned_build_if_necessary(&self, agent: AgentId) -> Result<()> {
        if let Some(job) = self.jobs.latest_active_job_on_agent(agent).await? {
            warn!(agent = %agent, job = %job.identifier, "[Job Reschedule] found incomplete job for agent");
            self.reschedule_job(&job).await?;
        }
        Ok(())
    }

    /// Marks the job Rescheduled and persists a fresh clone sharing the
    /// original job plan. At most one live instance of a job identity
    /// exists afterwards.
    pub async fn reschedule_job(&self, to_reschedule: &JobInstance) -> Result<()> {
        let identifier = &to_reschedule.identifier;
        let stage_lock = self.mutexes.for_stage_instance(&identifier.stage);
        let _stage_scope = stage_lock.lock().await;
        let job_lock = self.mutexes.for_job(identifier);
        let _job_scope = job_lock.lock().await;

        // reload: we want the latest committed state after acquiring scopes
        let Some(mut old_job) = self.jobs.job_by_id(to_reschedule.id).await? else {
            return Ok(());
        };
        if old_job.is_completed() || old_job.is_rescheduled() {
            return Ok(());
        }

        warn!(job = %old_job.identifier, "[Job Reschedule] rescheduling and marking old job as ignored");
        let now = Utc::now();
        let new_job = old_job.reschedule_clone(now);
        old_job.change_state(JobState::Rescheduled, now);
        self.jobs.update_state_and_result(&old_job).await?;

        let plan = self.jobs.load_plan(old_job.id).await?;
        self.jobs.save_job(&new_job).await?;
        if let Some(mut plan) = plan {
            plan.job_id = new_job.id;
            plan.identifier = new_job.identifier.clone();
            self.jobs.discard_plan(old_job.id).await?;
            self.jobs.save_plan(&plan).await?;
        }
        self.publish(SchedulingEvent::JobRescheduled {
            old: old_job.identifier.clone(),
            new: new_job.identifier.clone(),
        })
        .await;
        info!(
            new = %new_job.identifier,
            old = %old_job.identifier,
            "[Job Reschedule] scheduled new job, replacing old job"
        );
        Ok(())
    }

    /// Applies an agent-reported state transition. Stale reports for jobs
    /// already Rescheduled or Cancelled are dropped.
    pub async fn update_job_status(
        &self,
        identifier: &JobIdentifier,
        state: JobState,
    ) -> Result<()> {
        let stage_lock = self.mutexes.for_stage_instance(&identifier.stage);
        let _stage_scope = stage_lock.lock().await;
        let job_lock = self.mutexes.for_job(identifier);
        let _job_scope = job_lock.lock().await;

        let Some(mut job) = self.jobs.job_by_id(identifier.job_id).await? else {
            return Ok(());
        };
        if job.is_rescheduled() || job.is_cancelled() {
            debug!(job = %identifier, "dropping stale status report");
            return Ok(());
        }

        let now = Utc::now();
        job.change_state(state, now);
        self.jobs.update_state_and_result(&job).await?;

        if !job.is_completed() {
            return Ok(());
        }
        self.publish(SchedulingEvent::JobCompleted {
            identifier: job.identifier.clone(),
            result: job.result,
        })
        .await;

        let Some(mut stage) = self.stages.stage_by_identifier(&identifier.stage).await? else {
            return Ok(());
        };
        if let Some(slot) = stage.jobs.iter_mut().find(|j| j.id == job.id) {
            *slot = job.clone();
        }
        stage.recompute_result(now);
        self.stages.update_stage(&stage).await?;

        if stage.is_completed() {
            self.publish(SchedulingEvent::StageCompleted {
                identifier: stage.identifier.clone(),
                result: stage.result,
            })
            .await;
            // separate step: a cascade failure (e.g. the next stage cannot
            // be scheduled) must not fail the status update itself
            if let Err(e) = self
                .automatically_trigger_relevant_stages_following_completion_of(&stage)
                .await
            {
                error!(stage = %stage.identifier, error = %e, "failed to trigger next stage");
            }
        }
        Ok(())
    }

    /// The agent that reports completion must be the one that was assigned.
    pub async fn job_completing(
        &self,
        identifier: &JobIdentifier,
        result: JobResult,
        agent: AgentId,
    ) -> Result<()> {
        let stage_lock = self.mutexes.for_stage_instance(&identifier.stage);
        let _stage_scope = stage_lock.lock().await;
        let job_lock = self.mutexes.for_job(identifier);
        let _job_scope = job_lock.lock().await;

        let Some(mut job) = self.jobs.job_by_id(identifier.job_id).await? else {
            return Ok(());
        };
        if job.is_rescheduled() || job.is_cancelled() {
            return Ok(());
        }
        if job.agent != Some(agent) {
            let expected = job
                .agent
                .map(|a| a.to_string())
                .unwrap_or_else(|| "none".to_string());
            error!(
                job = %identifier,
                expected = %expected,
                reported = %agent,
                "job is assigned to a different agent"
            );
            return Err(Error::InvalidAgent {
                expected,
                reported: agent.to_string(),
            });
        }
        job.completing(result, Utc::now());
        self.jobs.update_state_and_result(&job).await
    }

    /// Records the assignment on the job. Returns true when the job has
    /// already completed and must not be assigned.
    pub async fn update_assigned_info(&self, agent: AgentId, plan: &JobPlan) -> Result<bool> {
        let stage_lock = self.mutexes.for_stage_instance(&plan.identifier.stage);
        let _stage_scope = stage_lock.lock().await;

        let Some(mut job) = self.jobs.job_by_id(plan.job_id).await? else {
            return Ok(true);
        };
        if job.is_completed() || job.is_rescheduled() {
            info!(job = %job.identifier, agent = %agent, "[Agent Assignment] not assigning a completed job");
            return Ok(true);
        }
        job.assign(agent, Utc::now());
        self.jobs.update_assigned_info(&job).await?;
        self.publish(SchedulingEvent::JobAssigned {
            identifier: job.identifier.clone(),
            agent,
        })
        .await;
        Ok(false)
    }

    pub async fn cancel_job(&self, identifier: &JobIdentifier) -> Result<()> {
        let stage_lock = self.mutexes.for_stage_instance(&identifier.stage);
        let _stage_scope = stage_lock.lock().await;

        let Some(mut job) = self.jobs.job_by_id(identifier.job_id).await? else {
            return Ok(());
        };
        if !job.is_active() {
            return Ok(());
        }
        job.cancel(Utc::now());
        self.jobs.update_state_and_result(&job).await?;
        self.jobs.discard_plan(job.id).await
    }

    pub async fn fail_job(&self, identifier: &JobIdentifier) -> Result<()> {
        let stage_lock = self.mutexes.for_stage_instance(&identifier.stage);
        let _stage_scope = stage_lock.lock().await;

        let Some(mut job) = self.jobs.job_by_id(identifier.job_id).await? else {
            return Ok(());
        };
        if !job.is_active() {
            return Ok(());
        }
        job.complete(JobResult::Failed, Utc::now());
        self.jobs.update_state_and_result(&job).await
    }

    /// Pause/unpause share the pipeline-name scope with promotion: both
    /// write the same persisted pipeline row.
    pub async fn pause_pipeline(
        &self,
        name: &PipelineName,
        user: &str,
        reason: &str,
    ) -> Result<()> {
        let lock = self.mutexes.for_pipeline(name);
        let _pipeline_scope = lock.lock().await;
        self.pauses.pause(name, user, reason).await
    }

    pub async fn unpause_pipeline(&self, name: &PipelineName) -> Result<()> {
        let lock = self.mutexes.for_pipeline(name);
        let _pipeline_scope = lock.lock().await;
        self.pauses.unpause(name).await
    }

    async fn publish(&self, event: SchedulingEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "event publication failed");
        }
    }
}
