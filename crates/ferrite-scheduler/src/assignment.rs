//! Matching queued job plans onto idle agents.
//!
//! One matching pass hands out at most one job per connected, idle, enabled
//! agent. Elastic jobs are only assigned once the elastic-agent subsystem
//! confirms eligibility; an agent with a stale in-flight build has it
//! rescheduled before it can receive new work.

use crate::config::SchedulerConfig;
use crate::orchestrator::ScheduleService;
use chrono::{DateTime, Utc};
use ferrite_core::agent::AgentInstance;
use ferrite_core::ids::JobId;
use ferrite_core::plan::{BuildAssignment, Builder, JobPlan, WorkDirPolicy};
use ferrite_core::ports::{AgentRegistry, ConfigProvider, ElasticAgentGateway, JobStore, PipelineStore};
use ferrite_core::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, error, info, warn};

pub struct AgentAssignmentService {
    configs: Arc<dyn ConfigProvider>,
    pipelines: Arc<dyn PipelineStore>,
    jobs: Arc<dyn JobStore>,
    agents: Arc<dyn AgentRegistry>,
    elastic: Arc<dyn ElasticAgentGateway>,
    scheduler: Arc<ScheduleService>,
    tuning: SchedulerConfig,
    elastic_requests: StdMutex<HashMap<JobId, DateTime<Utc>>>,
}

impl AgentAssignmentService {
    pub fn new(
        configs: Arc<dyn ConfigProvider>,
        pipelines: Arc<dyn PipelineStore>,
        jobs: Arc<dyn JobStore>,
        agents: Arc<dyn AgentRegistry>,
        elastic: Arc<dyn ElasticAgentGateway>,
        scheduler: Arc<ScheduleService>,
        tuning: SchedulerConfig,
    ) -> Self {
        Self {
            configs,
            pipelines,
            jobs,
            agents,
            elastic,
            scheduler,
            tuning,
            elastic_requests: StdMutex::new(HashMap::new()),
        }
    }

    /// One matching pass over every idle agent. Returns the assignments
    /// produced; plans that found no agent stay queued.
    pub async fn assign_work_to_idle_agents(&self) -> Result<Vec<BuildAssignment>> {
        let all_agents = self.agents.registered_agents().await?;
        let mut plans = self.jobs.scheduled_plans().await?;
        plans.sort_by_key(|p| p.ordering_key());

        let mut assignments = Vec::new();
        for agent in all_agents.iter().filter(|a| a.is_idle()) {
            // an agent that still owns an in-flight build gets that build
            // rescheduled instead of new work
            match self.jobs.latest_active_job_on_agent(agent.id).await? {
                Some(stale) => {
                    warn!(agent = %agent.id, job = %stale.identifier, "agent reports idle with a build in flight");
                    if let Err(e) = self.scheduler.reschedule_job(&stale).await {
                        error!(job = %stale.identifier, error = %e, "failed to reschedule abandoned build");
                    }
                    continue;
                }
                None => {}
            }

            let Some(index) = self.best_plan_for(agent, &plans).await? else {
                continue;
            };
            let plan = plans.remove(index);
            match self.create_assignment(agent, plan).await {
                Ok(Some(assignment)) => assignments.push(assignment),
                Ok(None) => {}
                Err(e) => error!(agent = %agent.id, error = %e, "assignment attempt aborted"),
            }
        }

        self.request_elastic_agents(&plans).await;
        Ok(assignments)
    }

    /// The best-ranked plan this agent may take, or None.
    async fn best_plan_for(
        &self,
        agent: &AgentInstance,
        plans: &[JobPlan],
    ) -> Result<Option<usize>> {
        for (index, plan) in plans.iter().enumerate() {
            if !environment_matches(agent, plan) || !agent.has_resources(&plan.resources) {
                continue;
            }
            match (&plan.elastic_profile_id, &agent.elastic) {
                (Some(profile), Some(metadata)) => {
                    let eligible = self
                        .elastic
                        .should_assign_work(metadata, profile, plan.environment.as_deref())
                        .await?;
                    if !eligible {
                        // match abandoned for this pass, the plan stays
                        // queued and the agent may take other work
                        debug!(agent = %agent.id, job = %plan.identifier, "elastic agent not eligible");
                        continue;
                    }
                }
                (Some(_), None) => continue,
                // static jobs never land on elastic agents
                (None, Some(_)) => continue,
                (None, None) => {}
            }
            return Ok(Some(index));
        }
        Ok(None)
    }

    /// Materializes the unit of work for one agent. Returns None when the
    /// job completed while queued (the plan is discarded either way).
    async fn create_assignment(
        &self,
        agent: &AgentInstance,
        plan: JobPlan,
    ) -> Result<Option<BuildAssignment>> {
        let already_done = self.scheduler.update_assigned_info(agent.id, &plan).await?;
        self.jobs.discard_plan(plan.job_id).await?;
        if already_done {
            return Ok(None);
        }

        let stage = &plan.identifier.stage;
        let config = self.configs.pipeline_config(&stage.pipeline_name).await?;
        let stage_config =
            config
                .stage_named(&stage.stage_name)
                .ok_or_else(|| Error::StageNotFound {
                    pipeline: stage.pipeline_name.clone(),
                    stage: stage.stage_name.clone(),
                })?;
        let job_config = stage_config
            .job_named(&plan.identifier.job_name)
            .ok_or_else(|| Error::JobNotFound {
                stage: stage.clone(),
                job: plan.identifier.job_name.clone(),
            })?;
        let pipeline = self
            .pipelines
            .pipeline_by_counter(&stage.pipeline_name, stage.pipeline_counter)
            .await?
            .ok_or_else(|| Error::PipelineInstanceNotFound {
                name: stage.pipeline_name.clone(),
                counter: stage.pipeline_counter,
            })?;

        let builders: Vec<Builder> = job_config.tasks.iter().map(Builder::from_task).collect();
        let mut environment_variables = config.variables.clone();
        environment_variables.extend(stage_config.variables.clone());
        environment_variables.extend(job_config.variables.clone());
        environment_variables.extend(pipeline.build_cause.variables().clone());

        info!(job = %plan.identifier, agent = %agent.id, "[Agent Assignment] assigning job");
        Ok(Some(BuildAssignment {
            plan,
            agent: agent.id,
            build_cause: pipeline.build_cause.clone(),
            builders,
            environment_variables,
            work_dir_policy: WorkDirPolicy::Keep,
        }))
    }

    /// Re-requests elastic agents for plans still starving, throttled by
    /// the configured starvation threshold.
    async fn request_elastic_agents(&self, remaining: &[JobPlan]) {
        let now = Utc::now();
        for plan in remaining.iter().filter(|p| p.requires_elastic_agent()) {
            let due = {
                let requests = self
                    .elastic_requests
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                match requests.get(&plan.job_id) {
                    Some(last) => now - *last >= self.tuning.elastic_agent_starvation(),
                    None => true,
                }
            };
            if !due {
                continue;
            }
            let Some(profile) = plan.elastic_profile_id.as_deref() else {
                continue;
            };
            if let Err(e) = self
                .elastic
                .create_agent(profile, plan.environment.as_deref())
                .await
            {
                error!(job = %plan.identifier, error = %e, "elastic agent creation request failed");
                continue;
            }
            self.elastic_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(plan.job_id, now);
        }
    }

    /// Drops plans whose pipeline, stage or job left the configuration.
    /// Invoked from the configuration-changed notification rather than
    /// discovered at match time.
    pub async fn purge_stale_plans(&self) -> Result<()> {
        for plan in self.jobs.scheduled_plans().await? {
            let stage = &plan.identifier.stage;
            let valid = match self.configs.pipeline_config(&stage.pipeline_name).await {
                Ok(config) => config
                    .stage_named(&stage.stage_name)
                    .and_then(|s| s.job_named(&plan.identifier.job_name))
                    .is_some(),
                Err(Error::PipelineNotFound(_)) => false,
                Err(e) => return Err(e),
            };
            if !valid {
                info!(job = %plan.identifier, "purging job plan no longer present in configuration");
                self.jobs.discard_plan(plan.job_id).await?;
            }
        }
        Ok(())
    }
}

fn environment_matches(agent: &AgentInstance, plan: &JobPlan) -> bool {
    match &plan.environment {
        Some(env) => agent.is_in_environment(env),
        None => agent.environments.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::SchedulingChecker;
    use crate::locks::MutexRegistry;
    use crate::producer::TriggerMonitor;
    use crate::queue::PipelineScheduleQueue;
    use crate::testing::{
        cause_with_revision, elastic_agent, git_material, idle_agent, pipeline_config,
        AllowAllSecurity, InMemoryAgentRegistry, InMemoryConfig, InMemoryJobStore, InMemoryLocks,
        InMemoryPauses, InMemoryPipelineStore, InMemoryStageStore, RecordingEvents,
        RecordingHealth, StubDisk, StubElastic,
    };
    use chrono::Utc;
    use ferrite_core::instance::JobState;

    struct Fixture {
        configs: Arc<InMemoryConfig>,
        jobs: Arc<InMemoryJobStore>,
        agents: Arc<InMemoryAgentRegistry>,
        elastic: Arc<StubElastic>,
        scheduler: Arc<ScheduleService>,
        service: AgentAssignmentService,
    }

    fn fixture() -> Fixture {
        let configs = Arc::new(InMemoryConfig::new());
        let stages = Arc::new(InMemoryStageStore::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let pipelines = Arc::new(InMemoryPipelineStore::new());
        pipelines.mirror_into(stages.clone(), jobs.clone());
        let agents = Arc::new(InMemoryAgentRegistry::new());
        let elastic = Arc::new(StubElastic::new());
        let pauses = Arc::new(InMemoryPauses::new());
        let locks = Arc::new(InMemoryLocks::new());
        let security = Arc::new(AllowAllSecurity::new());
        let queue = Arc::new(PipelineScheduleQueue::new(pipelines.clone()));
        let checker = Arc::new(SchedulingChecker::new(
            Arc::new(StubDisk::new()),
            pauses.clone(),
            locks.clone(),
            stages.clone(),
            security.clone(),
            Arc::new(TriggerMonitor::new()),
        ));
        let scheduler = Arc::new(ScheduleService::new(
            configs.clone(),
            pipelines.clone(),
            stages.clone(),
            jobs.clone(),
            agents.clone(),
            locks,
            pauses,
            security,
            Arc::new(RecordingHealth::new()),
            Arc::new(RecordingEvents::new()),
            queue,
            checker,
            Arc::new(MutexRegistry::new()),
            SchedulerConfig::default(),
        ));
        let service = AgentAssignmentService::new(
            configs.clone(),
            pipelines.clone(),
            jobs.clone(),
            agents.clone(),
            elastic.clone(),
            scheduler.clone(),
            SchedulerConfig::default(),
        );
        Fixture {
            configs,
            jobs,
            agents,
            elastic,
            scheduler,
            service,
        }
    }

    async fn schedule(fx: &Fixture, config: ferrite_core::config::PipelineConfig) {
        let name = config.name.clone();
        fx.configs.add(config);
        let cause = cause_with_revision("m1", "r1", Utc::now());
        fx.scheduler
            .schedule_pipeline(&name, &cause)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_agent_receives_best_ranked_plan() {
        let fx = fixture();
        schedule(
            &fx,
            pipeline_config("app", vec![git_material("m1")], vec!["build"]),
        )
        .await;
        fx.agents.add(idle_agent("worker-1"));

        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert_eq!(assignments.len(), 1);
        let assignment = &assignments[0];
        assert_eq!(assignment.builders.len(), 1);
        assert_eq!(assignment.builders[0].command, "make");
        assert_eq!(fx.jobs.plan_count(), 0);

        let job = fx.jobs.job(assignment.plan.job_id).unwrap();
        assert_eq!(job.state, JobState::Assigned);
        assert_eq!(job.agent, Some(assignment.agent));
    }

    #[tokio::test]
    async fn test_at_most_one_job_per_agent_per_pass() {
        let fx = fixture();
        schedule(
            &fx,
            pipeline_config("app", vec![git_material("m1")], vec!["build"]),
        )
        .await;
        schedule(
            &fx,
            pipeline_config("lib", vec![git_material("m1")], vec!["build"]),
        )
        .await;
        fx.agents.add(idle_agent("worker-1"));

        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(fx.jobs.plan_count(), 1);
    }

    #[tokio::test]
    async fn test_resource_requirements_filter_agents() {
        let fx = fixture();
        let mut config = pipeline_config("app", vec![git_material("m1")], vec!["build"]);
        config.stages[0].jobs[0].resources = vec!["docker".to_string()];
        schedule(&fx, config).await;

        fx.agents.add(idle_agent("plain"));
        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert!(assignments.is_empty());
        assert_eq!(fx.jobs.plan_count(), 1);

        let mut capable = idle_agent("docker-box");
        capable.resources = vec!["docker".to_string()];
        fx.agents.add(capable);
        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert_eq!(assignments.len(), 1);
    }

    #[tokio::test]
    async fn test_environment_membership_filters_agents() {
        let fx = fixture();
        let mut config = pipeline_config("app", vec![git_material("m1")], vec!["build"]);
        config.environment = Some("prod".to_string());
        fx.configs.add(config);
        // schedule directly: the scheduling context only admits prod agents
        let mut prod_agent = idle_agent("prod-1");
        prod_agent.environments = vec!["prod".to_string()];
        fx.agents.add(prod_agent);
        fx.agents.add(idle_agent("unassigned"));
        let cause = cause_with_revision("m1", "r1", Utc::now());
        fx.scheduler
            .schedule_pipeline(&"app".into(), &cause)
            .await
            .unwrap()
            .unwrap();

        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert_eq!(assignments.len(), 1);
        let agent = fx
            .agents
            .agent(assignments[0].agent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent.hostname, "prod-1");
    }

    #[tokio::test]
    async fn test_elastic_plan_waits_for_gateway_confirmation() {
        let fx = fixture();
        fx.configs.add_elastic_profile("ec2");
        let mut config = pipeline_config("app", vec![git_material("m1")], vec!["build"]);
        config.stages[0].jobs[0].elastic_profile_id = Some("ec2".to_string());
        schedule(&fx, config).await;
        fx.agents.add(elastic_agent("ea-1", "ec2-plugin"));

        fx.elastic.set_eligible(false);
        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert!(assignments.is_empty());
        assert_eq!(fx.jobs.plan_count(), 1);

        fx.elastic.set_eligible(true);
        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert_eq!(assignments.len(), 1);
        assert_eq!(fx.jobs.plan_count(), 0);
    }

    #[tokio::test]
    async fn test_static_job_never_lands_on_elastic_agent() {
        let fx = fixture();
        schedule(
            &fx,
            pipeline_config("app", vec![git_material("m1")], vec!["build"]),
        )
        .await;
        fx.agents.add(elastic_agent("ea-1", "ec2-plugin"));

        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert!(assignments.is_empty());
        assert_eq!(fx.jobs.plan_count(), 1);
    }

    #[tokio::test]
    async fn test_agent_with_abandoned_build_is_reconciled_first() {
        let fx = fixture();
        schedule(
            &fx,
            pipeline_config("app", vec![git_material("m1")], vec!["build"]),
        )
        .await;
        let agent = idle_agent("worker-1");
        fx.agents.add(agent.clone());

        // the agent already owns the only job, yet reports idle
        let plan = fx.jobs.plans().remove(0);
        fx.scheduler
            .update_assigned_info(agent.id, &plan)
            .await
            .unwrap();

        let assignments = fx.service.assign_work_to_idle_agents().await.unwrap();
        assert!(assignments.is_empty());
        let old = fx.jobs.job(plan.job_id).unwrap();
        assert!(old.is_rescheduled());
        // the replacement job's plan is queued for the next pass
        assert_eq!(fx.jobs.plan_count(), 1);
        assert_ne!(fx.jobs.plans()[0].job_id, plan.job_id);
    }

    #[tokio::test]
    async fn test_starved_elastic_plan_requests_creation_throttled() {
        let fx = fixture();
        fx.configs.add_elastic_profile("ec2");
        let mut config = pipeline_config("app", vec![git_material("m1")], vec!["build"]);
        config.stages[0].jobs[0].elastic_profile_id = Some("ec2".to_string());
        schedule(&fx, config).await;

        fx.service.assign_work_to_idle_agents().await.unwrap();
        assert_eq!(fx.elastic.created(), vec!["ec2".to_string()]);

        // inside the starvation threshold: no second request
        fx.service.assign_work_to_idle_agents().await.unwrap();
        assert_eq!(fx.elastic.created().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_plans_for_deleted_configuration() {
        let fx = fixture();
        schedule(
            &fx,
            pipeline_config("app", vec![git_material("m1")], vec!["build"]),
        )
        .await;
        assert_eq!(fx.jobs.plan_count(), 1);

        fx.configs.remove(&"app".into());
        fx.service.purge_stale_plans().await.unwrap();
        assert_eq!(fx.jobs.plan_count(), 0);
    }
}
