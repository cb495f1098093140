//! In-memory port implementations and builders shared by the crate's tests.

use crate::checks::{DiskSpace, DiskSpaceMonitor};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ferrite_core::agent::{AgentInstance, AgentStatus, ElasticAgentMetadata};
use ferrite_core::buildcause::BuildCause;
use ferrite_core::config::{Approval, JobConfig, PipelineConfig, StageConfig, TaskConfig};
use ferrite_core::events::SchedulingEvent;
use ferrite_core::ids::{
    AgentId, Fingerprint, JobId, PipelineIdentifier, PipelineInstanceId, PipelineName,
    StageIdentifier, StageInstanceId,
};
use ferrite_core::instance::{
    create_pipeline_instance, JobInstance, Pipeline, SchedulingContext, Stage,
};
use ferrite_core::material::{
    Material, MaterialKind, MaterialRevision, MaterialRevisions, Modification,
};
use ferrite_core::plan::JobPlan;
use ferrite_core::ports::{
    AgentRegistry, ConfigProvider, ElasticAgentGateway, EventSink, HealthReporter, JobStore,
    MaterialSource, PauseStore, PipelineLocks, PipelineStore, SecurityService, StageStore,
};
use ferrite_core::result::{HealthScope, HealthState};
use ferrite_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

// ---- builders -------------------------------------------------------------

pub fn git_material(fingerprint: &str) -> Material {
    Material {
        fingerprint: Fingerprint::new(fingerprint),
        kind: MaterialKind::Git {
            url: format!("https://example.com/{}.git", fingerprint),
            branch: "main".to_string(),
        },
        display_name: fingerprint.to_string(),
        auto_update: true,
    }
}

pub fn dep_material(pipeline: &str, stage: &str) -> Material {
    Material {
        fingerprint: Fingerprint::new(format!("dep-{}-{}", pipeline, stage)),
        kind: MaterialKind::DependencyPipeline {
            pipeline: PipelineName::new(pipeline),
            stage: stage.to_string(),
        },
        display_name: format!("{} [{}]", pipeline, stage),
        auto_update: true,
    }
}

pub fn pipeline_config(name: &str, materials: Vec<Material>, stages: Vec<&str>) -> PipelineConfig {
    PipelineConfig {
        name: PipelineName::new(name),
        materials,
        stages: stages
            .iter()
            .map(|stage| StageConfig {
                name: stage.to_string(),
                approval: Approval::default(),
                jobs: vec![JobConfig {
                    name: format!("{}-job", stage),
                    resources: vec![],
                    elastic_profile_id: None,
                    variables: HashMap::new(),
                    tasks: vec![TaskConfig {
                        command: "make".to_string(),
                        args: vec![stage.to_string()],
                        working_dir: None,
                    }],
                }],
                variables: HashMap::new(),
            })
            .collect(),
        variables: HashMap::new(),
        lock_behavior: Default::default(),
        environment: None,
    }
}

pub fn git_revision(fingerprint: &str, revision: &str, at: DateTime<Utc>) -> MaterialRevision {
    MaterialRevision::new(
        git_material(fingerprint),
        vec![Modification::new(revision, at)],
    )
}

pub fn dep_revision(
    pipeline: &str,
    stage: &str,
    counter: u32,
    at: DateTime<Utc>,
) -> MaterialRevision {
    MaterialRevision::new(
        dep_material(pipeline, stage),
        vec![Modification::new(
            format!("{}/{}/{}/1", pipeline, counter, stage),
            at,
        )],
    )
}

pub fn cause_with_revision(fingerprint: &str, revision: &str, at: DateTime<Utc>) -> BuildCause {
    BuildCause::from_modifications(MaterialRevisions::new(vec![
        git_revision(fingerprint, revision, at).into_changed(),
    ]))
}

pub fn idle_agent(hostname: &str) -> AgentInstance {
    AgentInstance {
        id: AgentId::new(),
        hostname: hostname.to_string(),
        resources: vec![],
        environments: vec![],
        status: AgentStatus::Idle,
        elastic: None,
        registered_at: Utc::now(),
        last_heartbeat_at: Some(Utc::now()),
    }
}

pub fn elastic_agent(hostname: &str, plugin: &str) -> AgentInstance {
    let mut agent = idle_agent(hostname);
    agent.elastic = Some(ElasticAgentMetadata {
        elastic_agent_id: format!("ea-{}", hostname),
        plugin_id: plugin.to_string(),
    });
    agent
}

pub trait IntoChanged {
    fn into_changed(self) -> Self;
}

impl IntoChanged for MaterialRevision {
    fn into_changed(mut self) -> Self {
        self.changed = true;
        self
    }
}

pub trait IntoForced {
    fn into_forced(self, user: &str) -> BuildCause;
}

impl IntoForced for BuildCause {
    fn into_forced(self, user: &str) -> BuildCause {
        BuildCause::manual(self.material_revisions().clone(), user)
    }
}

// ---- configuration --------------------------------------------------------

#[derive(Default)]
pub struct InMemoryConfig {
    pipelines: StdMutex<HashMap<PipelineName, PipelineConfig>>,
    profiles: StdMutex<Vec<String>>,
}

impl InMemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, config: PipelineConfig) {
        self.pipelines
            .lock()
            .unwrap()
            .insert(config.name.clone(), config);
    }

    pub fn remove(&self, name: &PipelineName) {
        self.pipelines.lock().unwrap().remove(name);
    }

    pub fn add_elastic_profile(&self, id: &str) {
        self.profiles.lock().unwrap().push(id.to_string());
    }
}

#[async_trait]
impl ConfigProvider for InMemoryConfig {
    async fn pipeline_config(&self, name: &PipelineName) -> Result<PipelineConfig> {
        self.pipelines
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PipelineNotFound(name.clone()))
    }

    async fn has_pipeline(&self, name: &PipelineName) -> Result<bool> {
        Ok(self.pipelines.lock().unwrap().contains_key(name))
    }

    async fn stage_config(&self, name: &PipelineName, stage: &str) -> Result<StageConfig> {
        let config = self.pipeline_config(name).await?;
        config
            .stage_named(stage)
            .cloned()
            .ok_or_else(|| Error::StageNotFound {
                pipeline: name.clone(),
                stage: stage.to_string(),
            })
    }

    async fn scheduleable_pipelines(&self) -> Result<Vec<PipelineConfig>> {
        Ok(self.pipelines.lock().unwrap().values().cloned().collect())
    }

    async fn elastic_profile_ids(&self) -> Result<Vec<String>> {
        Ok(self.profiles.lock().unwrap().clone())
    }
}

// ---- pipeline store -------------------------------------------------------

#[derive(Default)]
pub struct InMemoryPipelineStore {
    instances: StdMutex<HashMap<PipelineName, Vec<Pipeline>>>,
    passed: StdMutex<HashMap<PipelineName, Vec<u32>>>,
    material_used: StdMutex<HashMap<(PipelineName, u32, Fingerprint), MaterialRevision>>,
    dependency_mods: StdMutex<HashMap<(PipelineName, u32), Modification>>,
    fail_out_of_date: AtomicBool,
    stage_mirror: StdMutex<Option<Arc<InMemoryStageStore>>>,
    job_mirror: StdMutex<Option<Arc<InMemoryJobStore>>>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persisting an instance also lands its stage and job rows in the
    /// given stores, the way a shared database would.
    pub fn mirror_into(&self, stages: Arc<InMemoryStageStore>, jobs: Arc<InMemoryJobStore>) {
        *self.stage_mirror.lock().unwrap() = Some(stages);
        *self.job_mirror.lock().unwrap() = Some(jobs);
    }

    pub fn add_passed(&self, name: &str, counter: u32) {
        self.passed
            .lock()
            .unwrap()
            .entry(PipelineName::new(name))
            .or_default()
            .push(counter);
    }

    pub fn record_material_used(&self, name: &str, counter: u32, revision: MaterialRevision) {
        self.material_used.lock().unwrap().insert(
            (
                PipelineName::new(name),
                counter,
                revision.fingerprint().clone(),
            ),
            revision,
        );
    }

    pub fn record_dependency_modification(
        &self,
        name: &str,
        counter: u32,
        modification: Modification,
    ) {
        self.dependency_mods
            .lock()
            .unwrap()
            .insert((PipelineName::new(name), counter), modification);
    }

    pub fn fail_next_create_out_of_date(&self) {
        self.fail_out_of_date.store(true, Ordering::SeqCst);
    }

    pub fn instance_count(&self, name: &PipelineName) -> usize {
        self.instances
            .lock()
            .unwrap()
            .get(name)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Seeds a bare historical instance carrying the given build cause.
    pub fn seed_instance(&self, name: &str, cause: BuildCause) {
        let name = PipelineName::new(name);
        let mut instances = self.instances.lock().unwrap();
        let list = instances.entry(name.clone()).or_default();
        let counter = list.len() as u32 + 1;
        list.push(Pipeline {
            id: PipelineInstanceId::new(),
            identifier: PipelineIdentifier::new(name, counter),
            build_cause: cause,
            stages: vec![],
        });
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn create_pipeline(
        &self,
        config: &PipelineConfig,
        cause: &BuildCause,
        context: &SchedulingContext,
    ) -> Result<Pipeline> {
        if self.fail_out_of_date.swap(false, Ordering::SeqCst) {
            return Err(Error::OutOfDate("concurrent configuration change".to_string()));
        }
        let counter = self.instance_count(&config.name) as u32 + 1;
        let pipeline =
            create_pipeline_instance(config, cause.clone(), context, counter, Utc::now())?;
        self.instances
            .lock()
            .unwrap()
            .entry(config.name.clone())
            .or_default()
            .push(pipeline.clone());

        let stage_mirror = self.stage_mirror.lock().unwrap().clone();
        if let Some(stages) = stage_mirror {
            for stage in &pipeline.stages {
                stages.insert(stage.clone());
            }
        }
        let job_mirror = self.job_mirror.lock().unwrap().clone();
        if let Some(jobs) = job_mirror {
            for stage in &pipeline.stages {
                for job in &stage.jobs {
                    jobs.insert_job(job.clone());
                }
            }
        }
        Ok(pipeline)
    }

    async fn latest_instance(&self, name: &PipelineName) -> Result<Option<Pipeline>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(name)
            .and_then(|v| v.last().cloned()))
    }

    async fn pipeline_by_counter(
        &self,
        name: &PipelineName,
        counter: u32,
    ) -> Result<Option<Pipeline>> {
        Ok(self.instances.lock().unwrap().get(name).and_then(|v| {
            v.iter()
                .find(|p| p.identifier.counter == counter)
                .cloned()
        }))
    }

    async fn load_pipeline(&self, id: PipelineInstanceId) -> Result<Option<Pipeline>> {
        Ok(self
            .instances
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|p| p.id == id)
            .cloned())
    }

    async fn latest_passed_counter(&self, name: &PipelineName) -> Result<Option<u32>> {
        Ok(self
            .passed
            .lock()
            .unwrap()
            .get(name)
            .and_then(|v| v.iter().max().copied()))
    }

    async fn passed_counters_descending(
        &self,
        name: &PipelineName,
        below: Option<u32>,
        limit: usize,
    ) -> Result<Vec<u32>> {
        let mut counters: Vec<u32> = self
            .passed
            .lock()
            .unwrap()
            .get(name)
            .map(|v| {
                v.iter()
                    .filter(|&&c| below.map(|b| c < b).unwrap_or(true))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        counters.sort_unstable_by(|a, b| b.cmp(a));
        counters.truncate(limit);
        Ok(counters)
    }

    async fn material_revision_used(
        &self,
        name: &PipelineName,
        counter: u32,
        fingerprint: &Fingerprint,
    ) -> Result<Option<MaterialRevision>> {
        Ok(self
            .material_used
            .lock()
            .unwrap()
            .get(&(name.clone(), counter, fingerprint.clone()))
            .cloned())
    }

    async fn dependency_modification(
        &self,
        name: &PipelineName,
        counter: u32,
    ) -> Result<Option<Modification>> {
        Ok(self
            .dependency_mods
            .lock()
            .unwrap()
            .get(&(name.clone(), counter))
            .cloned())
    }
}

// ---- stage store ----------------------------------------------------------

#[derive(Default)]
pub struct InMemoryStageStore {
    stages: StdMutex<Vec<Stage>>,
}

impl InMemoryStageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, stage: Stage) {
        self.stages.lock().unwrap().push(stage);
    }

    pub fn all(&self) -> Vec<Stage> {
        self.stages.lock().unwrap().clone()
    }

    pub fn stages_named(&self, pipeline: &str, stage: &str) -> Vec<Stage> {
        let name = PipelineName::new(pipeline);
        self.stages
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.identifier.pipeline_name == name
                    && s.identifier.stage_name.eq_ignore_ascii_case(stage)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StageStore for InMemoryStageStore {
    async fn save_stage(&self, _pipeline: &Pipeline, stage: &Stage) -> Result<()> {
        self.insert(stage.clone());
        Ok(())
    }

    async fn update_stage(&self, stage: &Stage) -> Result<()> {
        let mut stages = self.stages.lock().unwrap();
        match stages.iter_mut().find(|s| s.id == stage.id) {
            Some(slot) => *slot = stage.clone(),
            None => stages.push(stage.clone()),
        }
        Ok(())
    }

    async fn stage_by_id(&self, id: StageInstanceId) -> Result<Option<Stage>> {
        Ok(self
            .stages
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned())
    }

    async fn stage_by_identifier(&self, identifier: &StageIdentifier) -> Result<Option<Stage>> {
        Ok(self
            .stages
            .lock()
            .unwrap()
            .iter()
            .find(|s| &s.identifier == identifier)
            .cloned())
    }

    async fn stages_of_pipeline_run(&self, pipeline: &PipelineIdentifier) -> Result<Vec<Stage>> {
        Ok(self
            .stages
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                s.identifier.pipeline_name == pipeline.name
                    && s.identifier.pipeline_counter == pipeline.counter
            })
            .cloned()
            .collect())
    }

    async fn is_stage_active(&self, name: &PipelineName, stage: &str) -> Result<bool> {
        Ok(self.stages.lock().unwrap().iter().any(|s| {
            &s.identifier.pipeline_name == name
                && s.identifier.stage_name.eq_ignore_ascii_case(stage)
                && s.is_active()
        }))
    }

    async fn most_recent_passed(
        &self,
        name: &PipelineName,
        stage: &str,
    ) -> Result<Option<Stage>> {
        Ok(self
            .stages
            .lock()
            .unwrap()
            .iter()
            .filter(|s| {
                &s.identifier.pipeline_name == name
                    && s.identifier.stage_name.eq_ignore_ascii_case(stage)
                    && s.is_completed_and_passed()
            })
            .max_by_key(|s| s.identifier.pipeline_counter)
            .cloned())
    }
}

// ---- job store ------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: StdMutex<HashMap<JobId, JobInstance>>,
    plans: StdMutex<Vec<JobPlan>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&self, job: JobInstance) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn job(&self, id: JobId) -> Option<JobInstance> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn all_jobs(&self) -> Vec<JobInstance> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn plan_count(&self) -> usize {
        self.plans.lock().unwrap().len()
    }

    pub fn plans(&self) -> Vec<JobPlan> {
        self.plans.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn job_by_id(&self, id: JobId) -> Result<Option<JobInstance>> {
        Ok(self.job(id))
    }

    async fn save_job(&self, job: &JobInstance) -> Result<()> {
        self.insert_job(job.clone());
        Ok(())
    }

    async fn update_state_and_result(&self, job: &JobInstance) -> Result<()> {
        self.insert_job(job.clone());
        Ok(())
    }

    async fn update_assigned_info(&self, job: &JobInstance) -> Result<()> {
        self.insert_job(job.clone());
        Ok(())
    }

    async fn load_plan(&self, id: JobId) -> Result<Option<JobPlan>> {
        Ok(self
            .plans
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.job_id == id)
            .cloned())
    }

    async fn save_plan(&self, plan: &JobPlan) -> Result<()> {
        let mut plans = self.plans.lock().unwrap();
        plans.retain(|p| p.job_id != plan.job_id);
        plans.push(plan.clone());
        Ok(())
    }

    async fn discard_plan(&self, id: JobId) -> Result<()> {
        self.plans.lock().unwrap().retain(|p| p.job_id != id);
        Ok(())
    }

    async fn scheduled_plans(&self) -> Result<Vec<JobPlan>> {
        Ok(self.plans())
    }

    async fn find_hung_jobs(
        &self,
        live_agents: &[AgentId],
        inactive_for: Duration,
    ) -> Result<Vec<JobInstance>> {
        let now = Utc::now();
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| {
                j.is_active()
                    && j.agent.map(|a| live_agents.contains(&a)).unwrap_or(false)
                    && now - j.last_activity_at > inactive_for
            })
            .cloned()
            .collect())
    }

    async fn latest_active_job_on_agent(&self, agent: AgentId) -> Result<Option<JobInstance>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.agent == Some(agent) && j.is_active())
            .max_by_key(|j| j.transitioned_at)
            .cloned())
    }
}

// ---- agents ---------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: StdMutex<Vec<AgentInstance>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, agent: AgentInstance) {
        self.agents.lock().unwrap().push(agent);
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn registered_agents(&self) -> Result<Vec<AgentInstance>> {
        Ok(self.agents.lock().unwrap().clone())
    }

    async fn agent(&self, id: AgentId) -> Result<Option<AgentInstance>> {
        Ok(self
            .agents
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }
}

// ---- elastic agents -------------------------------------------------------

pub struct StubElastic {
    eligible: StdMutex<bool>,
    created: StdMutex<Vec<String>>,
}

impl StubElastic {
    pub fn new() -> Self {
        Self {
            eligible: StdMutex::new(true),
            created: StdMutex::new(Vec::new()),
        }
    }

    pub fn set_eligible(&self, eligible: bool) {
        *self.eligible.lock().unwrap() = eligible;
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl Default for StubElastic {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ElasticAgentGateway for StubElastic {
    async fn should_assign_work(
        &self,
        _agent: &ElasticAgentMetadata,
        _profile_id: &str,
        _environment: Option<&str>,
    ) -> Result<bool> {
        Ok(*self.eligible.lock().unwrap())
    }

    async fn create_agent(&self, profile_id: &str, _environment: Option<&str>) -> Result<()> {
        self.created.lock().unwrap().push(profile_id.to_string());
        Ok(())
    }
}

// ---- materials ------------------------------------------------------------

#[derive(Default)]
pub struct StubMaterialSource {
    revisions: StdMutex<MaterialRevisions>,
}

impl StubMaterialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_revisions(&self, revisions: MaterialRevisions) {
        *self.revisions.lock().unwrap() = revisions;
    }
}

#[async_trait]
impl MaterialSource for StubMaterialSource {
    async fn latest_revisions(&self, _materials: &[Material]) -> Result<MaterialRevisions> {
        Ok(self.revisions.lock().unwrap().clone())
    }
}

// ---- locks and pause ------------------------------------------------------

#[derive(Default)]
pub struct InMemoryLocks {
    locked: StdMutex<HashMap<PipelineName, PipelineIdentifier>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, name: &str, holder: PipelineIdentifier) {
        self.locked
            .lock()
            .unwrap()
            .insert(PipelineName::new(name), holder);
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.locked
            .lock()
            .unwrap()
            .contains_key(&PipelineName::new(name))
    }
}

#[async_trait]
impl PipelineLocks for InMemoryLocks {
    async fn lock_if_needed(&self, pipeline: &Pipeline, config: &PipelineConfig) -> Result<()> {
        if config.is_lockable() {
            self.locked
                .lock()
                .unwrap()
                .entry(pipeline.name().clone())
                .or_insert_with(|| pipeline.identifier.clone());
        }
        Ok(())
    }

    async fn unlock(&self, name: &PipelineName) -> Result<()> {
        self.locked.lock().unwrap().remove(name);
        Ok(())
    }

    async fn locked_by(&self, name: &PipelineName) -> Result<Option<PipelineIdentifier>> {
        Ok(self.locked.lock().unwrap().get(name).cloned())
    }
}

#[derive(Default)]
pub struct InMemoryPauses {
    paused: StdMutex<HashSet<PipelineName>>,
}

impl InMemoryPauses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_paused(&self, name: &str, paused: bool) {
        let name = PipelineName::new(name);
        let mut set = self.paused.lock().unwrap();
        if paused {
            set.insert(name);
        } else {
            set.remove(&name);
        }
    }
}

#[async_trait]
impl PauseStore for InMemoryPauses {
    async fn pause(&self, name: &PipelineName, _user: &str, _reason: &str) -> Result<()> {
        self.paused.lock().unwrap().insert(name.clone());
        Ok(())
    }

    async fn unpause(&self, name: &PipelineName) -> Result<()> {
        self.paused.lock().unwrap().remove(name);
        Ok(())
    }

    async fn is_paused(&self, name: &PipelineName) -> Result<bool> {
        Ok(self.paused.lock().unwrap().contains(name))
    }
}

// ---- security, health, events, disk ---------------------------------------

#[derive(Default)]
pub struct AllowAllSecurity {
    denied: StdMutex<HashSet<String>>,
}

impl AllowAllSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, user: &str) {
        self.denied.lock().unwrap().insert(user.to_string());
    }
}

#[async_trait]
impl SecurityService for AllowAllSecurity {
    async fn has_operate_permission(
        &self,
        user: &str,
        _pipeline: &PipelineName,
        _stage: &str,
    ) -> Result<bool> {
        Ok(!self.denied.lock().unwrap().contains(user))
    }
}

#[derive(Default)]
pub struct RecordingHealth {
    states: StdMutex<Vec<HealthState>>,
    removed: StdMutex<Vec<HealthScope>>,
}

impl RecordingHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<HealthState> {
        self.states.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<HealthScope> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthReporter for RecordingHealth {
    async fn update(&self, state: HealthState) {
        self.states.lock().unwrap().push(state);
    }

    async fn remove_by_scope(&self, scope: &HealthScope) {
        self.removed.lock().unwrap().push(scope.clone());
    }
}

#[derive(Default)]
pub struct RecordingEvents {
    events: StdMutex<Vec<SchedulingEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<SchedulingEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, event: SchedulingEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub struct StubDisk {
    artifact: StdMutex<DiskSpace>,
    database: StdMutex<DiskSpace>,
}

impl StubDisk {
    pub fn new() -> Self {
        Self {
            artifact: StdMutex::new(DiskSpace::Sufficient),
            database: StdMutex::new(DiskSpace::Sufficient),
        }
    }

    pub fn set_artifact(&self, space: DiskSpace) {
        *self.artifact.lock().unwrap() = space;
    }

    pub fn set_database(&self, space: DiskSpace) {
        *self.database.lock().unwrap() = space;
    }
}

impl Default for StubDisk {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiskSpaceMonitor for StubDisk {
    async fn artifact_disk_space(&self) -> DiskSpace {
        *self.artifact.lock().unwrap()
    }

    async fn database_disk_space(&self) -> DiskSpace {
        *self.database.lock().unwrap()
    }
}
