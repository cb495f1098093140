//! Precondition checks gating scheduling actions.
//!
//! Each check is an independent predicate that either leaves the operation
//! result untouched or marks it failed with a reason, a classification and a
//! scope. A chain runs its checks in order and stops at the first failure.
//! Call sites compose different subsets.

use crate::producer::TriggerMonitor;
use async_trait::async_trait;
use ferrite_core::Result;
use ferrite_core::config::PipelineConfig;
use ferrite_core::ids::{PipelineIdentifier, PipelineName};
use ferrite_core::ports::{PauseStore, PipelineLocks, SecurityService, StageStore};
use ferrite_core::result::{HealthScope, OperationResult};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskSpace {
    Sufficient,
    Full,
}

/// Disk space on the volumes scheduling depends on.
#[async_trait]
pub trait DiskSpaceMonitor: Send + Sync {
    async fn artifact_disk_space(&self) -> DiskSpace;

    async fn database_disk_space(&self) -> DiskSpace;
}

#[async_trait]
pub trait SchedulingCheck: Send + Sync {
    async fn check(&self, result: &mut OperationResult) -> Result<()>;
}

/// Runs checks in order, stopping at the first failure.
pub struct CheckChain {
    checks: Vec<Box<dyn SchedulingCheck>>,
}

impl CheckChain {
    pub fn new(checks: Vec<Box<dyn SchedulingCheck>>) -> Self {
        Self { checks }
    }

    pub async fn run(&self, result: &mut OperationResult) -> Result<()> {
        for check in &self.checks {
            if !result.can_continue() {
                break;
            }
            check.check(result).await?;
        }
        Ok(())
    }
}

struct ArtifactDiskSpaceCheck {
    disk: Arc<dyn DiskSpaceMonitor>,
}

#[async_trait]
impl SchedulingCheck for ArtifactDiskSpaceCheck {
    async fn check(&self, result: &mut OperationResult) -> Result<()> {
        if self.disk.artifact_disk_space().await == DiskSpace::Full {
            result.not_acceptable(
                "Cannot schedule: the artifacts disk is full",
                "No more pipelines will be scheduled until artifact disk space is freed",
                HealthScope::Global,
            );
        }
        Ok(())
    }
}

struct DatabaseDiskSpaceCheck {
    disk: Arc<dyn DiskSpaceMonitor>,
}

#[async_trait]
impl SchedulingCheck for DatabaseDiskSpaceCheck {
    async fn check(&self, result: &mut OperationResult) -> Result<()> {
        if self.disk.database_disk_space().await == DiskSpace::Full {
            result.not_acceptable(
                "Cannot schedule: the database disk is full",
                "No more pipelines will be scheduled until database disk space is freed",
                HealthScope::Global,
            );
        }
        Ok(())
    }
}

struct PipelinePausedCheck {
    pauses: Arc<dyn PauseStore>,
    pipeline: PipelineName,
}

#[async_trait]
impl SchedulingCheck for PipelinePausedCheck {
    async fn check(&self, result: &mut OperationResult) -> Result<()> {
        if self.pauses.is_paused(&self.pipeline).await? {
            result.conflict(
                format!("Failed to trigger pipeline: {}", self.pipeline),
                format!("Pipeline {} is paused", self.pipeline),
                HealthScope::for_pipeline(self.pipeline.clone()),
            );
        }
        Ok(())
    }
}

struct PipelineLockedCheck {
    locks: Arc<dyn PipelineLocks>,
    pipeline: PipelineName,
    /// The instance allowed to hold the lock, for operations inside a
    /// locked run (stage reruns within the locked instance itself).
    allowed_holder: Option<PipelineIdentifier>,
}

#[async_trait]
impl SchedulingCheck for PipelineLockedCheck {
    async fn check(&self, result: &mut OperationResult) -> Result<()> {
        if let Some(holder) = self.locks.locked_by(&self.pipeline).await? {
            if self.allowed_holder.as_ref() != Some(&holder) {
                result.conflict(
                    format!("Failed to trigger pipeline: {}", self.pipeline),
                    format!("Pipeline {} is locked by instance {}", self.pipeline, holder),
                    HealthScope::for_pipeline(self.pipeline.clone()),
                );
            }
        }
        Ok(())
    }
}

struct StageActiveCheck {
    stages: Arc<dyn StageStore>,
    pipeline: PipelineName,
    stage: String,
}

#[async_trait]
impl SchedulingCheck for StageActiveCheck {
    async fn check(&self, result: &mut OperationResult) -> Result<()> {
        if self.stages.is_stage_active(&self.pipeline, &self.stage).await? {
            result.conflict(
                format!(
                    "Failed to trigger pipeline [{}]",
                    self.pipeline
                ),
                format!(
                    "Stage [{}] in pipeline [{}] is still in progress",
                    self.stage, self.pipeline
                ),
                HealthScope::for_stage(self.pipeline.clone(), self.stage.clone()),
            );
        }
        Ok(())
    }
}

struct PipelineActiveCheck {
    stages: Arc<dyn StageStore>,
    config: PipelineConfig,
}

#[async_trait]
impl SchedulingCheck for PipelineActiveCheck {
    async fn check(&self, result: &mut OperationResult) -> Result<()> {
        for stage in &self.config.stages {
            if self
                .stages
                .is_stage_active(&self.config.name, &stage.name)
                .await?
            {
                result.conflict(
                    format!("Failed to trigger pipeline [{}]", self.config.name),
                    format!(
                        "Pipeline [{}] is still in progress",
                        self.config.name
                    ),
                    HealthScope::for_pipeline(self.config.name.clone()),
                );
                return Ok(());
            }
        }
        Ok(())
    }
}

struct StageAuthorizationCheck {
    security: Arc<dyn SecurityService>,
    user: String,
    pipeline: PipelineName,
    stage: String,
}

#[async_trait]
impl SchedulingCheck for StageAuthorizationCheck {
    async fn check(&self, result: &mut OperationResult) -> Result<()> {
        let allowed = self
            .security
            .has_operate_permission(&self.user, &self.pipeline, &self.stage)
            .await?;
        if !allowed {
            result.unauthorized(
                format!(
                    "User {} does not have permission to schedule {}/{}",
                    self.user, self.pipeline, self.stage
                ),
                String::new(),
                HealthScope::for_stage(self.pipeline.clone(), self.stage.clone()),
            );
        }
        Ok(())
    }
}

struct AlreadyTriggeredCheck {
    monitor: Arc<TriggerMonitor>,
    pipeline: PipelineName,
}

#[async_trait]
impl SchedulingCheck for AlreadyTriggeredCheck {
    async fn check(&self, result: &mut OperationResult) -> Result<()> {
        if self.monitor.is_already_triggered(&self.pipeline) {
            result.conflict(
                format!("Failed to trigger pipeline: {}", self.pipeline),
                "Pipeline is already triggered and is awaiting completion".to_string(),
                HealthScope::for_pipeline(self.pipeline.clone()),
            );
        }
        Ok(())
    }
}

/// Facade composing the per-call-site chains.
pub struct SchedulingChecker {
    disk: Arc<dyn DiskSpaceMonitor>,
    pauses: Arc<dyn PauseStore>,
    locks: Arc<dyn PipelineLocks>,
    stages: Arc<dyn StageStore>,
    security: Arc<dyn SecurityService>,
    trigger_monitor: Arc<TriggerMonitor>,
}

impl SchedulingChecker {
    pub fn new(
        disk: Arc<dyn DiskSpaceMonitor>,
        pauses: Arc<dyn PauseStore>,
        locks: Arc<dyn PipelineLocks>,
        stages: Arc<dyn StageStore>,
        security: Arc<dyn SecurityService>,
        trigger_monitor: Arc<TriggerMonitor>,
    ) -> Self {
        Self {
            disk,
            pauses,
            locks,
            stages,
            security,
            trigger_monitor,
        }
    }

    fn disk_checks(&self) -> Vec<Box<dyn SchedulingCheck>> {
        vec![
            Box::new(ArtifactDiskSpaceCheck {
                disk: self.disk.clone(),
            }),
            Box::new(DatabaseDiskSpaceCheck {
                disk: self.disk.clone(),
            }),
        ]
    }

    /// The global gate applied every tick before any pipeline is considered.
    pub async fn can_schedule(&self, result: &mut OperationResult) -> Result<()> {
        CheckChain::new(self.disk_checks()).run(result).await
    }

    /// Automatic (timer) triggering of a pipeline.
    pub async fn can_auto_trigger(
        &self,
        config: &PipelineConfig,
        result: &mut OperationResult,
    ) -> Result<()> {
        let first_stage = config.first_stage().map(|s| s.name.clone()).unwrap_or_default();
        let mut checks: Vec<Box<dyn SchedulingCheck>> = vec![
            Box::new(AlreadyTriggeredCheck {
                monitor: self.trigger_monitor.clone(),
                pipeline: config.name.clone(),
            }),
            Box::new(PipelinePausedCheck {
                pauses: self.pauses.clone(),
                pipeline: config.name.clone(),
            }),
            Box::new(StageActiveCheck {
                stages: self.stages.clone(),
                pipeline: config.name.clone(),
                stage: first_stage,
            }),
            Box::new(PipelineLockedCheck {
                locks: self.locks.clone(),
                pipeline: config.name.clone(),
                allowed_holder: None,
            }),
        ];
        checks.extend(self.disk_checks());
        CheckChain::new(checks).run(result).await
    }

    /// Manual triggering adds the authorization check.
    pub async fn can_manual_trigger(
        &self,
        config: &PipelineConfig,
        user: &str,
        result: &mut OperationResult,
    ) -> Result<()> {
        let first_stage = config.first_stage().map(|s| s.name.clone()).unwrap_or_default();
        let mut checks: Vec<Box<dyn SchedulingCheck>> = vec![Box::new(StageAuthorizationCheck {
            security: self.security.clone(),
            user: user.to_string(),
            pipeline: config.name.clone(),
            stage: first_stage.clone(),
        })];
        checks.push(Box::new(AlreadyTriggeredCheck {
            monitor: self.trigger_monitor.clone(),
            pipeline: config.name.clone(),
        }));
        checks.push(Box::new(PipelinePausedCheck {
            pauses: self.pauses.clone(),
            pipeline: config.name.clone(),
        }));
        checks.push(Box::new(StageActiveCheck {
            stages: self.stages.clone(),
            pipeline: config.name.clone(),
            stage: first_stage,
        }));
        checks.push(Box::new(PipelineLockedCheck {
            locks: self.locks.clone(),
            pipeline: config.name.clone(),
            allowed_holder: None,
        }));
        checks.extend(self.disk_checks());
        CheckChain::new(checks).run(result).await
    }

    /// Gate for promoting a staged cause into an instance.
    pub async fn can_auto_trigger_consumer(
        &self,
        config: &PipelineConfig,
        result: &mut OperationResult,
    ) -> Result<()> {
        let mut checks: Vec<Box<dyn SchedulingCheck>> = vec![
            Box::new(PipelinePausedCheck {
                pauses: self.pauses.clone(),
                pipeline: config.name.clone(),
            }),
            Box::new(PipelineLockedCheck {
                locks: self.locks.clone(),
                pipeline: config.name.clone(),
                allowed_holder: None,
            }),
        ];
        checks.extend(self.disk_checks());
        CheckChain::new(checks).run(result).await
    }

    /// Rerunning a stage of an existing pipeline instance.
    pub async fn can_rerun_stage(
        &self,
        config: &PipelineConfig,
        pipeline: &PipelineIdentifier,
        stage: &str,
        user: &str,
        result: &mut OperationResult,
    ) -> Result<()> {
        let mut checks: Vec<Box<dyn SchedulingCheck>> = vec![
            Box::new(StageAuthorizationCheck {
                security: self.security.clone(),
                user: user.to_string(),
                pipeline: pipeline.name.clone(),
                stage: stage.to_string(),
            }),
            Box::new(PipelinePausedCheck {
                pauses: self.pauses.clone(),
                pipeline: pipeline.name.clone(),
            }),
            Box::new(PipelineActiveCheck {
                stages: self.stages.clone(),
                config: config.clone(),
            }),
            Box::new(StageActiveCheck {
                stages: self.stages.clone(),
                pipeline: pipeline.name.clone(),
                stage: stage.to_string(),
            }),
            Box::new(PipelineLockedCheck {
                locks: self.locks.clone(),
                pipeline: pipeline.name.clone(),
                allowed_holder: Some(pipeline.clone()),
            }),
        ];
        checks.extend(self.disk_checks());
        CheckChain::new(checks).run(result).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        git_material, pipeline_config, AllowAllSecurity, InMemoryLocks, InMemoryPauses,
        InMemoryStageStore, StubDisk,
    };
    use ferrite_core::result::Classification;

    fn checker() -> (
        SchedulingChecker,
        Arc<StubDisk>,
        Arc<InMemoryPauses>,
        Arc<InMemoryStageStore>,
        Arc<TriggerMonitor>,
        Arc<AllowAllSecurity>,
        Arc<InMemoryLocks>,
    ) {
        let disk = Arc::new(StubDisk::new());
        let pauses = Arc::new(InMemoryPauses::new());
        let locks = Arc::new(InMemoryLocks::new());
        let stages = Arc::new(InMemoryStageStore::new());
        let security = Arc::new(AllowAllSecurity::new());
        let monitor = Arc::new(TriggerMonitor::new());
        let checker = SchedulingChecker::new(
            disk.clone(),
            pauses.clone(),
            locks.clone(),
            stages.clone(),
            security.clone(),
            monitor.clone(),
        );
        (checker, disk, pauses, stages, monitor, security, locks)
    }

    fn config() -> PipelineConfig {
        pipeline_config("app", vec![git_material("m1")], vec!["build", "deploy"])
    }

    #[tokio::test]
    async fn test_global_gate_fails_on_full_artifact_disk() {
        let (checker, disk, ..) = checker();
        disk.set_artifact(DiskSpace::Full);

        let mut result = OperationResult::new();
        checker.can_schedule(&mut result).await.unwrap();
        let failure = result.failure().unwrap();
        assert_eq!(failure.classification, Classification::NotAcceptable);
        assert_eq!(failure.scope, HealthScope::Global);
    }

    #[tokio::test]
    async fn test_paused_pipeline_cannot_auto_trigger() {
        let (checker, _, pauses, ..) = checker();
        pauses.set_paused("app", true);

        let mut result = OperationResult::new();
        checker.can_auto_trigger(&config(), &mut result).await.unwrap();
        assert_eq!(
            result.failure().unwrap().classification,
            Classification::Conflict
        );
    }

    #[tokio::test]
    async fn test_already_triggered_short_circuits_before_disk() {
        let (checker, disk, _, _, monitor, ..) = checker();
        monitor.mark_already_triggered(&PipelineName::new("app"));
        disk.set_artifact(DiskSpace::Full);

        let mut result = OperationResult::new();
        checker.can_auto_trigger(&config(), &mut result).await.unwrap();
        // the already-triggered conflict wins; the disk check never ran
        let failure = result.failure().unwrap();
        assert_eq!(failure.classification, Classification::Conflict);
        assert!(failure.description.contains("already triggered"));
    }

    #[tokio::test]
    async fn test_manual_trigger_checks_authorization_first() {
        let (checker, _, _, _, _, security, _) = checker();
        security.deny("mallory");

        let mut result = OperationResult::new();
        checker
            .can_manual_trigger(&config(), "mallory", &mut result)
            .await
            .unwrap();
        assert_eq!(
            result.failure().unwrap().classification,
            Classification::Unauthorized
        );
    }

    #[tokio::test]
    async fn test_rerun_allows_lock_held_by_same_instance() {
        let (checker, _, _, _, _, _, locks) = checker();
        let holder = PipelineIdentifier::new("app", 4);
        locks.lock("app", holder.clone());

        let mut result = OperationResult::new();
        checker
            .can_rerun_stage(&config(), &holder, "deploy", "alice", &mut result)
            .await
            .unwrap();
        assert!(result.can_continue());

        let mut result = OperationResult::new();
        let other = PipelineIdentifier::new("app", 5);
        checker
            .can_rerun_stage(&config(), &other, "deploy", "alice", &mut result)
            .await
            .unwrap();
        assert!(!result.can_continue());
    }

    #[tokio::test]
    async fn test_all_clear_passes() {
        let (checker, ..) = checker();
        let mut result = OperationResult::new();
        checker.can_auto_trigger(&config(), &mut result).await.unwrap();
        assert!(result.can_continue());
    }
}
