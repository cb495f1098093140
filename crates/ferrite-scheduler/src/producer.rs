//! Build-cause production.
//!
//! Entry points that turn material-change notifications, timer ticks and
//! manual trigger requests into staged build causes. Everything here is
//! driven through the checker chain first, then the revision resolver, and
//! finally the schedule queue.

use crate::checks::SchedulingChecker;
use crate::queue::PipelineScheduleQueue;
use crate::resolver::RevisionResolver;
use ferrite_core::buildcause::BuildCause;
use ferrite_core::config::PipelineConfig;
use ferrite_core::ids::PipelineName;
use ferrite_core::material::{MaterialRevision, MaterialRevisions};
use ferrite_core::ports::{ConfigProvider, HealthReporter, MaterialSource};
use ferrite_core::result::{HealthScope, HealthState, OperationResult};
use ferrite_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, error, warn};

/// Pipelines that are "about to be triggered": marked when a manual trigger
/// is accepted, cleared once its build cause lands in the queue. Consulted
/// by the already-triggered precondition check.
#[derive(Default)]
pub struct TriggerMonitor {
    in_flight: StdMutex<HashSet<PipelineName>>,
}

impl TriggerMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when the pipeline was already marked.
    pub fn mark_already_triggered(&self, name: &PipelineName) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone())
    }

    pub fn mark_can_be_triggered(&self, name: &PipelineName) {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn is_already_triggered(&self, name: &PipelineName) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}

/// Per-pipeline IDLE/BUSY flag for the revision-check timer: a pipeline with
/// a check outstanding is not asked again until the result arrives.
#[derive(Default)]
pub struct MaterialCheckTracker {
    outstanding: StdMutex<HashSet<PipelineName>>,
}

impl MaterialCheckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a check is already outstanding.
    pub fn begin_check(&self, name: &PipelineName) -> bool {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone())
    }

    /// Cleared asynchronously when the check's result message arrives.
    pub fn finish_check(&self, name: &PipelineName) {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn is_checking(&self, name: &PipelineName) -> bool {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }
}

/// Trigger-time options for manual scheduling.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub variables: HashMap<String, String>,
}

enum BuildKind {
    Auto,
    Timer,
    Manual { user: String },
}

pub struct BuildCauseProducer {
    configs: Arc<dyn ConfigProvider>,
    materials: Arc<dyn MaterialSource>,
    resolver: Arc<RevisionResolver>,
    queue: Arc<PipelineScheduleQueue>,
    checker: Arc<SchedulingChecker>,
    health: Arc<dyn HealthReporter>,
    trigger_monitor: Arc<TriggerMonitor>,
}

impl BuildCauseProducer {
    pub fn new(
        configs: Arc<dyn ConfigProvider>,
        materials: Arc<dyn MaterialSource>,
        resolver: Arc<RevisionResolver>,
        queue: Arc<PipelineScheduleQueue>,
        checker: Arc<SchedulingChecker>,
        health: Arc<dyn HealthReporter>,
        trigger_monitor: Arc<TriggerMonitor>,
    ) -> Self {
        Self {
            configs,
            materials,
            resolver,
            queue,
            checker,
            health,
            trigger_monitor,
        }
    }

    /// Driven by a material-change notification.
    pub async fn auto_schedule_pipeline(&self, name: &PipelineName, result: &mut OperationResult) {
        let config = match self.configs.pipeline_config(name).await {
            Ok(config) => config,
            Err(e) => {
                error!(pipeline = %name, error = %e, "cannot auto-schedule");
                return;
            }
        };
        self.produce(&config, BuildKind::Auto, ScheduleOptions::default(), result)
            .await;
    }

    /// Driven by a pipeline timer tick.
    pub async fn timer_schedule_pipeline(
        &self,
        config: &PipelineConfig,
        result: &mut OperationResult,
    ) {
        self.produce(config, BuildKind::Timer, ScheduleOptions::default(), result)
            .await;
    }

    /// Driven by an operator request. Forced.
    pub async fn manual_schedule_pipeline(
        &self,
        user: &str,
        name: &PipelineName,
        options: ScheduleOptions,
        result: &mut OperationResult,
    ) {
        let config = match self.configs.pipeline_config(name).await {
            Ok(config) => config,
            Err(_) => {
                result.not_found(
                    format!("Pipeline '{}' not found", name),
                    String::new(),
                    HealthScope::Global,
                );
                return;
            }
        };
        if let Err(e) = self.checker.can_manual_trigger(&config, user, result).await {
            error!(pipeline = %name, error = %e, "precondition evaluation failed");
            result.internal_error(
                format!("Error while scheduling pipeline: {}", name),
                e.to_string(),
                HealthScope::for_pipeline(name.clone()),
            );
            return;
        }
        if !result.can_continue() {
            return;
        }
        if !self.trigger_monitor.mark_already_triggered(name) {
            result.conflict(
                format!("Failed to force pipeline: {}", name),
                "Pipeline already forced".to_string(),
                HealthScope::for_pipeline(name.clone()),
            );
            return;
        }
        // the flag covers the material-update wait; it is released before
        // the cause is produced, exactly when the update result arrives
        self.trigger_monitor.mark_can_be_triggered(name);
        self.produce(
            &config,
            BuildKind::Manual {
                user: user.to_string(),
            },
            options,
            result,
        )
        .await;
    }

    async fn produce(
        &self,
        config: &PipelineConfig,
        kind: BuildKind,
        options: ScheduleOptions,
        result: &mut OperationResult,
    ) {
        let name = config.name.clone();
        if let Err(e) = self.gate(config, &kind, result).await {
            error!(pipeline = %name, error = %e, "precondition evaluation failed");
            result.internal_error(
                format!("Error while scheduling pipeline: {}", name),
                e.to_string(),
                HealthScope::for_pipeline(name.clone()),
            );
            return;
        }
        if !result.can_continue() {
            return;
        }

        debug!(pipeline = %name, "start producing build cause");
        match self.produce_inner(config, &kind, options).await {
            Ok(Some(cause)) => {
                self.queue.schedule(&name, cause);
                self.health
                    .remove_by_scope(&HealthScope::for_pipeline(name.clone()))
                    .await;
                result.accepted(format!("Request to schedule pipeline {} accepted", name));
                debug!(pipeline = %name, "finished producing build cause");
            }
            Ok(None) => {
                debug!(pipeline = %name, "no reason to schedule");
                self.health
                    .remove_by_scope(&HealthScope::for_pipeline(name.clone()))
                    .await;
            }
            Err(Error::NoCompatibleUpstreamRevisions(_)) => {
                let message =
                    format!("Error while scheduling pipeline: {} as no compatible revisions were identified", name);
                debug!(pipeline = %name, "{}", message);
                self.health
                    .update(HealthState::error(
                        message.clone(),
                        String::new(),
                        HealthScope::for_pipeline(name.clone()),
                    ))
                    .await;
                result.not_acceptable(message, String::new(), HealthScope::for_pipeline(name));
            }
            Err(Error::NoModificationsPresentForDependency(material)) => {
                // upstream has never produced anything usable yet
                warn!(pipeline = %name, material = %material, "dependency has no modifications");
            }
            Err(e) => {
                let message = format!("Error while scheduling pipeline: {}", name);
                error!(pipeline = %name, error = %e, "{}", message);
                self.health
                    .update(HealthState::error(
                        message.clone(),
                        e.to_string(),
                        HealthScope::for_pipeline(name.clone()),
                    ))
                    .await;
                result.internal_error(message, e.to_string(), HealthScope::for_pipeline(name));
            }
        }
    }

    async fn gate(
        &self,
        config: &PipelineConfig,
        kind: &BuildKind,
        result: &mut OperationResult,
    ) -> Result<()> {
        match kind {
            BuildKind::Auto | BuildKind::Timer => {
                self.checker.can_auto_trigger(config, result).await
            }
            BuildKind::Manual { user } => {
                self.checker.can_manual_trigger(config, user, result).await
            }
        }
    }

    async fn produce_inner(
        &self,
        config: &PipelineConfig,
        kind: &BuildKind,
        options: ScheduleOptions,
    ) -> Result<Option<BuildCause>> {
        let name = &config.name;
        let previous = self.queue.most_recently_scheduled(name).await?;
        let latest = self.materials.latest_revisions(&config.materials).await?;
        if latest.is_missing_modifications() {
            let missing = latest
                .iter()
                .find(|r| r.modifications.is_empty())
                .map(|r| r.material.display_name.clone())
                .unwrap_or_default();
            return Err(Error::NoModificationsPresentForDependency(missing));
        }

        let marked = mark_changed_against(&latest, &previous);
        let resolved = self.resolver.resolve(name, &marked).await?;

        let revisions = match (kind, resolved) {
            (BuildKind::Auto, None) => return Ok(None),
            (_, Some(revisions)) => revisions,
            // manual and timer triggers schedule even when resolution found
            // nothing new
            (_, None) => marked,
        };

        match kind {
            BuildKind::Auto => {
                if !revisions.has_changes() && !previous.has_never_run() {
                    return Ok(None);
                }
                Ok(Some(BuildCause::from_modifications(revisions)))
            }
            BuildKind::Timer => Ok(Some(BuildCause::timer(revisions))),
            BuildKind::Manual { user } => Ok(Some(
                BuildCause::manual(revisions, user.clone()).with_variables(options.variables),
            )),
        }
    }
}

/// Flags each revision changed when it differs from what the previous build
/// cause used (or everything, for a pipeline that never ran).
fn mark_changed_against(
    latest: &MaterialRevisions,
    previous: &BuildCause,
) -> MaterialRevisions {
    latest
        .iter()
        .map(|revision| {
            let changed = if previous.has_never_run() {
                true
            } else {
                match previous
                    .material_revisions()
                    .find_by_fingerprint(revision.fingerprint())
                {
                    Some(used) => used.latest_revision() != revision.latest_revision(),
                    None => true,
                }
            };
            MaterialRevision {
                changed,
                ..revision.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionMode;
    use crate::testing::{
        cause_with_revision, git_material, git_revision, pipeline_config, AllowAllSecurity,
        InMemoryConfig, InMemoryLocks, InMemoryPauses, InMemoryPipelineStore, InMemoryStageStore,
        RecordingHealth, StubDisk, StubMaterialSource,
    };
    use chrono::Utc;
    use ferrite_core::result::Classification;

    struct Fixture {
        configs: Arc<InMemoryConfig>,
        store: Arc<InMemoryPipelineStore>,
        materials: Arc<StubMaterialSource>,
        queue: Arc<PipelineScheduleQueue>,
        monitor: Arc<TriggerMonitor>,
        producer: BuildCauseProducer,
    }

    fn fixture() -> Fixture {
        let configs = Arc::new(InMemoryConfig::new());
        let store = Arc::new(InMemoryPipelineStore::new());
        let materials = Arc::new(StubMaterialSource::new());
        let queue = Arc::new(PipelineScheduleQueue::new(store.clone()));
        let monitor = Arc::new(TriggerMonitor::new());
        let checker = Arc::new(SchedulingChecker::new(
            Arc::new(StubDisk::new()),
            Arc::new(InMemoryPauses::new()),
            Arc::new(InMemoryLocks::new()),
            Arc::new(InMemoryStageStore::new()),
            Arc::new(AllowAllSecurity::new()),
            monitor.clone(),
        ));
        let resolver = Arc::new(RevisionResolver::new(
            configs.clone(),
            store.clone(),
            ResolutionMode::FanIn,
        ));
        let producer = BuildCauseProducer::new(
            configs.clone(),
            materials.clone(),
            resolver,
            queue.clone(),
            checker,
            Arc::new(RecordingHealth::new()),
            monitor.clone(),
        );
        Fixture {
            configs,
            store,
            materials,
            queue,
            monitor,
            producer,
        }
    }

    #[tokio::test]
    async fn test_auto_schedule_stages_changed_revisions() {
        let fx = fixture();
        fx.configs
            .add(pipeline_config("app", vec![git_material("m1")], vec!["build"]));
        fx.materials
            .set_revisions(MaterialRevisions::new(vec![git_revision(
                "m1",
                "r1",
                Utc::now(),
            )]));

        let mut result = OperationResult::new();
        fx.producer
            .auto_schedule_pipeline(&"app".into(), &mut result)
            .await;

        assert!(result.can_continue());
        let staged = fx.queue.staged_for(&"app".into()).unwrap();
        assert!(!staged.is_forced());
        assert!(staged.material_revisions().has_changes());
    }

    #[tokio::test]
    async fn test_auto_schedule_skips_unchanged_pipeline() {
        let fx = fixture();
        let now = Utc::now();
        fx.configs
            .add(pipeline_config("app", vec![git_material("m1")], vec!["build"]));
        fx.materials
            .set_revisions(MaterialRevisions::new(vec![git_revision("m1", "r1", now)]));
        // history already ran with r1
        fx.store
            .seed_instance("app", cause_with_revision("m1", "r1", now));

        let mut result = OperationResult::new();
        fx.producer
            .auto_schedule_pipeline(&"app".into(), &mut result)
            .await;

        assert!(fx.queue.staged_for(&"app".into()).is_none());
    }

    #[tokio::test]
    async fn test_manual_trigger_is_forced_and_carries_variables() {
        let fx = fixture();
        fx.configs
            .add(pipeline_config("app", vec![git_material("m1")], vec!["build"]));
        fx.materials
            .set_revisions(MaterialRevisions::new(vec![git_revision(
                "m1",
                "r1",
                Utc::now(),
            )]));

        let mut options = ScheduleOptions::default();
        options
            .variables
            .insert("DEPLOY_ENV".to_string(), "staging".to_string());

        let mut result = OperationResult::new();
        fx.producer
            .manual_schedule_pipeline("alice", &"app".into(), options, &mut result)
            .await;

        assert!(result.can_continue());
        let staged = fx.queue.staged_for(&"app".into()).unwrap();
        assert!(staged.is_forced());
        assert_eq!(staged.approver(), "alice");
        assert_eq!(
            staged.variables().get("DEPLOY_ENV"),
            Some(&"staging".to_string())
        );
        // flag released once the cause is staged
        assert!(!fx.monitor.is_already_triggered(&"app".into()));
    }

    #[tokio::test]
    async fn test_concurrent_manual_trigger_conflicts() {
        let fx = fixture();
        fx.configs
            .add(pipeline_config("app", vec![git_material("m1")], vec!["build"]));
        fx.monitor.mark_already_triggered(&"app".into());

        let mut result = OperationResult::new();
        fx.producer
            .manual_schedule_pipeline("alice", &"app".into(), ScheduleOptions::default(), &mut result)
            .await;

        assert_eq!(
            result.failure().unwrap().classification,
            Classification::Conflict
        );
    }

    #[tokio::test]
    async fn test_material_check_tracker_suppresses_second_check() {
        let tracker = MaterialCheckTracker::new();
        let name = PipelineName::new("app");
        assert!(tracker.begin_check(&name));
        assert!(!tracker.begin_check(&name));
        tracker.finish_check(&name);
        assert!(tracker.begin_check(&name));
    }
}
