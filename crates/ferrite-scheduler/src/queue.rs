//! Per-pipeline staging of build causes.
//!
//! Each pipeline name has two slots: the cause staged to run next, and the
//! cause of the last run actually created (lazily backfilled from history).
//! Staging follows trump rules; promotion turns a staged cause into a
//! persisted instance exactly once.

use ferrite_core::Result;
use ferrite_core::buildcause::BuildCause;
use ferrite_core::config::PipelineConfig;
use ferrite_core::ids::PipelineName;
use ferrite_core::instance::{Pipeline, SchedulingContext};
use ferrite_core::ports::PipelineStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, warn};

pub struct PipelineScheduleQueue {
    pipelines: Arc<dyn PipelineStore>,
    to_be_scheduled: StdMutex<HashMap<PipelineName, BuildCause>>,
    most_recent_scheduled: StdMutex<HashMap<PipelineName, BuildCause>>,
}

impl PipelineScheduleQueue {
    pub fn new(pipelines: Arc<dyn PipelineStore>) -> Self {
        Self {
            pipelines,
            to_be_scheduled: StdMutex::new(HashMap::new()),
            most_recent_scheduled: StdMutex::new(HashMap::new()),
        }
    }

    /// Stages `cause` as the pipeline's next build cause. A no-op unless the
    /// slot is empty or the new cause trumps the staged one.
    pub fn schedule(&self, name: &PipelineName, cause: BuildCause) {
        let mut staged = self
            .to_be_scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match staged.get(name) {
            Some(current) if !cause.trumps(current) => {
                debug!(pipeline = %name, "staged cause kept, incoming does not trump");
            }
            _ => {
                staged.insert(name.clone(), cause);
            }
        }
    }

    /// Clears the staged cause without touching the last-scheduled record.
    pub fn cancel_staged(&self, name: &PipelineName) {
        self.to_be_scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
    }

    pub fn staged_for(&self, name: &PipelineName) -> Option<BuildCause> {
        self.to_be_scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Snapshot of everything currently staged.
    pub fn to_be_scheduled(&self) -> HashMap<PipelineName, BuildCause> {
        self.to_be_scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The cause of the last run actually created, lazily populated from
    /// the most recent persisted instance. A sentinel never-run cause when
    /// no history exists.
    pub async fn most_recently_scheduled(&self, name: &PipelineName) -> Result<BuildCause> {
        {
            let cache = self
                .most_recent_scheduled
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(cause) = cache.get(name) {
                return Ok(cause.clone());
            }
        }
        let cause = match self.pipelines.latest_instance(name).await? {
            Some(pipeline) => pipeline.build_cause,
            None => BuildCause::never_run(),
        };
        let mut cache = self
            .most_recent_scheduled
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Ok(cache.entry(name.clone()).or_insert(cause).clone())
    }

    /// Turns a staged cause into a persisted pipeline instance.
    ///
    /// An un-forced cause content-equal to the most recently scheduled one
    /// is a suppressed duplicate. A store reporting out-of-date data clears
    /// the staged entry and leaves the retry to the next cycle. On success
    /// the staged entry is cleared and the last-scheduled record updated
    /// with the persisted cause.
    pub async fn promote(
        &self,
        name: &PipelineName,
        cause: &BuildCause,
        config: &PipelineConfig,
        context: &SchedulingContext,
    ) -> Result<Option<Pipeline>> {
        let recent = self.most_recently_scheduled(name).await?;
        if !cause.is_forced() && cause.is_same_as(&recent) {
            debug!(pipeline = %name, "duplicate trigger suppressed");
            self.cancel_staged(name);
            return Ok(None);
        }

        match self.pipelines.create_pipeline(config, cause, context).await {
            Ok(pipeline) => {
                {
                    let mut cache = self
                        .most_recent_scheduled
                        .lock()
                        .unwrap_or_else(|e| e.into_inner());
                    cache.insert(name.clone(), pipeline.build_cause.clone());
                }
                self.cancel_staged(name);
                Ok(Some(pipeline))
            }
            Err(e) if e.is_out_of_date() => {
                warn!(pipeline = %name, error = %e, "promotion raced a concurrent change, will retry");
                self.cancel_staged(name);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        cause_with_revision, git_material, pipeline_config, InMemoryPipelineStore, IntoForced,
    };
    use chrono::{Duration, Utc};

    fn queue_with_store() -> (PipelineScheduleQueue, Arc<InMemoryPipelineStore>) {
        let store = Arc::new(InMemoryPipelineStore::new());
        (PipelineScheduleQueue::new(store.clone()), store)
    }

    fn config() -> PipelineConfig {
        pipeline_config("q", vec![git_material("m1")], vec!["build"])
    }

    #[test]
    fn test_forced_cause_retained_regardless_of_arrival_order() {
        let (queue, _) = queue_with_store();
        let name = PipelineName::new("q");
        let now = Utc::now();

        let forced = cause_with_revision("m1", "c1", now).into_forced("alice");
        let unforced = cause_with_revision("m1", "c2", now + Duration::minutes(1));

        queue.schedule(&name, forced.clone());
        queue.schedule(&name, unforced.clone());
        assert!(queue.staged_for(&name).unwrap().is_forced());

        let (queue, _) = queue_with_store();
        queue.schedule(&name, unforced);
        queue.schedule(&name, forced);
        assert!(queue.staged_for(&name).unwrap().is_forced());
    }

    #[test]
    fn test_newer_content_replaces_older() {
        let (queue, _) = queue_with_store();
        let name = PipelineName::new("q");
        let now = Utc::now();

        queue.schedule(&name, cause_with_revision("m1", "r1", now - Duration::minutes(5)));
        queue.schedule(&name, cause_with_revision("m1", "r2", now));

        let staged = queue.staged_for(&name).unwrap();
        assert_eq!(
            staged
                .material_revisions()
                .iter()
                .next()
                .unwrap()
                .latest_revision(),
            Some("r2")
        );
    }

    #[test]
    fn test_cancel_staged_clears_slot() {
        let (queue, _) = queue_with_store();
        let name = PipelineName::new("q");
        queue.schedule(&name, cause_with_revision("m1", "r1", Utc::now()));
        queue.cancel_staged(&name);
        assert!(queue.staged_for(&name).is_none());
    }

    #[tokio::test]
    async fn test_most_recently_scheduled_backfills_sentinel() {
        let (queue, _) = queue_with_store();
        let recent = queue
            .most_recently_scheduled(&PipelineName::new("q"))
            .await
            .unwrap();
        assert!(recent.has_never_run());
    }

    #[tokio::test]
    async fn test_promote_creates_instance_and_updates_recent() {
        let (queue, store) = queue_with_store();
        let name = PipelineName::new("q");
        let cause = cause_with_revision("m1", "r1", Utc::now());
        queue.schedule(&name, cause.clone());

        let pipeline = queue
            .promote(&name, &cause, &config(), &SchedulingContext::new("changes", vec![]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pipeline.counter(), 1);
        assert!(queue.staged_for(&name).is_none());
        assert_eq!(store.instance_count(&name), 1);

        let recent = queue.most_recently_scheduled(&name).await.unwrap();
        assert!(recent.is_same_as(&cause));
    }

    #[tokio::test]
    async fn test_promote_suppresses_unforced_duplicate() {
        let (queue, store) = queue_with_store();
        let name = PipelineName::new("q");
        let cause = cause_with_revision("m1", "r1", Utc::now());

        queue.schedule(&name, cause.clone());
        queue
            .promote(&name, &cause, &config(), &SchedulingContext::new("changes", vec![]))
            .await
            .unwrap();

        queue.schedule(&name, cause.clone());
        let second = queue
            .promote(&name, &cause, &config(), &SchedulingContext::new("changes", vec![]))
            .await
            .unwrap();

        assert!(second.is_none());
        assert!(queue.staged_for(&name).is_none());
        assert_eq!(store.instance_count(&name), 1);
    }

    #[tokio::test]
    async fn test_promote_forced_duplicate_still_runs() {
        let (queue, store) = queue_with_store();
        let name = PipelineName::new("q");
        let cause = cause_with_revision("m1", "r1", Utc::now());
        queue
            .promote(&name, &cause, &config(), &SchedulingContext::new("changes", vec![]))
            .await
            .unwrap();

        let forced = cause.into_forced("alice");
        let second = queue
            .promote(&name, &forced, &config(), &SchedulingContext::new("alice", vec![]))
            .await
            .unwrap();
        assert!(second.is_some());
        assert_eq!(store.instance_count(&name), 2);
    }

    #[tokio::test]
    async fn test_promote_out_of_date_clears_staged_without_touching_recent() {
        let (queue, store) = queue_with_store();
        let name = PipelineName::new("q");
        let cause = cause_with_revision("m1", "r1", Utc::now());
        queue.schedule(&name, cause.clone());
        store.fail_next_create_out_of_date();

        let outcome = queue
            .promote(&name, &cause, &config(), &SchedulingContext::new("changes", vec![]))
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert!(queue.staged_for(&name).is_none());
        assert_eq!(store.instance_count(&name), 0);
        let recent = queue.most_recently_scheduled(&name).await.unwrap();
        assert!(recent.has_never_run());
    }
}
