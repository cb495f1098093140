//! Scheduling events.
//!
//! Published by the orchestrator strictly after the corresponding
//! persistence call has succeeded, so listeners only ever observe committed
//! state.

use crate::ids::{AgentId, JobIdentifier, PipelineIdentifier, PipelineName, StageIdentifier};
use crate::instance::{JobResult, StageResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulingEvent {
    PipelineCreated {
        identifier: PipelineIdentifier,
        forced: bool,
        approver: String,
    },
    PipelineNotScheduled {
        name: PipelineName,
        reason: String,
    },
    StageScheduled {
        identifier: StageIdentifier,
        approved_by: String,
    },
    StageCancelled {
        identifier: StageIdentifier,
        cancelled_by: Option<String>,
    },
    StageCompleted {
        identifier: StageIdentifier,
        result: StageResult,
    },
    JobAssigned {
        identifier: JobIdentifier,
        agent: AgentId,
    },
    JobCompleted {
        identifier: JobIdentifier,
        result: JobResult,
    },
    JobRescheduled {
        old: JobIdentifier,
        new: JobIdentifier,
    },
}

impl SchedulingEvent {
    /// Routing subject for bus adapters.
    pub fn subject(&self) -> String {
        match self {
            SchedulingEvent::PipelineCreated { identifier, .. } => {
                format!("pipeline.created.{}", identifier.name)
            }
            SchedulingEvent::PipelineNotScheduled { name, .. } => {
                format!("pipeline.not_scheduled.{}", name)
            }
            SchedulingEvent::StageScheduled { identifier, .. } => {
                format!("stage.scheduled.{}", identifier.stage_locator())
            }
            SchedulingEvent::StageCancelled { identifier, .. } => {
                format!("stage.cancelled.{}", identifier.stage_locator())
            }
            SchedulingEvent::StageCompleted { identifier, .. } => {
                format!("stage.completed.{}", identifier.stage_locator())
            }
            SchedulingEvent::JobAssigned { identifier, .. } => {
                format!("job.assigned.{}", identifier.build_locator())
            }
            SchedulingEvent::JobCompleted { identifier, .. } => {
                format!("job.completed.{}", identifier.build_locator())
            }
            SchedulingEvent::JobRescheduled { old, .. } => {
                format!("job.rescheduled.{}", old.build_locator())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_contains_locator() {
        let event = SchedulingEvent::StageCompleted {
            identifier: StageIdentifier::new("app", 7, "build", 1),
            result: StageResult::Passed,
        };
        assert_eq!(event.subject(), "stage.completed.app/7/build/1");
    }
}
