//! Error types for the scheduling core.

use crate::ids::{PipelineName, StageIdentifier};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors: fatal to the specific operation
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(PipelineName),

    #[error("Stage not found: {pipeline}/{stage}")]
    StageNotFound {
        pipeline: PipelineName,
        stage: String,
    },

    #[error("Job not found: {stage}/{job}")]
    JobNotFound { stage: StageIdentifier, job: String },

    #[error("Pipeline instance not found: {name}/{counter}")]
    PipelineInstanceNotFound { name: PipelineName, counter: u32 },

    #[error("Cannot schedule stage {stage} of pipeline {pipeline}: {reason}")]
    CannotSchedule {
        pipeline: PipelineName,
        stage: String,
        reason: String,
    },

    // Staleness: recovered locally, retried on the next cycle
    #[error("Underlying data is out of date: {0}")]
    OutOfDate(String),

    // Revision resolution
    #[error("No compatible upstream revisions for pipeline {0}")]
    NoCompatibleUpstreamRevisions(PipelineName),

    #[error("No modifications present for dependency material {0}")]
    NoModificationsPresentForDependency(String),

    // Agent protocol violations: fatal to the single update
    #[error("Agent changed in the middle of a job. Expected {expected}, reported {reported}")]
    InvalidAgent { expected: String, reported: String },

    #[error("Duplicate agent cookie for {0}")]
    DuplicateAgentCookie(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    // Infrastructure
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Staleness is never surfaced to users; callers discard the attempt and
    /// rely on the next cycle.
    pub fn is_out_of_date(&self) -> bool {
        matches!(self, Error::OutOfDate(_))
    }
}
