//! Operation results for precondition outcomes.
//!
//! Precondition failures (disk full, paused, locked, unauthorized, already
//! triggered) are expected, non-exceptional outcomes. They travel in an
//! [`OperationResult`] value with a stable classification and a scope, so
//! health reporting can target the right entity. The first failure recorded
//! wins; later calls are ignored.

use crate::ids::PipelineName;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NotFound,
    Unauthorized,
    Conflict,
    NotAcceptable,
    InternalError,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HealthScope {
    Global,
    Pipeline(PipelineName),
    Stage(PipelineName, String),
    Job(PipelineName, String, String),
}

impl HealthScope {
    pub fn for_pipeline(name: impl Into<PipelineName>) -> Self {
        HealthScope::Pipeline(name.into())
    }

    pub fn for_stage(name: impl Into<PipelineName>, stage: impl Into<String>) -> Self {
        HealthScope::Stage(name.into(), stage.into())
    }
}

impl fmt::Display for HealthScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthScope::Global => write!(f, "global"),
            HealthScope::Pipeline(p) => write!(f, "pipeline/{}", p),
            HealthScope::Stage(p, s) => write!(f, "pipeline/{}/stage/{}", p, s),
            HealthScope::Job(p, s, j) => write!(f, "pipeline/{}/stage/{}/job/{}", p, s, j),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthLevel {
    Ok,
    Warning,
    Error,
}

/// A human-readable health entry scoped to the entity it concerns.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthState {
    pub level: HealthLevel,
    pub message: String,
    pub description: String,
    pub scope: HealthScope,
}

impl HealthState {
    pub fn success(scope: HealthScope) -> Self {
        Self {
            level: HealthLevel::Ok,
            message: String::new(),
            description: String::new(),
            scope,
        }
    }

    pub fn error(
        message: impl Into<String>,
        description: impl Into<String>,
        scope: HealthScope,
    ) -> Self {
        Self {
            level: HealthLevel::Error,
            message: message.into(),
            description: description.into(),
            scope,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub classification: Classification,
    pub message: String,
    pub description: String,
    pub scope: HealthScope,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationResult {
    failure: Option<Failure>,
    message: Option<String>,
}

impl OperationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_continue(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        match &self.failure {
            Some(f) => Some(f.message.as_str()),
            None => self.message.as_deref(),
        }
    }

    /// Success message for accepted requests. Ignored once failed.
    pub fn accepted(&mut self, message: impl Into<String>) {
        if self.failure.is_none() {
            self.message = Some(message.into());
        }
    }

    fn fail(
        &mut self,
        classification: Classification,
        message: impl Into<String>,
        description: impl Into<String>,
        scope: HealthScope,
    ) {
        if self.failure.is_none() {
            self.failure = Some(Failure {
                classification,
                message: message.into(),
                description: description.into(),
                scope,
            });
        }
    }

    pub fn not_found(
        &mut self,
        message: impl Into<String>,
        description: impl Into<String>,
        scope: HealthScope,
    ) {
        self.fail(Classification::NotFound, message, description, scope);
    }

    pub fn unauthorized(
        &mut self,
        message: impl Into<String>,
        description: impl Into<String>,
        scope: HealthScope,
    ) {
        self.fail(Classification::Unauthorized, message, description, scope);
    }

    pub fn conflict(
        &mut self,
        message: impl Into<String>,
        description: impl Into<String>,
        scope: HealthScope,
    ) {
        self.fail(Classification::Conflict, message, description, scope);
    }

    pub fn not_acceptable(
        &mut self,
        message: impl Into<String>,
        description: impl Into<String>,
        scope: HealthScope,
    ) {
        self.fail(Classification::NotAcceptable, message, description, scope);
    }

    pub fn internal_error(
        &mut self,
        message: impl Into<String>,
        description: impl Into<String>,
        scope: HealthScope,
    ) {
        self.fail(Classification::InternalError, message, description, scope);
    }

    pub fn to_health_state(&self) -> HealthState {
        match &self.failure {
            Some(f) => HealthState::error(f.message.clone(), f.description.clone(), f.scope.clone()),
            None => HealthState::success(HealthScope::Global),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_first_failure_wins() {
        let mut result = OperationResult::new();
        result.conflict("paused", "pipeline is paused", HealthScope::for_pipeline("app"));
        result.not_found("gone", "stage missing", HealthScope::Global);

        let failure = result.failure().unwrap();
        assert_eq!(failure.classification, Classification::Conflict);
        assert_eq!(failure.message, "paused");
    }

    #[test]
    fn test_accepted_ignored_after_failure() {
        let mut result = OperationResult::new();
        result.conflict("busy", "already triggered", HealthScope::for_pipeline("app"));
        result.accepted("request accepted");
        assert_eq!(result.message(), Some("busy"));
        assert!(!result.can_continue());
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(
            HealthScope::for_stage("app", "build").to_string(),
            "pipeline/app/stage/build"
        );
    }
}
