//! Build causes: why a pipeline run should start.

use crate::ids::Fingerprint;
use crate::material::{DependencyRevision, MaterialRevisions};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DEFAULT_APPROVED_BY: &str = "changes";
pub const TIMER_APPROVED_BY: &str = "timer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Modification,
    Manual,
    Timer,
    NeverRun,
}

/// Immutable justification for one pipeline run: the resolved material
/// revisions plus who (or what) authorized it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildCause {
    material_revisions: MaterialRevisions,
    trigger: TriggerKind,
    approver: String,
    forced: bool,
    #[serde(default)]
    variables: HashMap<String, String>,
}

impl BuildCause {
    pub fn from_modifications(material_revisions: MaterialRevisions) -> Self {
        Self {
            material_revisions,
            trigger: TriggerKind::Modification,
            approver: DEFAULT_APPROVED_BY.to_string(),
            forced: false,
            variables: HashMap::new(),
        }
    }

    pub fn manual(material_revisions: MaterialRevisions, approver: impl Into<String>) -> Self {
        Self {
            material_revisions,
            trigger: TriggerKind::Manual,
            approver: approver.into(),
            forced: true,
            variables: HashMap::new(),
        }
    }

    pub fn timer(material_revisions: MaterialRevisions) -> Self {
        Self {
            material_revisions,
            trigger: TriggerKind::Timer,
            approver: TIMER_APPROVED_BY.to_string(),
            forced: false,
            variables: HashMap::new(),
        }
    }

    /// Sentinel for a pipeline with no persisted history.
    pub fn never_run() -> Self {
        Self {
            material_revisions: MaterialRevisions::empty(),
            trigger: TriggerKind::NeverRun,
            approver: String::new(),
            forced: false,
            variables: HashMap::new(),
        }
    }

    pub fn has_never_run(&self) -> bool {
        self.trigger == TriggerKind::NeverRun
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn trigger(&self) -> TriggerKind {
        self.trigger
    }

    pub fn approver(&self) -> &str {
        &self.approver
    }

    pub fn material_revisions(&self) -> &MaterialRevisions {
        &self.material_revisions
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Environment variables overridden at trigger time.
    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    pub fn latest_modification_at(&self) -> Option<DateTime<Utc>> {
        self.material_revisions.latest_modified_at()
    }

    pub fn has_dependency_materials(&self) -> bool {
        self.material_revisions
            .iter()
            .any(|r| r.material.is_dependency())
    }

    pub fn dependency_revisions(&self) -> Vec<DependencyRevision> {
        self.material_revisions
            .iter()
            .filter_map(|r| r.dependency_revision())
            .collect()
    }

    /// Content equality: same ordered (fingerprint, latest revision) pairs.
    /// Forced/approver metadata is deliberately ignored so a manual re-run of
    /// identical content still counts as the same content.
    pub fn is_same_as(&self, other: &BuildCause) -> bool {
        self.content_pairs() == other.content_pairs()
    }

    fn content_pairs(&self) -> Vec<(Fingerprint, String)> {
        self.material_revisions
            .iter()
            .map(|r| {
                (
                    r.fingerprint().clone(),
                    r.latest_revision().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }

    fn content_digest(&self) -> String {
        self.content_pairs()
            .into_iter()
            .map(|(f, r)| format!("{}={}", f, r))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Whether this cause should replace `staged` in the schedule queue.
    ///
    /// Forced beats unforced. Between causes of equal forcedness, differing
    /// content is ordered by latest modification timestamp (ties by content
    /// digest) so the winner does not depend on arrival order. Identical
    /// content never replaces the incumbent.
    pub fn trumps(&self, staged: &BuildCause) -> bool {
        if staged.has_never_run() {
            return true;
        }
        if self.forced != staged.forced {
            return self.forced;
        }
        if self.is_same_as(staged) {
            return false;
        }
        match (self.latest_modification_at(), staged.latest_modification_at()) {
            (Some(a), Some(b)) if a != b => a > b,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            _ => self.content_digest() > staged.content_digest(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Fingerprint;
    use crate::material::{Material, MaterialKind, MaterialRevision, Modification};
    use chrono::Duration;

    fn cause_at(revision: &str, at: DateTime<Utc>) -> BuildCause {
        let material = Material {
            fingerprint: Fingerprint::new("m1"),
            kind: MaterialKind::Git {
                url: "https://example.com/repo.git".to_string(),
                branch: "main".to_string(),
            },
            display_name: "repo".to_string(),
            auto_update: true,
        };
        BuildCause::from_modifications(MaterialRevisions::new(vec![MaterialRevision::changed(
            material,
            vec![Modification::new(revision, at)],
        )]))
    }

    #[test]
    fn test_forced_trumps_unforced_regardless_of_order() {
        let now = Utc::now();
        let unforced = cause_at("r1", now);
        let forced = BuildCause::manual(unforced.material_revisions().clone(), "alice");

        assert!(forced.trumps(&unforced));
        assert!(!unforced.trumps(&forced));
    }

    #[test]
    fn test_newer_content_trumps_older() {
        let now = Utc::now();
        let older = cause_at("r1", now - Duration::minutes(5));
        let newer = cause_at("r2", now);

        assert!(newer.trumps(&older));
        assert!(!older.trumps(&newer));
    }

    #[test]
    fn test_identical_content_does_not_trump() {
        let now = Utc::now();
        let a = cause_at("r1", now);
        let b = cause_at("r1", now);
        assert!(!a.trumps(&b));
        assert!(!b.trumps(&a));
    }

    #[test]
    fn test_anything_trumps_never_run() {
        let never = BuildCause::never_run();
        let cause = cause_at("r1", Utc::now());
        assert!(cause.trumps(&never));
    }

    #[test]
    fn test_same_content_different_approver_is_same() {
        let now = Utc::now();
        let auto = cause_at("r1", now);
        let manual = BuildCause::manual(auto.material_revisions().clone(), "bob");
        assert!(manual.is_same_as(&auto));
    }
}
