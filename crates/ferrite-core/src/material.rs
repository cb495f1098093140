//! Materials, modifications and revision collections.
//!
//! A material is an external change source feeding a pipeline. Revisions of
//! upstream-pipeline (dependency) materials use the locator format
//! `pipeline/counter/stage/stage-counter`.

use crate::ids::{Fingerprint, PipelineName};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaterialKind {
    Git {
        url: String,
        branch: String,
    },
    DependencyPipeline {
        pipeline: PipelineName,
        stage: String,
    },
    Package {
        repository: String,
        package: String,
    },
}

/// An external change source. Immutable once configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Material {
    pub fingerprint: Fingerprint,
    pub kind: MaterialKind,
    pub display_name: String,
    #[serde(default = "default_auto_update")]
    pub auto_update: bool,
}

fn default_auto_update() -> bool {
    true
}

impl Material {
    pub fn is_dependency(&self) -> bool {
        matches!(self.kind, MaterialKind::DependencyPipeline { .. })
    }

    /// The upstream pipeline this material depends on, if any.
    pub fn dependency_pipeline(&self) -> Option<&PipelineName> {
        match &self.kind {
            MaterialKind::DependencyPipeline { pipeline, .. } => Some(pipeline),
            _ => None,
        }
    }
}

/// One atomic change on a material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Modification {
    pub revision: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub changed_paths: Vec<String>,
}

impl Modification {
    pub fn new(revision: impl Into<String>, modified_at: DateTime<Utc>) -> Self {
        Self {
            revision: revision.into(),
            author: None,
            comment: None,
            modified_at,
            changed_paths: Vec::new(),
        }
    }
}

/// A material paired with the modifications understood to have arrived
/// together. Modifications are ordered newest-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MaterialRevision {
    pub material: Material,
    pub modifications: Vec<Modification>,
    pub changed: bool,
}

impl MaterialRevision {
    pub fn new(material: Material, modifications: Vec<Modification>) -> Self {
        Self {
            material,
            modifications,
            changed: false,
        }
    }

    pub fn changed(material: Material, modifications: Vec<Modification>) -> Self {
        Self {
            material,
            modifications,
            changed: true,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.material.fingerprint
    }

    pub fn latest_modification(&self) -> Option<&Modification> {
        self.modifications.first()
    }

    pub fn latest_revision(&self) -> Option<&str> {
        self.latest_modification().map(|m| m.revision.as_str())
    }

    pub fn latest_modified_at(&self) -> Option<DateTime<Utc>> {
        self.latest_modification().map(|m| m.modified_at)
    }

    /// Same material, different modification set. The `changed` flag is kept.
    pub fn with_modifications(&self, modifications: Vec<Modification>) -> Self {
        Self {
            material: self.material.clone(),
            modifications,
            changed: self.changed,
        }
    }

    /// Parses the dependency locator out of the latest modification, when
    /// this revision belongs to an upstream-pipeline material.
    pub fn dependency_revision(&self) -> Option<DependencyRevision> {
        if !self.material.is_dependency() {
            return None;
        }
        self.latest_revision().and_then(|r| r.parse().ok())
    }
}

/// Ordered collection of material revisions for one pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MaterialRevisions(Vec<MaterialRevision>);

impl MaterialRevisions {
    pub fn new(revisions: Vec<MaterialRevision>) -> Self {
        Self(revisions)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, revision: MaterialRevision) {
        self.0.push(revision);
    }

    pub fn iter(&self) -> impl Iterator<Item = &MaterialRevision> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn find_by_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&MaterialRevision> {
        self.0.iter().find(|r| r.fingerprint() == fingerprint)
    }

    pub fn materials(&self) -> Vec<&Material> {
        self.0.iter().map(|r| &r.material).collect()
    }

    /// Timestamp of the newest modification across all materials.
    pub fn latest_modified_at(&self) -> Option<DateTime<Utc>> {
        self.0.iter().filter_map(|r| r.latest_modified_at()).max()
    }

    pub fn has_changes(&self) -> bool {
        self.0.iter().any(|r| r.changed)
    }

    /// True when some material has no modification at all, meaning the
    /// upstream has never produced anything usable.
    pub fn is_missing_modifications(&self) -> bool {
        self.0.iter().any(|r| r.modifications.is_empty())
    }
}

impl IntoIterator for MaterialRevisions {
    type Item = MaterialRevision;
    type IntoIter = std::vec::IntoIter<MaterialRevision>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<MaterialRevision> for MaterialRevisions {
    fn from_iter<I: IntoIterator<Item = MaterialRevision>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parsed form of a dependency-material revision string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct DependencyRevision {
    pub pipeline: PipelineName,
    pub pipeline_counter: u32,
    pub stage: String,
    pub stage_counter: u32,
}

#[derive(Debug, Error, PartialEq)]
#[error("malformed dependency revision: {0}")]
pub struct DependencyRevisionParseError(String);

impl fmt::Display for DependencyRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.pipeline, self.pipeline_counter, self.stage, self.stage_counter
        )
    }
}

impl std::str::FromStr for DependencyRevision {
    type Err = DependencyRevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 4 {
            return Err(DependencyRevisionParseError(s.to_string()));
        }
        let pipeline_counter = parts[1]
            .parse()
            .map_err(|_| DependencyRevisionParseError(s.to_string()))?;
        let stage_counter = parts[3]
            .parse()
            .map_err(|_| DependencyRevisionParseError(s.to_string()))?;
        Ok(Self {
            pipeline: PipelineName::new(parts[0]),
            pipeline_counter,
            stage: parts[2].to_string(),
            stage_counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_material(fingerprint: &str) -> Material {
        Material {
            fingerprint: Fingerprint::new(fingerprint),
            kind: MaterialKind::Git {
                url: "https://example.com/repo.git".to_string(),
                branch: "main".to_string(),
            },
            display_name: fingerprint.to_string(),
            auto_update: true,
        }
    }

    #[test]
    fn test_dependency_revision_round_trip() {
        let rev: DependencyRevision = "upstream/12/dist/1".parse().unwrap();
        assert_eq!(rev.pipeline, PipelineName::new("upstream"));
        assert_eq!(rev.pipeline_counter, 12);
        assert_eq!(rev.to_string(), "upstream/12/dist/1");
    }

    #[test]
    fn test_dependency_revision_rejects_garbage() {
        assert!("upstream/only".parse::<DependencyRevision>().is_err());
        assert!("a/b/c/d".parse::<DependencyRevision>().is_err());
    }

    #[test]
    fn test_latest_modification_is_first() {
        let now = Utc::now();
        let rev = MaterialRevision::new(
            git_material("m1"),
            vec![
                Modification::new("r2", now),
                Modification::new("r1", now - chrono::Duration::hours(1)),
            ],
        );
        assert_eq!(rev.latest_revision(), Some("r2"));
    }

    #[test]
    fn test_latest_modified_at_across_materials() {
        let now = Utc::now();
        let older = now - chrono::Duration::hours(2);
        let revisions = MaterialRevisions::new(vec![
            MaterialRevision::new(git_material("m1"), vec![Modification::new("a", older)]),
            MaterialRevision::new(git_material("m2"), vec![Modification::new("b", now)]),
        ]);
        assert_eq!(revisions.latest_modified_at(), Some(now));
    }
}
