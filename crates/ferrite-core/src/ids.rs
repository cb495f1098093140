//! Strongly-typed identifiers for domain entities.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(AgentId, "agt");
define_id!(JobId, "job");
define_id!(StageInstanceId, "stg");
define_id!(PipelineInstanceId, "pip");

/// Pipeline name, compared and hashed case-insensitively.
///
/// Display preserves the spelling the configuration used.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct PipelineName(String);

impl PipelineName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for PipelineName {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for PipelineName {}

impl Hash for PipelineName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.0.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for PipelineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PipelineName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for PipelineName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Stable fingerprint identifying a configured material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifies one persisted pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PipelineIdentifier {
    pub name: PipelineName,
    pub counter: u32,
    pub label: String,
}

impl PipelineIdentifier {
    pub fn new(name: impl Into<PipelineName>, counter: u32) -> Self {
        let name = name.into();
        let label = format!("{}-{}", name, counter);
        Self {
            name,
            counter,
            label,
        }
    }
}

impl fmt::Display for PipelineIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.counter)
    }
}

/// Identifies one persisted stage instance within a pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct StageIdentifier {
    pub pipeline_name: PipelineName,
    pub pipeline_counter: u32,
    pub stage_name: String,
    pub stage_counter: u32,
}

impl StageIdentifier {
    pub fn new(
        pipeline_name: impl Into<PipelineName>,
        pipeline_counter: u32,
        stage_name: impl Into<String>,
        stage_counter: u32,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            pipeline_counter,
            stage_name: stage_name.into(),
            stage_counter,
        }
    }

    pub fn pipeline_identifier(&self) -> PipelineIdentifier {
        PipelineIdentifier::new(self.pipeline_name.clone(), self.pipeline_counter)
    }

    /// Stable locator used for mutex keys and health scoping.
    pub fn stage_locator(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.pipeline_name, self.pipeline_counter, self.stage_name, self.stage_counter
        )
    }
}

impl fmt::Display for StageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stage_locator())
    }
}

/// Identifies one persisted job instance within a stage instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct JobIdentifier {
    pub stage: StageIdentifier,
    pub job_name: String,
    pub job_id: JobId,
}

impl JobIdentifier {
    pub fn new(stage: StageIdentifier, job_name: impl Into<String>, job_id: JobId) -> Self {
        Self {
            stage,
            job_name: job_name.into(),
            job_id,
        }
    }

    pub fn build_locator(&self) -> String {
        format!("{}/{}", self.stage.stage_locator(), self.job_name)
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build_locator())
    }
}
