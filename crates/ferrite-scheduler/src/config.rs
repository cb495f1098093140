//! Scheduler tuning.
//!
//! Thresholds are externally configured values handed in at construction,
//! never compile-time constants.

use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Global compatibility switch for revision resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMode {
    /// Override shared materials only along changed dependency paths.
    Triangle,
    /// Full fan-in consistency across reconverging dependency paths.
    #[default]
    FanIn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub resolution_mode: ResolutionMode,
    /// Seconds without console/heartbeat activity before an assigned job is
    /// considered hung and rescheduled.
    #[serde(default = "default_hung_job_threshold_secs")]
    pub hung_job_threshold_secs: u64,
    /// Seconds a job may wait for its elastic agent before the creation
    /// request is retried.
    #[serde(default = "default_elastic_starvation_secs")]
    pub elastic_agent_starvation_secs: u64,
}

fn default_hung_job_threshold_secs() -> u64 {
    300
}

fn default_elastic_starvation_secs() -> u64 {
    120
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            resolution_mode: ResolutionMode::default(),
            hung_job_threshold_secs: default_hung_job_threshold_secs(),
            elastic_agent_starvation_secs: default_elastic_starvation_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn hung_job_threshold(&self) -> Duration {
        Duration::seconds(self.hung_job_threshold_secs as i64)
    }

    pub fn elastic_agent_starvation(&self) -> Duration {
        Duration::seconds(self.elastic_agent_starvation_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.resolution_mode, ResolutionMode::FanIn);
        assert_eq!(config.hung_job_threshold(), Duration::seconds(300));
        assert_eq!(config.elastic_agent_starvation(), Duration::seconds(120));
    }

    #[test]
    fn test_explicit_mode() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"resolution_mode":"triangle"}"#).unwrap();
        assert_eq!(config.resolution_mode, ResolutionMode::Triangle);
    }
}
