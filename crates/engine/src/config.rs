//! Engine configuration.
//!
//! Every field has a default, so a YAML file only needs to name what it
//! overrides.  Durations are written as whole seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Tuning knobs for plan assembly and execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of plan-assembly iterations.
    pub max_depth: usize,
    /// Overall timeout of one plan-assembly iteration.
    #[serde(with = "duration_secs")]
    pub plan_creation_timeout: Duration,
    /// Plan creator calls allowed in flight at once.
    pub plan_creator_workers: usize,
    /// Stop assembly as soon as an iteration resolves nothing.
    pub fail_fast_on_no_progress: bool,
    /// Period of the expiry reaper.
    #[serde(with = "duration_secs")]
    pub reaper_interval: Duration,
    /// Expiry of waiting nodes that declare no timeout of their own.
    #[serde(with = "duration_secs")]
    pub default_task_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            plan_creation_timeout: Duration::from_secs(300),
            plan_creator_workers: 4,
            fail_fast_on_no_progress: true,
            reaper_interval: Duration::from_secs(5),
            default_task_timeout: steps::task::DEFAULT_TASK_TIMEOUT,
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, EngineError> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        if config.plan_creator_workers == 0 {
            return Err(EngineError::Config(
                "plan_creator_workers must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&content)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str("max_depth: 3\nreaper_interval: 1\n").unwrap();
        assert_eq!(config.max_depth, 3);
        assert_eq!(config.reaper_interval, Duration::from_secs(1));
        assert_eq!(config.plan_creator_workers, 4);
        assert!(config.fail_fast_on_no_progress);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = EngineConfig::from_yaml_str("plan_creator_workers: 0").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
