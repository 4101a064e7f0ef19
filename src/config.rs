use crate::core::{LifecycleError, Result};
use crate::lifecycle::state::DEFAULT_HISTORY_LIMIT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest single `extend_timeout` request, in minutes (8 hours).
pub const EXTENSION_CEILING_MINUTES: u32 = 480;

/// Engine-wide settings shared by every container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Idle timeout applied when a container is provisioned without a config
    pub default_idle_timeout_minutes: u32,

    /// Upper bound for one extension request
    pub extension_ceiling_minutes: u32,

    /// Resume estimate reported by hibernate responses
    pub estimated_resume_seconds: u64,

    /// Transitions kept per container
    pub history_limit: usize,

    /// Directory for durable records; `None` keeps everything in memory
    pub store_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_idle_timeout_minutes: 30,
            extension_ceiling_minutes: EXTENSION_CEILING_MINUTES,
            estimated_resume_seconds: 5,
            history_limit: DEFAULT_HISTORY_LIMIT,
            store_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default idle timeout
    pub fn default_idle_timeout_minutes(mut self, minutes: u32) -> Self {
        self.default_idle_timeout_minutes = minutes;
        self
    }

    /// Set the extension request ceiling
    pub fn extension_ceiling_minutes(mut self, minutes: u32) -> Self {
        self.extension_ceiling_minutes = minutes;
        self
    }

    /// Set the reported resume estimate
    pub fn estimated_resume_seconds(mut self, seconds: u64) -> Self {
        self.estimated_resume_seconds = seconds;
        self
    }

    /// Set the per-container history length
    pub fn history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    /// Persist records under `dir`
    pub fn store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    pub fn estimated_resume(&self) -> Duration {
        Duration::from_secs(self.estimated_resume_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_idle_timeout_minutes == 0 {
            return Err(LifecycleError::InvalidConfig(
                "default_idle_timeout_minutes must be > 0".to_string(),
            ));
        }
        if self.extension_ceiling_minutes == 0 {
            return Err(LifecycleError::InvalidConfig(
                "extension_ceiling_minutes must be > 0".to_string(),
            ));
        }
        if self.history_limit == 0 {
            return Err(LifecycleError::InvalidConfig(
                "history_limit must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from a JSON file; missing keys take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
            LifecycleError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }
}
