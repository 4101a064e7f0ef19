use crate::core::{IdleAction, LifecycleError, Result, SubscriptionTier};
use crate::policy::TierLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest idle timeout accepted even on unlimited tiers (30 days).
pub const IDLE_TIMEOUT_CEILING_MINUTES: u32 = 30 * 24 * 60;

/// Per-container lifecycle configuration, in the units callers send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Minutes of inactivity before `idle_action` triggers.
    pub idle_timeout_minutes: u32,
    /// Container lifetime cap in hours. `None` applies the tier ceiling.
    pub max_duration_hours: Option<u32>,
    pub idle_action: IdleAction,
    /// Wake hibernated containers automatically when a command touches them.
    pub auto_wake: bool,
    /// Count preview connections as activity.
    pub keep_alive_on_preview: bool,
    /// Recommended heartbeat cadence for long-running operations.
    pub heartbeat_interval_seconds: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_timeout_minutes: 30,
            max_duration_hours: None,
            idle_action: IdleAction::Shutdown,
            auto_wake: true,
            keep_alive_on_preview: false,
            heartbeat_interval_seconds: 300,
        }
    }
}

impl LifecycleConfig {
    /// Short-lived test runs: 15 minute idle timeout.
    pub fn quick_test() -> Self {
        Self {
            idle_timeout_minutes: 15,
            ..Self::default()
        }
    }

    /// Interactive development: 2 hour idle timeout, hibernate when idle.
    pub fn development() -> Self {
        Self {
            idle_timeout_minutes: 120,
            idle_action: IdleAction::Hibernate,
            ..Self::default()
        }
    }

    /// Single agent task: 1 hour idle timeout, 2 hour lifetime.
    pub fn agent_task() -> Self {
        Self {
            idle_timeout_minutes: 60,
            max_duration_hours: Some(2),
            ..Self::default()
        }
    }

    /// Always-on services.
    pub fn always_on() -> Self {
        Self {
            idle_action: IdleAction::KeepAlive,
            max_duration_hours: None,
            keep_alive_on_preview: true,
            ..Self::default()
        }
    }

    pub fn idle_timeout_minutes(mut self, minutes: u32) -> Self {
        self.idle_timeout_minutes = minutes;
        self
    }

    pub fn idle_action(mut self, action: IdleAction) -> Self {
        self.idle_action = action;
        self
    }

    pub fn max_duration_hours(mut self, hours: u32) -> Self {
        self.max_duration_hours = Some(hours);
        self
    }

    pub fn auto_wake(mut self, enabled: bool) -> Self {
        self.auto_wake = enabled;
        self
    }

    pub fn keep_alive_on_preview(mut self, enabled: bool) -> Self {
        self.keep_alive_on_preview = enabled;
        self
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.idle_timeout_minutes) * 60)
    }

    pub fn max_duration(&self) -> Option<Duration> {
        self.max_duration_hours
            .map(|hours| Duration::from_secs(u64::from(hours) * 3600))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat_interval_seconds))
    }

    /// Checks every field against the tier before anything is applied.
    ///
    /// # Errors
    /// `InvalidConfig` for malformed values, `TierLimitExceeded` for values the tier does not grant.
    pub fn validate(&self, tier: SubscriptionTier, limits: &TierLimits) -> Result<()> {
        if self.idle_timeout_minutes == 0 {
            return Err(LifecycleError::InvalidConfig(
                "idle_timeout_minutes must be > 0".to_string(),
            ));
        }
        if self.idle_timeout_minutes > IDLE_TIMEOUT_CEILING_MINUTES {
            return Err(LifecycleError::InvalidConfig(format!(
                "idle_timeout_minutes cannot exceed {}",
                IDLE_TIMEOUT_CEILING_MINUTES
            )));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(LifecycleError::InvalidConfig(
                "heartbeat_interval_seconds must be > 0".to_string(),
            ));
        }
        if self.max_duration_hours == Some(0) {
            return Err(LifecycleError::InvalidConfig(
                "max_duration_hours must be > 0".to_string(),
            ));
        }

        if !limits.allows_idle_timeout(self.idle_timeout()) {
            return Err(LifecycleError::tier_limit(
                tier,
                "idle_timeout",
                format!(
                    "{} minutes requested, tier allows at most {}",
                    self.idle_timeout_minutes,
                    limits.max_idle_timeout_minutes().unwrap_or_default()
                ),
            ));
        }
        match self.idle_action {
            IdleAction::Hibernate if !limits.supports_hibernate => {
                return Err(LifecycleError::tier_limit(
                    tier,
                    "hibernate",
                    "idle action 'hibernate' is not available on this tier",
                ));
            }
            IdleAction::KeepAlive if !limits.supports_keep_alive => {
                return Err(LifecycleError::tier_limit(
                    tier,
                    "keep_alive",
                    "idle action 'keep_alive' is not available on this tier",
                ));
            }
            _ => {}
        }
        if let Some(requested) = self.max_duration() {
            if !limits.allows_max_duration(requested) {
                return Err(LifecycleError::tier_limit(
                    tier,
                    "max_duration",
                    format!(
                        "{} hours requested, tier allows at most {}",
                        self.max_duration_hours.unwrap_or_default(),
                        limits
                            .max_duration
                            .map(|d| d.as_secs() / 3600)
                            .unwrap_or_default()
                    ),
                ));
            }
        }
        Ok(())
    }
}
