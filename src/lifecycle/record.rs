use super::config::LifecycleConfig;
use super::state::{LifecycleStateMachine, TransitionGuards};
use crate::core::clock::{between, deadline};
use crate::core::{ContainerId, IdleAction, LifecycleState, SubscriptionTier};
use crate::policy::TierLimits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle record of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub container_id: ContainerId,
    pub owner_tier: SubscriptionTier,
    pub config: LifecycleConfig,
    pub machine: LifecycleStateMachine,
    pub keep_alive_enabled: bool,
    pub last_activity_at: DateTime<Utc>,
    /// Deadline pushed out by `extend_timeout`, if any.
    pub extended_until: Option<DateTime<Utc>>,
    /// Effective lifetime cap; `None` is unlimited.
    pub max_duration: Option<Duration>,
    pub extensions_used: u32,
    pub created_at: DateTime<Utc>,
}

impl LifecycleRecord {
    /// A freshly provisioned record in STARTING. The config must already be validated.
    pub fn new(
        container_id: ContainerId,
        owner_tier: SubscriptionTier,
        config: LifecycleConfig,
        limits: &TierLimits,
        history_limit: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let max_duration = limits.effective_max_duration(config.max_duration());
        let keep_alive_enabled = config.idle_action == IdleAction::KeepAlive;
        Self {
            container_id,
            owner_tier,
            config,
            machine: LifecycleStateMachine::new(now, history_limit),
            keep_alive_enabled,
            last_activity_at: now,
            extended_until: None,
            max_duration,
            extensions_used: 0,
            created_at: now,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout()
    }

    /// `max(last_activity_at + idle_timeout, extended_until)`, absent under keep-alive.
    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        if self.keep_alive_enabled {
            return None;
        }
        let base = deadline(self.last_activity_at, self.idle_timeout());
        Some(match self.extended_until {
            Some(extended) if extended > base => extended,
            _ => base,
        })
    }

    /// The idle deadline a timer should be armed for: only RUNNING containers have one.
    pub fn pending_timeout_at(&self) -> Option<DateTime<Utc>> {
        if self.state() == LifecycleState::Running {
            self.timeout_at()
        } else {
            None
        }
    }

    pub fn max_duration_deadline(&self) -> Option<DateTime<Utc>> {
        self.max_duration
            .map(|limit| deadline(self.created_at, limit))
    }

    /// Moves `last_activity_at` forward; older timestamps are ignored.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        between(self.last_activity_at, now)
    }

    pub fn uptime(&self, now: DateTime<Utc>) -> Duration {
        between(self.created_at, now)
    }

    pub fn guards(&self, limits: &TierLimits) -> TransitionGuards {
        TransitionGuards {
            keep_alive_enabled: self.keep_alive_enabled,
            supports_hibernate: limits.supports_hibernate,
        }
    }
}
