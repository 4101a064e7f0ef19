use super::record::LifecycleRecord;
use crate::core::clock::between;
use crate::core::{ContainerId, IdleAction, LifecycleState, SubscriptionTier};
use crate::policy::TierLimits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable point-in-time view of a container's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleStatus {
    pub container_id: ContainerId,
    pub state: LifecycleState,
    pub owner_tier: SubscriptionTier,
    pub idle_timeout_minutes: u32,
    pub idle_action: IdleAction,
    pub auto_wake: bool,
    pub keep_alive_enabled: bool,
    pub keep_alive_on_preview: bool,
    pub last_activity_at: DateTime<Utc>,
    /// When the idle action fires; `None` under keep-alive or outside RUNNING.
    pub timeout_at: Option<DateTime<Utc>>,
    pub time_remaining_seconds: Option<u64>,
    /// Hard stop from the lifetime cap; `None` is unlimited.
    pub max_duration_at: Option<DateTime<Utc>>,
    pub extensions_used: u32,
    pub extensions_remaining: Option<u32>,
    pub uptime_seconds: u64,
    pub state_since: DateTime<Utc>,
}

impl LifecycleStatus {
    pub fn capture(record: &LifecycleRecord, limits: &TierLimits, now: DateTime<Utc>) -> Self {
        let timeout_at = record.pending_timeout_at();
        Self {
            container_id: record.container_id.clone(),
            state: record.state(),
            owner_tier: record.owner_tier,
            idle_timeout_minutes: record.config.idle_timeout_minutes,
            idle_action: record.config.idle_action,
            auto_wake: record.config.auto_wake,
            keep_alive_enabled: record.keep_alive_enabled,
            keep_alive_on_preview: record.config.keep_alive_on_preview,
            last_activity_at: record.last_activity_at,
            timeout_at,
            time_remaining_seconds: timeout_at.map(|at| between(now, at).as_secs()),
            max_duration_at: record.max_duration_deadline(),
            extensions_used: record.extensions_used,
            extensions_remaining: limits.extensions_remaining(record.extensions_used),
            uptime_seconds: record.uptime(now).as_secs(),
            state_since: record.machine.state_since(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub container_id: ContainerId,
    pub status: LifecycleState,
    pub last_heartbeat: DateTime<Utc>,
    pub idle_timeout_seconds: u64,
    pub next_timeout_at: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutExtensionResponse {
    pub container_id: ContainerId,
    pub new_timeout_at: DateTime<Utc>,
    pub added_minutes: u32,
    /// Largest extension the tier would have accepted for this request.
    pub max_allowed_minutes: u32,
    pub extensions_used: u32,
    pub extensions_remaining: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub container_id: ContainerId,
    pub keep_alive_enabled: bool,
    pub requires_tier: Option<SubscriptionTier>,
    pub user_tier: SubscriptionTier,
    pub is_authorized: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HibernationAction {
    Hibernate,
    Wake,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HibernationResponse {
    pub container_id: ContainerId,
    pub status: LifecycleState,
    pub action: HibernationAction,
    pub estimated_resume_seconds: Option<u64>,
    pub message: String,
}
