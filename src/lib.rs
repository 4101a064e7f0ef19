// ============================================================================
// Sandbox Lifecycle Library
// ============================================================================
//
// Tracks sandbox container activity and drives containers through idle
// timeout, hibernation and wake, within the limits of the owner's
// subscription tier.
//
// ============================================================================

pub mod activity;
pub mod config;
pub mod core;
pub mod facade;
pub mod lifecycle;
pub mod policy;
pub mod scheduler;
pub mod storage;

pub use crate::activity::ActivityTracker;
pub use crate::config::EngineConfig;
pub use crate::core::{
    Clock, ContainerId, IdleAction, LifecycleError, LifecycleState, ManualClock, Result,
    RuntimeClock, SharedClock, SubscriptionTier,
};
pub use crate::facade::{LifecycleController, LifecycleControllerBuilder};
pub use crate::lifecycle::{
    HeartbeatResponse, HibernationAction, HibernationResponse, KeepAliveResponse, LifecycleConfig,
    LifecycleEvent, LifecycleRecord, LifecycleStatus, TimeoutExtensionResponse, TransitionRecord,
};
pub use crate::policy::{Capability, SharedTierPolicy, StaticTierPolicy, TierLimits, TierPolicy};
pub use crate::storage::{FileLifecycleStore, InMemoryLifecycleStore, LifecycleStore};
