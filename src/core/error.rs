use super::types::{ContainerId, LifecycleState, SubscriptionTier};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid tier: '{0}'")]
    InvalidTier(String),

    #[error("Tier limit exceeded for {tier}: {feature} ({detail})")]
    TierLimitExceeded {
        tier: SubscriptionTier,
        feature: String,
        detail: String,
    },

    #[error("Invalid state for container '{container_id}': {state} ({detail})")]
    InvalidState {
        container_id: ContainerId,
        state: LifecycleState,
        detail: String,
    },

    #[error("Container '{0}' is not running")]
    ContainerNotRunning(ContainerId),

    #[error("Container '{0}' is hibernating")]
    ContainerHibernating(ContainerId),

    #[error("Container '{0}' not found")]
    ContainerNotFound(ContainerId),

    #[error("Container '{0}' already exists")]
    ContainerExists(ContainerId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl LifecycleError {
    pub(crate) fn tier_limit(
        tier: SubscriptionTier,
        feature: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self::TierLimitExceeded {
            tier,
            feature: feature.to_string(),
            detail: detail.into(),
        }
    }

    pub(crate) fn invalid_state(
        container_id: &ContainerId,
        state: LifecycleState,
        detail: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            container_id: container_id.clone(),
            state,
            detail: detail.into(),
        }
    }

    /// True for every "command not valid for the current lifecycle state" error,
    /// including the not-running and hibernating refinements.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::ContainerNotRunning(_) | Self::ContainerHibernating(_)
        )
    }

    /// Policy violations the caller can fix by upgrading or asking for less.
    pub fn is_tier_limit(&self) -> bool {
        matches!(self, Self::TierLimitExceeded { .. })
    }
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

impl<T> From<std::sync::PoisonError<T>> for LifecycleError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for LifecycleError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}
