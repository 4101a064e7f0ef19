// ============================================================================
// Tier Policy
// ============================================================================
//
// Maps a subscription tier to the lifecycle capabilities it grants. Policies
// are pure and in-memory: lookups never block, so heartbeats and status
// queries can consult them on every call.
//
// ============================================================================

use crate::core::{LifecycleError, Result, SubscriptionTier};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

/// Capability limits for one tier. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_idle_timeout: Option<Duration>,
    pub max_extensions: Option<u32>,
    pub supports_hibernate: bool,
    pub supports_keep_alive: bool,
    /// Ceiling for the container lifetime cap, also the default when none is requested.
    pub max_duration: Option<Duration>,
}

impl TierLimits {
    pub fn max_idle_timeout_minutes(&self) -> Option<u64> {
        self.max_idle_timeout.map(|d| d.as_secs() / MINUTE)
    }

    pub fn allows_idle_timeout(&self, timeout: Duration) -> bool {
        self.max_idle_timeout.is_none_or(|max| timeout <= max)
    }

    pub fn allows_extension(&self, extensions_used: u32) -> bool {
        self.max_extensions.is_none_or(|max| extensions_used < max)
    }

    pub fn extensions_remaining(&self, extensions_used: u32) -> Option<u32> {
        self.max_extensions
            .map(|max| max.saturating_sub(extensions_used))
    }

    pub fn allows_max_duration(&self, requested: Duration) -> bool {
        self.max_duration.is_none_or(|ceiling| requested <= ceiling)
    }

    /// Lifetime cap actually applied: the requested one, else the tier ceiling.
    pub fn effective_max_duration(&self, requested: Option<Duration>) -> Option<Duration> {
        requested.or(self.max_duration)
    }
}

/// A gated lifecycle capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Hibernate,
    KeepAlive,
    Extensions,
    UnlimitedDuration,
}

impl Capability {
    fn granted_by(&self, limits: &TierLimits) -> bool {
        match self {
            Capability::Hibernate => limits.supports_hibernate,
            Capability::KeepAlive => limits.supports_keep_alive,
            Capability::Extensions => limits.max_extensions != Some(0),
            Capability::UnlimitedDuration => limits.max_duration.is_none(),
        }
    }
}

/// Policy interface consulted by the controller on every command.
pub trait TierPolicy: Send + Sync {
    fn limits(&self, tier: SubscriptionTier) -> TierLimits;

    /// Lookup by tier name, rejecting unknown names.
    fn limits_for_name(&self, tier: &str) -> Result<TierLimits> {
        let tier: SubscriptionTier = tier.parse()?;
        Ok(self.limits(tier))
    }

    /// Lowest tier granting `capability`, if any does.
    fn required_tier(&self, capability: Capability) -> Option<SubscriptionTier> {
        SubscriptionTier::ALL
            .into_iter()
            .find(|tier| capability.granted_by(&self.limits(*tier)))
    }
}

pub type SharedTierPolicy = Arc<dyn TierPolicy>;

lazy_static! {
    static ref GLOBAL_POLICY: Arc<StaticTierPolicy> = Arc::new(StaticTierPolicy::new());
}

/// Flat table policy with the standard subscription limits.
#[derive(Debug, Clone)]
pub struct StaticTierPolicy {
    /// One row per tier, in `SubscriptionTier::ALL` order.
    table: [TierLimits; 5],
}

fn row(tier: SubscriptionTier) -> usize {
    match tier {
        SubscriptionTier::Free => 0,
        SubscriptionTier::Basic => 1,
        SubscriptionTier::Pro => 2,
        SubscriptionTier::Ultimate => 3,
        SubscriptionTier::Enterprise => 4,
    }
}

impl StaticTierPolicy {
    pub fn new() -> Self {
        Self {
            table: [
                TierLimits {
                    max_idle_timeout: Some(Duration::from_secs(30 * MINUTE)),
                    max_extensions: Some(0),
                    supports_hibernate: false,
                    supports_keep_alive: false,
                    max_duration: Some(Duration::from_secs(2 * HOUR)),
                },
                TierLimits {
                    max_idle_timeout: Some(Duration::from_secs(60 * MINUTE)),
                    max_extensions: Some(2),
                    supports_hibernate: false,
                    supports_keep_alive: false,
                    max_duration: Some(Duration::from_secs(8 * HOUR)),
                },
                TierLimits {
                    max_idle_timeout: Some(Duration::from_secs(120 * MINUTE)),
                    max_extensions: Some(5),
                    supports_hibernate: true,
                    supports_keep_alive: false,
                    max_duration: Some(Duration::from_secs(24 * HOUR)),
                },
                TierLimits {
                    max_idle_timeout: Some(Duration::from_secs(240 * MINUTE)),
                    max_extensions: Some(10),
                    supports_hibernate: true,
                    supports_keep_alive: false,
                    max_duration: Some(Duration::from_secs(72 * HOUR)),
                },
                TierLimits {
                    max_idle_timeout: None,
                    max_extensions: None,
                    supports_hibernate: true,
                    supports_keep_alive: true,
                    max_duration: None,
                },
            ],
        }
    }

    /// Process-wide default policy.
    pub fn global() -> Arc<StaticTierPolicy> {
        Arc::clone(&GLOBAL_POLICY)
    }

    /// Replace one tier's row, e.g. for a custom plan or in tests.
    pub fn with_limits(mut self, tier: SubscriptionTier, limits: TierLimits) -> Self {
        self.table[row(tier)] = limits;
        self
    }
}

impl Default for StaticTierPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl TierPolicy for StaticTierPolicy {
    fn limits(&self, tier: SubscriptionTier) -> TierLimits {
        self.table[row(tier)].clone()
    }
}

/// Raises `TierLimitExceeded` unless `tier` grants `capability`.
pub fn require_capability(
    policy: &dyn TierPolicy,
    tier: SubscriptionTier,
    capability: Capability,
) -> Result<TierLimits> {
    let limits = policy.limits(tier);
    if capability.granted_by(&limits) {
        return Ok(limits);
    }
    let detail = match policy.required_tier(capability) {
        Some(required) => format!("requires {} tier or higher", required),
        None => "not available on any tier".to_string(),
    };
    Err(LifecycleError::tier_limit(
        tier,
        match capability {
            Capability::Hibernate => "hibernate",
            Capability::KeepAlive => "keep_alive",
            Capability::Extensions => "extend_timeout",
            Capability::UnlimitedDuration => "max_duration",
        },
        detail,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let policy = StaticTierPolicy::new();

        let free = policy.limits(SubscriptionTier::Free);
        assert_eq!(free.max_idle_timeout_minutes(), Some(30));
        assert_eq!(free.max_extensions, Some(0));
        assert!(!free.supports_hibernate);

        let pro = policy.limits(SubscriptionTier::Pro);
        assert_eq!(pro.max_idle_timeout_minutes(), Some(120));
        assert!(pro.supports_hibernate);
        assert!(!pro.supports_keep_alive);

        let enterprise = policy.limits(SubscriptionTier::Enterprise);
        assert_eq!(enterprise.max_idle_timeout, None);
        assert_eq!(enterprise.max_extensions, None);
        assert!(enterprise.supports_keep_alive);
    }

    #[test]
    fn test_unknown_tier_is_an_error() {
        let policy = StaticTierPolicy::global();
        assert!(matches!(
            policy.limits_for_name("PLATINUM"),
            Err(LifecycleError::InvalidTier(_))
        ));
        assert!(policy.limits_for_name("ultimate").is_ok());
    }

    #[test]
    fn test_required_tier() {
        let policy = StaticTierPolicy::new();
        assert_eq!(
            policy.required_tier(Capability::Hibernate),
            Some(SubscriptionTier::Pro)
        );
        assert_eq!(
            policy.required_tier(Capability::KeepAlive),
            Some(SubscriptionTier::Enterprise)
        );
        assert_eq!(
            policy.required_tier(Capability::Extensions),
            Some(SubscriptionTier::Basic)
        );
    }

    #[test]
    fn test_require_capability() {
        let policy = StaticTierPolicy::new();
        let err = require_capability(&policy, SubscriptionTier::Basic, Capability::Hibernate)
            .unwrap_err();
        assert!(err.is_tier_limit());
        assert!(err.to_string().contains("requires PRO"));
        assert!(
            require_capability(&policy, SubscriptionTier::Ultimate, Capability::Hibernate).is_ok()
        );
    }

    #[test]
    fn test_extension_and_duration_checks() {
        let basic = StaticTierPolicy::new().limits(SubscriptionTier::Basic);
        assert!(basic.allows_extension(1));
        assert!(!basic.allows_extension(2));
        assert_eq!(basic.extensions_remaining(1), Some(1));
        assert!(basic.allows_max_duration(Duration::from_secs(HOUR)));
        assert!(!basic.allows_max_duration(Duration::from_secs(9 * HOUR)));
        assert_eq!(
            basic.effective_max_duration(None),
            Some(Duration::from_secs(8 * HOUR))
        );

        let enterprise = StaticTierPolicy::new().limits(SubscriptionTier::Enterprise);
        assert!(enterprise.allows_extension(u32::MAX - 1));
        assert_eq!(enterprise.effective_max_duration(None), None);
    }

    #[test]
    fn test_every_tier_has_its_own_row() {
        let policy = StaticTierPolicy::new().with_limits(
            SubscriptionTier::Ultimate,
            TierLimits {
                max_extensions: Some(99),
                ..StaticTierPolicy::new().limits(SubscriptionTier::Ultimate)
            },
        );
        let extensions: Vec<_> = SubscriptionTier::ALL
            .into_iter()
            .map(|tier| policy.limits(tier).max_extensions)
            .collect();
        assert_eq!(extensions, vec![Some(0), Some(2), Some(5), Some(99), None]);
    }

    #[test]
    fn test_with_limits_override() {
        let policy = StaticTierPolicy::new().with_limits(
            SubscriptionTier::Basic,
            TierLimits {
                supports_hibernate: true,
                ..StaticTierPolicy::new().limits(SubscriptionTier::Basic)
            },
        );
        assert_eq!(
            policy.required_tier(Capability::Hibernate),
            Some(SubscriptionTier::Basic)
        );
    }
}
