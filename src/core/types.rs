use super::{LifecycleError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref CONTAINER_ID_PATTERN: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,127}$").expect("container id pattern");
}

/// Opaque container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if !CONTAINER_ID_PATTERN.is_match(&raw) {
            return Err(LifecycleError::InvalidConfig(format!(
                "container id '{}' must match {}",
                raw,
                CONTAINER_ID_PATTERN.as_str()
            )));
        }
        Ok(Self(raw))
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(format!("ctr-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContainerId {
    type Error = LifecycleError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl FromStr for ContainerId {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subscription level gating lifecycle features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionTier {
    Free,
    Basic,
    Pro,
    Ultimate,
    Enterprise,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 5] = [
        SubscriptionTier::Free,
        SubscriptionTier::Basic,
        SubscriptionTier::Pro,
        SubscriptionTier::Ultimate,
        SubscriptionTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "FREE",
            SubscriptionTier::Basic => "BASIC",
            SubscriptionTier::Pro => "PRO",
            SubscriptionTier::Ultimate => "ULTIMATE",
            SubscriptionTier::Enterprise => "ENTERPRISE",
        }
    }
}

impl FromStr for SubscriptionTier {
    type Err = LifecycleError;

    /// Unknown names are rejected; a silent default could grant capabilities.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "FREE" => Ok(SubscriptionTier::Free),
            "BASIC" => Ok(SubscriptionTier::Basic),
            "PRO" => Ok(SubscriptionTier::Pro),
            "ULTIMATE" => Ok(SubscriptionTier::Ultimate),
            "ENTERPRISE" => Ok(SubscriptionTier::Enterprise),
            _ => Err(LifecycleError::InvalidTier(s.to_string())),
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action taken when a container's idle timeout elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IdleAction {
    /// Stop the container completely.
    #[default]
    Shutdown,
    /// Suspend the container, preserving memory and disk.
    Hibernate,
    /// Never act on idleness.
    KeepAlive,
}

impl IdleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdleAction::Shutdown => "shutdown",
            IdleAction::Hibernate => "hibernate",
            IdleAction::KeepAlive => "keep_alive",
        }
    }
}

impl FromStr for IdleAction {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "shutdown" => Ok(IdleAction::Shutdown),
            "hibernate" => Ok(IdleAction::Hibernate),
            "keep_alive" => Ok(IdleAction::KeepAlive),
            other => Err(LifecycleError::InvalidConfig(format!(
                "unknown idle action '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for IdleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a container.
///
/// ```text
/// Starting ──ready──> Running ──idle/hibernate──> Hibernating ──wake──> Waking ──resumed──> Running
///                        │
///                        └──idle(shutdown)/max duration──> Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Running,
    Hibernating,
    Waking,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Hibernating => "hibernating",
            LifecycleState::Waking => "waking",
            LifecycleState::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
