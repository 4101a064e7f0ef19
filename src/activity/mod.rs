use crate::core::clock::between;
use crate::core::{ContainerId, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Last-activity timestamps per container.
///
/// Timestamps only move forward: a late-arriving report older than the stored
/// value is ignored so out-of-order replies cannot rewind the idle clock.
#[derive(Debug, Default)]
pub struct ActivityTracker {
    last_activity: RwLock<HashMap<ContainerId, DateTime<Utc>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records activity at `at`. Returns `false` when `at` is older than the stored value.
    pub fn record_activity(&self, container_id: &ContainerId, at: DateTime<Utc>) -> Result<bool> {
        let mut map = self.last_activity.write()?;
        match map.get_mut(container_id) {
            Some(current) if *current > at => Ok(false),
            Some(current) => {
                *current = at;
                Ok(true)
            }
            None => {
                map.insert(container_id.clone(), at);
                Ok(true)
            }
        }
    }

    pub fn last_activity(&self, container_id: &ContainerId) -> Result<Option<DateTime<Utc>>> {
        Ok(self.last_activity.read()?.get(container_id).copied())
    }

    /// Time since the last recorded activity, `None` for untracked containers.
    pub fn idle_for(&self, container_id: &ContainerId, now: DateTime<Utc>) -> Result<Option<Duration>> {
        Ok(self
            .last_activity(container_id)?
            .map(|last| between(last, now)))
    }

    pub fn forget(&self, container_id: &ContainerId) -> Result<()> {
        self.last_activity.write()?.remove(container_id);
        Ok(())
    }

    pub fn tracked_count(&self) -> Result<usize> {
        Ok(self.last_activity.read()?.len())
    }
}
