use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// Source of wall-clock time for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type SharedClock = Arc<dyn Clock>;

/// Wall clock anchored to the tokio timer.
///
/// Readings advance with `tokio::time::Instant`, so timestamps and armed timers
/// agree even when the runtime clock is paused or advanced in tests.
#[derive(Debug, Clone)]
pub struct RuntimeClock {
    wall_origin: DateTime<Utc>,
    instant_origin: Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self {
            wall_origin: Utc::now(),
            instant_origin: Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = self.instant_origin.elapsed();
        match chrono::Duration::from_std(elapsed) {
            Ok(delta) => self.wall_origin + delta,
            Err(_) => Utc::now(),
        }
    }
}

/// Manually driven clock, for deterministic tests of time arithmetic.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Converts a std duration into a chrono delta, saturating on overflow.
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `at + duration`, saturating at the latest representable instant.
pub fn deadline(at: DateTime<Utc>, duration: std::time::Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Non-negative std duration between two instants (zero if `to` precedes `from`).
pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> std::time::Duration {
    (to - from).to_std().unwrap_or_default()
}
