// ============================================================================
// Timeout Scheduler
// ============================================================================
//
// Arms one-shot timers that report back over a channel instead of touching
// container state themselves. The receiving side (the controller's dispatcher)
// handles each firing under the container's own lock and re-validates it, so
// a timer that lost a race with a command is simply ignored.
//
// ============================================================================

use crate::core::clock::between;
use crate::core::{ContainerId, SharedClock};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires the configured idle action once `timeout_at` passes.
    Idle,
    /// Hard lifetime cap measured from creation.
    MaxDuration,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKind::Idle => write!(f, "idle"),
            TimerKind::MaxDuration => write!(f, "max_duration"),
        }
    }
}

/// Message sent when a timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub container_id: ContainerId,
    pub kind: TimerKind,
    pub generation: u64,
    pub deadline: DateTime<Utc>,
}

/// Owner of one armed timer. Dropping the handle cancels the timer.
pub struct TimerHandle {
    kind: TimerKind,
    generation: u64,
    deadline: DateTime<Utc>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TimerHandle {
    pub fn kind(&self) -> TimerKind {
        self.kind
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Whether this handle is the one a firing with `generation` came from.
    pub fn matches(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Arms timers against the engine clock.
pub struct TimeoutScheduler {
    clock: SharedClock,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    next_generation: AtomicU64,
}

impl TimeoutScheduler {
    /// Creates the scheduler and the receiving end its timers report to.
    pub fn new(clock: SharedClock) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            clock,
            fired_tx,
            next_generation: AtomicU64::new(1),
        };
        (scheduler, fired_rx)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Arms a timer for `deadline`. A deadline already in the past fires on the next tick.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm(
        &self,
        container_id: &ContainerId,
        kind: TimerKind,
        deadline: DateTime<Utc>,
    ) -> TimerHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let delay = between(self.clock.now(), deadline);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let fired_tx = self.fired_tx.clone();
        let fired = TimerFired {
            container_id: container_id.clone(),
            kind,
            generation,
            deadline,
        };

        tracing::trace!(
            container_id = %container_id,
            kind = %kind,
            generation,
            delay_ms = delay.as_millis() as u64,
            "timer armed"
        );

        let join_handle = tokio::spawn(async move {
            tokio::select! {
                _ = &mut stop_rx => {}
                _ = sleep(delay) => {
                    // receiver gone means the engine shut down
                    let _ = fired_tx.send(fired);
                }
            }
        });

        TimerHandle {
            kind,
            generation,
            deadline,
            stop_tx: Some(stop_tx),
            join_handle: Some(join_handle),
        }
    }
}

impl fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("next_generation", &self.next_generation.load(Ordering::Relaxed))
            .finish()
    }
}
