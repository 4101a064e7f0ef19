// ============================================================================
// Lifecycle State Machine
// ============================================================================
//
// Every state change of a container goes through `LifecycleStateMachine::apply`
// and the single transition table in `next_state`, so the bounded history on
// the machine is a complete audit trail. Compound transitions (wake and
// auto-wake) are expressed as two table steps recorded back to back.
//
// ============================================================================

use crate::core::{ContainerId, IdleAction, LifecycleError, LifecycleState, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub const DEFAULT_HISTORY_LIMIT: usize = 32;

/// Inputs that drive the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    ProvisioningComplete,
    IdleTimeout { action: IdleAction },
    HibernateRequested,
    MaxDurationExceeded,
    WakeRequested,
    AutoWake,
    ResumeComplete,
}

/// Facts the guards of the table depend on, evaluated by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionGuards {
    pub keep_alive_enabled: bool,
    pub supports_hibernate: bool,
}

/// External commands, classified for admission checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCommand {
    Heartbeat,
    Touch,
    PreviewActivity,
    ExtendTimeout,
    SetKeepAlive,
    Hibernate,
    Wake,
    Configure,
    Status,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// The container is hibernating with auto-wake on: wake it, then run the command.
    WakeFirst,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub event: LifecycleEvent,
    pub at: DateTime<Utc>,
}

/// The transition table. `Err` carries the reason the event is not accepted.
pub fn next_state(
    from: LifecycleState,
    event: LifecycleEvent,
    guards: TransitionGuards,
) -> std::result::Result<LifecycleState, &'static str> {
    use LifecycleEvent::*;
    use LifecycleState::*;

    match (from, event) {
        (Starting, ProvisioningComplete) => Ok(Running),

        (Running, IdleTimeout { action: IdleAction::Shutdown }) => {
            if guards.keep_alive_enabled {
                Err("keep-alive is enabled")
            } else {
                Ok(Stopped)
            }
        }
        (Running, IdleTimeout { action: IdleAction::Hibernate }) => {
            if guards.keep_alive_enabled {
                Err("keep-alive is enabled")
            } else if !guards.supports_hibernate {
                Err("tier does not support hibernation")
            } else {
                Ok(Hibernating)
            }
        }
        (Running, IdleTimeout { action: IdleAction::KeepAlive }) => {
            Err("keep-alive containers have no idle action")
        }
        (Running, HibernateRequested) => {
            if guards.supports_hibernate {
                Ok(Hibernating)
            } else {
                Err("tier does not support hibernation")
            }
        }

        (Starting | Running | Hibernating | Waking, MaxDurationExceeded) => Ok(Stopped),

        (Hibernating, WakeRequested | AutoWake) => Ok(Waking),
        (Waking, ResumeComplete) => Ok(Running),

        (Stopped, _) => Err("container is stopped"),
        (Hibernating, HibernateRequested) => Err("container is already hibernating"),
        (Running, WakeRequested | AutoWake) => Err("container is already running"),
        (Starting, _) => Err("container is still starting"),
        (Waking, _) => Err("container is waking"),
        (Hibernating, _) => Err("container is hibernating"),
        (Running, _) => Err("container is running"),
    }
}

/// Authoritative lifecycle state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleStateMachine {
    state: LifecycleState,
    state_since: DateTime<Utc>,
    history: VecDeque<TransitionRecord>,
    history_limit: usize,
}

impl LifecycleStateMachine {
    pub fn new(at: DateTime<Utc>, history_limit: usize) -> Self {
        Self {
            state: LifecycleState::Starting,
            state_since: at,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn state_since(&self) -> DateTime<Utc> {
        self.state_since
    }

    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    /// Applies one event, recording the transition.
    ///
    /// # Errors
    /// `ContainerNotRunning` when stopped, `InvalidState` for any other rejected event.
    pub fn apply(
        &mut self,
        container_id: &ContainerId,
        event: LifecycleEvent,
        guards: TransitionGuards,
        at: DateTime<Utc>,
    ) -> Result<LifecycleState> {
        let from = self.state;
        let to = next_state(from, event, guards).map_err(|reason| {
            if from.is_terminal() {
                LifecycleError::ContainerNotRunning(container_id.clone())
            } else {
                LifecycleError::invalid_state(container_id, from, reason)
            }
        })?;

        self.state = to;
        self.state_since = at;
        self.history.push_back(TransitionRecord { from, to, event, at });
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        Ok(to)
    }

    /// HIBERNATING → WAKING → RUNNING as one step, triggered by an explicit wake.
    pub fn wake(&mut self, container_id: &ContainerId, at: DateTime<Utc>) -> Result<()> {
        self.resume(container_id, LifecycleEvent::WakeRequested, at)
    }

    /// HIBERNATING → WAKING → RUNNING as one step, triggered by a command on a hibernating container.
    pub fn auto_wake(&mut self, container_id: &ContainerId, at: DateTime<Utc>) -> Result<()> {
        self.resume(container_id, LifecycleEvent::AutoWake, at)
    }

    fn resume(
        &mut self,
        container_id: &ContainerId,
        trigger: LifecycleEvent,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let guards = TransitionGuards::default();
        self.apply(container_id, trigger, guards, at)?;
        self.apply(container_id, LifecycleEvent::ResumeComplete, guards, at)?;
        Ok(())
    }

    /// Decides whether `command` may run in the current state.
    pub fn admit(
        &self,
        container_id: &ContainerId,
        command: LifecycleCommand,
        auto_wake: bool,
    ) -> Result<Admission> {
        use LifecycleCommand::*;

        if command == Status {
            return Ok(Admission::Proceed);
        }

        match self.state {
            LifecycleState::Stopped => {
                Err(LifecycleError::ContainerNotRunning(container_id.clone()))
            }
            LifecycleState::Hibernating => match command {
                Wake | Configure => Ok(Admission::Proceed),
                Hibernate => Err(LifecycleError::invalid_state(
                    container_id,
                    self.state,
                    "container is already hibernating",
                )),
                _ if auto_wake => Ok(Admission::WakeFirst),
                _ => Err(LifecycleError::ContainerHibernating(container_id.clone())),
            },
            LifecycleState::Starting | LifecycleState::Waking => match command {
                Configure => Ok(Admission::Proceed),
                Hibernate | Wake => Err(LifecycleError::invalid_state(
                    container_id,
                    self.state,
                    "container is not ready",
                )),
                _ => Err(LifecycleError::ContainerNotRunning(container_id.clone())),
            },
            LifecycleState::Running => match command {
                Wake => Err(LifecycleError::invalid_state(
                    container_id,
                    self.state,
                    "container is not hibernating",
                )),
                _ => Ok(Admission::Proceed),
            },
        }
    }
}
