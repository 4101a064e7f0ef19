// ============================================================================
// Lifecycle Controller
// ============================================================================
//
// Entry point for every container command. Each container lives in its own
// entry behind an async mutex, so commands and timer firings on one container
// are serialized while distinct containers proceed in parallel. The outer map
// lock is only held to look up, insert or remove an entry, never across store
// I/O.
//
// Mutations are computed on a clone of the record, persisted, and only then
// swapped in; a rejected or failed command leaves no trace. Timers are
// reconciled against the committed record in the same critical section.
//
// ============================================================================

use crate::activity::ActivityTracker;
use crate::config::EngineConfig;
use crate::core::clock::{between, deadline, to_chrono};
use crate::core::{
    ContainerId, IdleAction, LifecycleError, LifecycleState, Result, RuntimeClock, SharedClock,
    SubscriptionTier,
};
use crate::lifecycle::{
    Admission, HeartbeatResponse, HibernationAction, HibernationResponse, KeepAliveResponse,
    LifecycleCommand, LifecycleConfig, LifecycleEvent, LifecycleRecord, LifecycleStatus,
    TimeoutExtensionResponse, TransitionGuards, TransitionRecord,
};
use crate::policy::{Capability, SharedTierPolicy, StaticTierPolicy, TierLimits, TierPolicy, require_capability};
use crate::scheduler::{TimeoutScheduler, TimerFired, TimerHandle, TimerKind};
use crate::storage::{FileLifecycleStore, InMemoryLifecycleStore, LifecycleStore};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, Level, event, info_span};

/// Delay before a timer whose transition could not be applied tries again.
const TIMER_RETRY: Duration = Duration::from_secs(60);

struct ContainerEntry {
    record: LifecycleRecord,
    idle_timer: Option<TimerHandle>,
    max_duration_timer: Option<TimerHandle>,
    removed: bool,
}

/// What a command closure may consult while it edits the record copy.
struct CommandContext<'a> {
    now: DateTime<Utc>,
    limits: TierLimits,
    policy: &'a dyn TierPolicy,
    engine: &'a EngineConfig,
}

struct ControllerInner {
    policy: SharedTierPolicy,
    store: Arc<dyn LifecycleStore>,
    scheduler: TimeoutScheduler,
    activity: ActivityTracker,
    config: EngineConfig,
    containers: RwLock<HashMap<ContainerId, Arc<Mutex<ContainerEntry>>>>,
}

/// Builder for [`LifecycleController`]. Defaults: global tier table, in-memory
/// store, runtime clock.
pub struct LifecycleControllerBuilder {
    policy: Option<SharedTierPolicy>,
    store: Option<Arc<dyn LifecycleStore>>,
    clock: Option<SharedClock>,
    config: EngineConfig,
}

impl LifecycleControllerBuilder {
    pub fn policy(mut self, policy: SharedTierPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn store(mut self, store: Arc<dyn LifecycleStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the controller and starts its timer dispatcher.
    ///
    /// Must be called from within a tokio runtime. Without an explicit store,
    /// `config.store_dir` selects a file store and otherwise records stay in memory.
    pub fn build(self) -> Result<LifecycleController> {
        self.config.validate()?;
        let store: Arc<dyn LifecycleStore> = match (self.store, &self.config.store_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileLifecycleStore::open(dir)?),
            (None, None) => Arc::new(InMemoryLifecycleStore::new()),
        };
        let policy: SharedTierPolicy = match self.policy {
            Some(policy) => policy,
            None => StaticTierPolicy::global(),
        };
        let clock: SharedClock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(RuntimeClock::new()),
        };
        let (scheduler, fired_rx) = TimeoutScheduler::new(clock);

        let inner = Arc::new(ControllerInner {
            policy,
            store,
            scheduler,
            activity: ActivityTracker::new(),
            config: self.config,
            containers: RwLock::new(HashMap::new()),
        });
        let dispatcher = spawn_timer_dispatcher(Arc::downgrade(&inner), fired_rx);
        Ok(LifecycleController { inner, dispatcher })
    }
}

/// Background task that turns timer firings into serialized container commands.
struct TimerDispatcher {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TimerDispatcher {
    async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| LifecycleError::LockError(format!("timer dispatcher join: {}", err)))?;
        }
        Ok(())
    }
}

impl Drop for TimerDispatcher {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

fn spawn_timer_dispatcher(
    inner: Weak<ControllerInner>,
    mut fired_rx: mpsc::UnboundedReceiver<TimerFired>,
) -> TimerDispatcher {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                fired = fired_rx.recv() => {
                    let Some(fired) = fired else { break };
                    let Some(inner) = inner.upgrade() else { break };
                    inner.handle_timer(fired).await;
                }
            }
        }
    });
    TimerDispatcher {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

/// Tracks and drives the lifecycle of every container.
pub struct LifecycleController {
    inner: Arc<ControllerInner>,
    dispatcher: TimerDispatcher,
}

impl LifecycleController {
    pub fn builder() -> LifecycleControllerBuilder {
        LifecycleControllerBuilder {
            policy: None,
            store: None,
            clock: None,
            config: EngineConfig::default(),
        }
    }

    /// In-memory controller with the default tier table.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Builds a controller from `config` and reloads any stored containers.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let controller = Self::builder().config(config).build()?;
        controller.recover().await?;
        Ok(controller)
    }

    /// Stops the timer dispatcher. Armed timers are discarded with the controller.
    pub async fn shutdown(self) -> Result<()> {
        let LifecycleController { inner, dispatcher } = self;
        dispatcher.stop().await?;
        drop(inner);
        Ok(())
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn tier_limits(&self, tier: SubscriptionTier) -> TierLimits {
        self.inner.policy.limits(tier)
    }

    /// Registers a new container in STARTING and arms its lifetime cap.
    pub async fn provision(
        &self,
        container_id: ContainerId,
        tier: SubscriptionTier,
        config: Option<LifecycleConfig>,
    ) -> Result<LifecycleStatus> {
        let span = info_span!("lifecycle.provision", container_id = %container_id, tier = %tier);
        self.inner
            .provision(container_id, tier, config)
            .instrument(span)
            .await
    }

    /// Provisioning finished: STARTING → RUNNING, idle timer armed.
    pub async fn mark_running(&self, container_id: &ContainerId) -> Result<LifecycleStatus> {
        self.inner
            .mutate(container_id, "mark_running", |record, ctx| {
                let id = record.container_id.clone();
                record.machine.apply(
                    &id,
                    LifecycleEvent::ProvisioningComplete,
                    TransitionGuards::default(),
                    ctx.now,
                )?;
                record.touch(ctx.now);
                Ok(LifecycleStatus::capture(record, &ctx.limits, ctx.now))
            })
            .await
    }

    /// Resets the idle clock.
    pub async fn heartbeat(&self, container_id: &ContainerId) -> Result<HeartbeatResponse> {
        self.inner
            .mutate(container_id, "heartbeat", |record, ctx| {
                let woke = admit(record, LifecycleCommand::Heartbeat, ctx.now)?;
                record.touch(ctx.now);
                let message = if woke {
                    "Container resumed from hibernation; heartbeat received"
                } else if record.keep_alive_enabled {
                    "Heartbeat received; keep-alive is enabled"
                } else {
                    "Heartbeat received; idle timeout reset"
                };
                Ok(HeartbeatResponse {
                    container_id: record.container_id.clone(),
                    status: record.state(),
                    last_heartbeat: ctx.now,
                    idle_timeout_seconds: record.idle_timeout().as_secs(),
                    next_timeout_at: record.pending_timeout_at(),
                    message: message.to_string(),
                })
            })
            .await
    }

    /// Any other API call that touches the container (exec, file access).
    pub async fn touch(&self, container_id: &ContainerId) -> Result<LifecycleStatus> {
        self.inner
            .mutate(container_id, "touch", |record, ctx| {
                admit(record, LifecycleCommand::Touch, ctx.now)?;
                record.touch(ctx.now);
                Ok(LifecycleStatus::capture(record, &ctx.limits, ctx.now))
            })
            .await
    }

    /// Activity seen on a preview connection. Returns whether it counted.
    ///
    /// Preview traffic never wakes a container and only counts while RUNNING
    /// with `keep_alive_on_preview` set.
    pub async fn record_preview_activity(&self, container_id: &ContainerId) -> Result<bool> {
        self.inner
            .mutate(container_id, "preview_activity", |record, ctx| {
                match record.state() {
                    LifecycleState::Stopped => {
                        Err(LifecycleError::ContainerNotRunning(record.container_id.clone()))
                    }
                    LifecycleState::Running if record.config.keep_alive_on_preview => {
                        record.touch(ctx.now);
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            })
            .await
    }

    /// Pushes the idle deadline out by `minutes`, clamped to what the tier allows.
    ///
    /// # Errors
    /// `TierLimitExceeded` when the extension count is exhausted or the idle
    /// window is already at the tier maximum.
    pub async fn extend_timeout(
        &self,
        container_id: &ContainerId,
        minutes: u32,
    ) -> Result<TimeoutExtensionResponse> {
        self.inner
            .mutate(container_id, "extend_timeout", move |record, ctx| {
                require_capability(ctx.policy, record.owner_tier, Capability::Extensions)?;
                admit(record, LifecycleCommand::ExtendTimeout, ctx.now)?;
                if record.keep_alive_enabled {
                    return Err(LifecycleError::invalid_state(
                        &record.container_id,
                        record.state(),
                        "keep-alive containers have no idle timeout",
                    ));
                }
                if !ctx.limits.allows_extension(record.extensions_used) {
                    return Err(LifecycleError::tier_limit(
                        record.owner_tier,
                        "extend_timeout",
                        format!(
                            "{} of {} extensions used",
                            record.extensions_used,
                            ctx.limits.max_extensions.unwrap_or_default()
                        ),
                    ));
                }

                record.touch(ctx.now);
                let current = record.timeout_at().unwrap_or(ctx.now);
                let ceiling = ctx.engine.extension_ceiling_minutes;
                let max_allowed = match ctx.limits.max_idle_timeout {
                    Some(window) => {
                        let room = window.saturating_sub(between(ctx.now, current));
                        ceiling.min(u32::try_from(room.as_secs() / 60).unwrap_or(u32::MAX))
                    }
                    None => ceiling,
                };
                if max_allowed == 0 {
                    return Err(LifecycleError::tier_limit(
                        record.owner_tier,
                        "extend_timeout",
                        format!(
                            "idle window already at the {} minute tier maximum",
                            ctx.limits.max_idle_timeout_minutes().unwrap_or_default()
                        ),
                    ));
                }

                let added = minutes.clamp(1, max_allowed);
                let new_timeout_at = current + chrono::Duration::minutes(i64::from(added));
                record.extended_until = Some(new_timeout_at);
                record.extensions_used += 1;

                let extensions_remaining = ctx.limits.extensions_remaining(record.extensions_used);
                Ok(TimeoutExtensionResponse {
                    container_id: record.container_id.clone(),
                    new_timeout_at,
                    added_minutes: added,
                    max_allowed_minutes: max_allowed,
                    extensions_used: record.extensions_used,
                    extensions_remaining,
                    message: if added < minutes {
                        format!("Timeout extended by {} minutes (requested {})", added, minutes)
                    } else {
                        format!("Timeout extended by {} minutes", added)
                    },
                })
            })
            .await
    }

    /// Enabling requires the keep-alive capability; disabling is always allowed
    /// and restarts the idle clock from now.
    pub async fn set_keep_alive(
        &self,
        container_id: &ContainerId,
        enabled: bool,
    ) -> Result<KeepAliveResponse> {
        self.inner
            .mutate(container_id, "set_keep_alive", move |record, ctx| {
                if enabled {
                    require_capability(ctx.policy, record.owner_tier, Capability::KeepAlive)?;
                }
                admit(record, LifecycleCommand::SetKeepAlive, ctx.now)?;
                record.keep_alive_enabled = enabled;
                if !enabled && record.config.idle_action == IdleAction::KeepAlive {
                    record.config.idle_action = IdleAction::Shutdown;
                }
                record.touch(ctx.now);
                Ok(KeepAliveResponse {
                    container_id: record.container_id.clone(),
                    keep_alive_enabled: enabled,
                    requires_tier: ctx.policy.required_tier(Capability::KeepAlive),
                    user_tier: record.owner_tier,
                    is_authorized: ctx.limits.supports_keep_alive,
                    message: if enabled {
                        "Keep-alive enabled; container will not idle out".to_string()
                    } else {
                        format!(
                            "Keep-alive disabled; idle timeout of {} minutes applies",
                            record.config.idle_timeout_minutes
                        )
                    },
                })
            })
            .await
    }

    /// RUNNING → HIBERNATING. The tier gate is checked before the state.
    pub async fn hibernate(&self, container_id: &ContainerId) -> Result<HibernationResponse> {
        self.inner
            .mutate(container_id, "hibernate", |record, ctx| {
                require_capability(ctx.policy, record.owner_tier, Capability::Hibernate)?;
                admit(record, LifecycleCommand::Hibernate, ctx.now)?;
                let id = record.container_id.clone();
                let guards = record.guards(&ctx.limits);
                record
                    .machine
                    .apply(&id, LifecycleEvent::HibernateRequested, guards, ctx.now)?;
                Ok(HibernationResponse {
                    container_id: id,
                    status: record.state(),
                    action: HibernationAction::Hibernate,
                    estimated_resume_seconds: Some(ctx.engine.estimated_resume_seconds),
                    message: "Container hibernated; state preserved".to_string(),
                })
            })
            .await
    }

    /// HIBERNATING → WAKING → RUNNING with a fresh idle window.
    pub async fn wake(&self, container_id: &ContainerId) -> Result<HibernationResponse> {
        self.inner
            .mutate(container_id, "wake", |record, ctx| {
                admit(record, LifecycleCommand::Wake, ctx.now)?;
                let id = record.container_id.clone();
                record.machine.wake(&id, ctx.now)?;
                resume_activity(record, ctx.now);
                Ok(HibernationResponse {
                    container_id: id,
                    status: record.state(),
                    action: HibernationAction::Wake,
                    estimated_resume_seconds: None,
                    message: "Container resumed".to_string(),
                })
            })
            .await
    }

    /// Replaces the container's configuration after validating all of it.
    ///
    /// The lifetime cap may be shortened but never lifted or lengthened; a
    /// config without `max_duration_hours` keeps the current cap.
    pub async fn configure(
        &self,
        container_id: &ContainerId,
        config: LifecycleConfig,
    ) -> Result<LifecycleStatus> {
        self.inner
            .mutate(container_id, "configure", move |record, ctx| {
                admit(record, LifecycleCommand::Configure, ctx.now)?;
                config.validate(record.owner_tier, &ctx.limits)?;

                // the lifetime cap fixed at provisioning can only be shortened
                let mut config = config;
                let max_duration = match config.max_duration() {
                    None => {
                        config.max_duration_hours = record.config.max_duration_hours;
                        record.max_duration
                    }
                    Some(requested) => {
                        if let Some(current) = record.max_duration {
                            if requested > current {
                                return Err(LifecycleError::InvalidConfig(format!(
                                    "max_duration cannot be raised above the current {} hour cap",
                                    current.as_secs() / 3600
                                )));
                            }
                        }
                        Some(requested)
                    }
                };
                if max_duration != record.max_duration {
                    if let Some(limit) = max_duration {
                        if deadline(record.created_at, limit) <= ctx.now {
                            return Err(LifecycleError::InvalidConfig(format!(
                                "max_duration of {} hours has already elapsed",
                                limit.as_secs() / 3600
                            )));
                        }
                    }
                    record.max_duration = max_duration;
                }

                if config.idle_action == IdleAction::KeepAlive {
                    record.keep_alive_enabled = true;
                } else if record.config.idle_action == IdleAction::KeepAlive {
                    record.keep_alive_enabled = false;
                }
                record.config = config;
                record.touch(ctx.now);
                Ok(LifecycleStatus::capture(record, &ctx.limits, ctx.now))
            })
            .await
    }

    pub async fn get_status(&self, container_id: &ContainerId) -> Result<LifecycleStatus> {
        self.inner
            .read(container_id, |record, limits, now| {
                LifecycleStatus::capture(record, limits, now)
            })
            .await
    }

    pub async fn get_config(&self, container_id: &ContainerId) -> Result<LifecycleConfig> {
        self.inner
            .read(container_id, |record, _, _| record.config.clone())
            .await
    }

    /// Recorded transitions, oldest first.
    pub async fn history(&self, container_id: &ContainerId) -> Result<Vec<TransitionRecord>> {
        self.inner
            .read(container_id, |record, _, _| {
                record.machine.history().cloned().collect()
            })
            .await
    }

    pub async fn idle_for(&self, container_id: &ContainerId) -> Result<Duration> {
        let now = self.inner.scheduler.now();
        match self.inner.activity.idle_for(container_id, now)? {
            Some(idle) => Ok(idle),
            None => Err(LifecycleError::ContainerNotFound(container_id.clone())),
        }
    }

    pub async fn container_ids(&self) -> Vec<ContainerId> {
        let mut ids: Vec<_> = self.inner.containers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Permanently deletes the container and cancels both of its timers.
    pub async fn remove(&self, container_id: &ContainerId) -> Result<()> {
        let span = info_span!("lifecycle.remove", container_id = %container_id);
        self.inner.remove(container_id).instrument(span).await
    }

    /// Loads every stored record not yet tracked and re-arms its timers.
    /// Overdue timers fire immediately. Returns the number of containers loaded.
    pub async fn recover(&self) -> Result<usize> {
        let span = info_span!("lifecycle.recover");
        self.inner.recover().instrument(span).await
    }
}

/// Runs the admission check, performing the auto-wake if one is due.
/// Returns whether the container was woken.
fn admit(record: &mut LifecycleRecord, command: LifecycleCommand, now: DateTime<Utc>) -> Result<bool> {
    let id = record.container_id.clone();
    match record.machine.admit(&id, command, record.config.auto_wake)? {
        Admission::Proceed => Ok(false),
        Admission::WakeFirst => {
            record.machine.auto_wake(&id, now)?;
            resume_activity(record, now);
            event!(Level::INFO, "container auto-woken");
            Ok(true)
        }
    }
}

/// A resumed container starts a fresh idle window; earlier extensions lapse.
fn resume_activity(record: &mut LifecycleRecord, now: DateTime<Utc>) {
    record.touch(now);
    record.extended_until = None;
}

impl ControllerInner {
    async fn lookup(&self, container_id: &ContainerId) -> Result<Arc<Mutex<ContainerEntry>>> {
        self.containers
            .read()
            .await
            .get(container_id)
            .cloned()
            .ok_or_else(|| LifecycleError::ContainerNotFound(container_id.clone()))
    }

    async fn read<T, F>(&self, container_id: &ContainerId, view: F) -> Result<T>
    where
        F: FnOnce(&LifecycleRecord, &TierLimits, DateTime<Utc>) -> T,
    {
        let entry = self.lookup(container_id).await?;
        let entry = entry.lock().await;
        if entry.removed {
            return Err(LifecycleError::ContainerNotFound(container_id.clone()));
        }
        let limits = self.policy.limits(entry.record.owner_tier);
        Ok(view(&entry.record, &limits, self.scheduler.now()))
    }

    async fn mutate<T, F>(&self, container_id: &ContainerId, command: &'static str, op: F) -> Result<T>
    where
        T: Send,
        F: FnOnce(&mut LifecycleRecord, &CommandContext<'_>) -> Result<T> + Send,
    {
        let span = info_span!("lifecycle.command", command, container_id = %container_id);
        async move {
            let entry = self.lookup(container_id).await?;
            let mut entry = entry.lock().await;
            if entry.removed {
                return Err(LifecycleError::ContainerNotFound(container_id.clone()));
            }

            let ctx = CommandContext {
                now: self.scheduler.now(),
                limits: self.policy.limits(entry.record.owner_tier),
                policy: &*self.policy,
                engine: &self.config,
            };
            let mut next = entry.record.clone();
            let from = next.state();
            let output = match op(&mut next, &ctx) {
                Ok(output) => output,
                Err(err) => {
                    event!(Level::DEBUG, error = %err, "command rejected");
                    return Err(err);
                }
            };

            if let Err(err) = self.store.save(container_id, &next).await {
                event!(Level::ERROR, error = %err, "lifecycle record save failed");
                return Err(err);
            }
            self.note_activity(&next);
            let to = next.state();
            entry.record = next;
            self.sync_timers(&mut entry);

            if from != to {
                event!(Level::INFO, from = %from, to = %to, "container transitioned");
            } else {
                event!(Level::DEBUG, state = %to, "command applied");
            }
            Ok(output)
        }
        .instrument(span)
        .await
    }

    async fn provision(
        &self,
        container_id: ContainerId,
        tier: SubscriptionTier,
        config: Option<LifecycleConfig>,
    ) -> Result<LifecycleStatus> {
        let limits = self.policy.limits(tier);
        let config = match config {
            Some(config) => config,
            None => {
                let mut minutes = self.config.default_idle_timeout_minutes;
                if let Some(max) = limits.max_idle_timeout_minutes() {
                    minutes = minutes.min(u32::try_from(max).unwrap_or(u32::MAX));
                }
                LifecycleConfig::default().idle_timeout_minutes(minutes)
            }
        };
        config.validate(tier, &limits)?;

        let now = self.scheduler.now();
        let record = LifecycleRecord::new(
            container_id.clone(),
            tier,
            config,
            &limits,
            self.config.history_limit,
            now,
        );
        let Some((entry, mut guard)) = self.reserve(&container_id, record).await else {
            return Err(LifecycleError::ContainerExists(container_id));
        };

        if let Err(err) = self.store.save(&container_id, &guard.record).await {
            guard.removed = true;
            drop(guard);
            self.release(&container_id, &entry).await;
            return Err(err);
        }
        self.note_activity(&guard.record);
        let status = LifecycleStatus::capture(&guard.record, &limits, now);
        self.sync_timers(&mut guard);
        event!(Level::INFO, "container provisioned");
        Ok(status)
    }

    /// Claims `container_id` with an entry that stays locked until the caller
    /// has persisted it. `None` if the id is taken.
    async fn reserve(
        &self,
        container_id: &ContainerId,
        record: LifecycleRecord,
    ) -> Option<(Arc<Mutex<ContainerEntry>>, OwnedMutexGuard<ContainerEntry>)> {
        let entry = Arc::new(Mutex::new(ContainerEntry {
            record,
            idle_timer: None,
            max_duration_timer: None,
            removed: false,
        }));
        let guard = Arc::clone(&entry).lock_owned().await;
        let mut containers = self.containers.write().await;
        if containers.contains_key(container_id) {
            return None;
        }
        containers.insert(container_id.clone(), Arc::clone(&entry));
        Some((entry, guard))
    }

    /// Drops the map slot for `container_id` if it still holds `entry`.
    async fn release(&self, container_id: &ContainerId, entry: &Arc<Mutex<ContainerEntry>>) {
        let mut containers = self.containers.write().await;
        if containers
            .get(container_id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            containers.remove(container_id);
        }
    }

    async fn remove(&self, container_id: &ContainerId) -> Result<()> {
        let entry = self.lookup(container_id).await?;
        let mut guard = entry.lock().await;
        if guard.removed {
            return Err(LifecycleError::ContainerNotFound(container_id.clone()));
        }

        self.store.delete(container_id).await?;
        guard.removed = true;
        guard.idle_timer = None;
        guard.max_duration_timer = None;
        if let Err(err) = self.activity.forget(container_id) {
            event!(Level::WARN, error = %err, "activity entry not cleared");
        }
        drop(guard);
        self.release(container_id, &entry).await;
        event!(Level::INFO, "container removed");
        Ok(())
    }

    async fn recover(&self) -> Result<usize> {
        let ids = self.store.list().await?;
        let mut loaded = 0;
        for id in ids {
            if self.containers.read().await.contains_key(&id) {
                continue;
            }
            let record = match self.store.load(&id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    event!(Level::WARN, container_id = %id, error = %err, "skipping unreadable record");
                    continue;
                }
            };
            let Some((_, mut guard)) = self.reserve(&id, record).await else {
                continue;
            };
            self.note_activity(&guard.record);
            // deadlines that passed while nothing was running apply right away
            self.expire(&mut guard, TimerKind::MaxDuration).await;
            self.expire(&mut guard, TimerKind::Idle).await;
            loaded += 1;
        }
        event!(Level::INFO, loaded, "containers recovered");
        Ok(loaded)
    }

    fn note_activity(&self, record: &LifecycleRecord) {
        if let Err(err) = self
            .activity
            .record_activity(&record.container_id, record.last_activity_at)
        {
            event!(Level::WARN, error = %err, "activity not recorded");
        }
    }

    /// Brings both timers in line with the committed record. A timer whose
    /// deadline is unchanged keeps running.
    fn sync_timers(&self, entry: &mut ContainerEntry) {
        let stopped = entry.record.state() == LifecycleState::Stopped;
        let idle_deadline = entry.record.pending_timeout_at();
        let max_deadline = if stopped {
            None
        } else {
            entry.record.max_duration_deadline()
        };
        let id = entry.record.container_id.clone();
        self.reconcile(&id, &mut entry.idle_timer, TimerKind::Idle, idle_deadline);
        self.reconcile(
            &id,
            &mut entry.max_duration_timer,
            TimerKind::MaxDuration,
            max_deadline,
        );
    }

    fn reconcile(
        &self,
        container_id: &ContainerId,
        slot: &mut Option<TimerHandle>,
        kind: TimerKind,
        deadline: Option<DateTime<Utc>>,
    ) {
        match deadline {
            None => {
                slot.take();
            }
            Some(at) => {
                if slot.as_ref().map(TimerHandle::deadline) != Some(at) {
                    *slot = Some(self.scheduler.arm(container_id, kind, at));
                }
            }
        }
    }

    fn retry_later(&self, entry: &mut ContainerEntry, kind: TimerKind, now: DateTime<Utc>) {
        let at = now + to_chrono(TIMER_RETRY);
        let handle = self.scheduler.arm(&entry.record.container_id, kind, at);
        match kind {
            TimerKind::Idle => entry.idle_timer = Some(handle),
            TimerKind::MaxDuration => entry.max_duration_timer = Some(handle),
        }
    }

    async fn handle_timer(&self, fired: TimerFired) {
        let span = info_span!(
            "lifecycle.timer",
            container_id = %fired.container_id,
            kind = %fired.kind,
            generation = fired.generation
        );
        self.fire(fired).instrument(span).await
    }

    async fn fire(&self, fired: TimerFired) {
        let Ok(entry) = self.lookup(&fired.container_id).await else {
            event!(Level::DEBUG, "timer for unknown container ignored");
            return;
        };
        let mut entry = entry.lock().await;
        if entry.removed {
            return;
        }

        let slot = match fired.kind {
            TimerKind::Idle => &mut entry.idle_timer,
            TimerKind::MaxDuration => &mut entry.max_duration_timer,
        };
        if !slot.as_ref().is_some_and(|handle| handle.matches(fired.generation)) {
            event!(Level::DEBUG, "superseded timer ignored");
            return;
        }
        slot.take();
        self.expire(&mut *entry, fired.kind).await;
    }

    /// Applies the transition behind a fired timer if its deadline has really
    /// passed; otherwise re-arms. Failed transitions retry later.
    async fn expire(&self, entry: &mut ContainerEntry, kind: TimerKind) {
        let now = self.scheduler.now();
        let record = &entry.record;
        let event = match kind {
            TimerKind::Idle => match record.pending_timeout_at() {
                Some(at) if now >= at => LifecycleEvent::IdleTimeout {
                    action: record.config.idle_action,
                },
                _ => {
                    event!(Level::DEBUG, "idle deadline not reached, re-arming");
                    self.sync_timers(entry);
                    return;
                }
            },
            TimerKind::MaxDuration => match record.max_duration_deadline() {
                Some(at) if now >= at && record.state() != LifecycleState::Stopped => {
                    LifecycleEvent::MaxDurationExceeded
                }
                _ => {
                    self.sync_timers(entry);
                    return;
                }
            },
        };

        let limits = self.policy.limits(record.owner_tier);
        let mut next = record.clone();
        let from = next.state();
        let guards = next.guards(&limits);
        let id = next.container_id.clone();
        if let Err(err) = next.machine.apply(&id, event, guards, now) {
            event!(Level::DEBUG, error = %err, "timer transition skipped");
            self.retry_later(entry, kind, now);
            return;
        }
        if let Err(err) = self.store.save(&id, &next).await {
            event!(Level::ERROR, error = %err, "lifecycle record save failed");
            self.retry_later(entry, kind, now);
            return;
        }

        let to = next.state();
        entry.record = next;
        self.sync_timers(entry);
        event!(Level::INFO, from = %from, to = %to, kind = %kind, "container transitioned by timer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn id(raw: &str) -> ContainerId {
        ContainerId::new(raw).unwrap()
    }

    async fn running(
        controller: &LifecycleController,
        raw: &str,
        tier: SubscriptionTier,
        config: Option<LifecycleConfig>,
    ) -> ContainerId {
        let container_id = id(raw);
        controller
            .provision(container_id.clone(), tier, config)
            .await
            .unwrap();
        controller.mark_running(&container_id).await.unwrap();
        container_id
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_and_mark_running() {
        let controller = LifecycleController::new().unwrap();
        let status = controller
            .provision(id("ctr-new"), SubscriptionTier::Free, None)
            .await
            .unwrap();
        assert_eq!(status.state, LifecycleState::Starting);
        assert_eq!(status.timeout_at, None);

        let status = controller.mark_running(&id("ctr-new")).await.unwrap();
        assert_eq!(status.state, LifecycleState::Running);
        assert_eq!(status.time_remaining_seconds, Some(30 * 60));

        assert!(matches!(
            controller.provision(id("ctr-new"), SubscriptionTier::Free, None).await,
            Err(LifecycleError::ContainerExists(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_starting_container_refuses_heartbeat() {
        let controller = LifecycleController::new().unwrap();
        controller
            .provision(id("ctr-boot"), SubscriptionTier::Pro, None)
            .await
            .unwrap();
        let err = controller.heartbeat(&id("ctr-boot")).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ContainerNotRunning(_)));
        assert!(err.is_invalid_state());
        assert_ok!(
            controller
                .configure(&id("ctr-boot"), LifecycleConfig::development())
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command_leaves_record_untouched() {
        let controller = LifecycleController::new().unwrap();
        let container_id = running(&controller, "ctr-atomic", SubscriptionTier::Basic, None).await;
        let before = controller.get_status(&container_id).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        let config = LifecycleConfig::default()
            .idle_timeout_minutes(45)
            .idle_action(IdleAction::Hibernate);
        assert_err!(controller.configure(&container_id, config).await);

        let after = controller.get_status(&container_id).await.unwrap();
        assert_eq!(after.idle_timeout_minutes, before.idle_timeout_minutes);
        assert_eq!(after.idle_action, IdleAction::Shutdown);
        assert_eq!(after.last_activity_at, before.last_activity_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_container() {
        let controller = LifecycleController::new().unwrap();
        assert!(matches!(
            controller.heartbeat(&id("ctr-missing")).await,
            Err(LifecycleError::ContainerNotFound(_))
        ));
        assert!(matches!(
            controller.idle_for(&id("ctr-missing")).await,
            Err(LifecycleError::ContainerNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels_timers() {
        let controller = LifecycleController::new().unwrap();
        let container_id = running(&controller, "ctr-rm", SubscriptionTier::Free, None).await;
        assert_ok!(controller.remove(&container_id).await);
        assert!(controller.container_ids().await.is_empty());

        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        assert!(matches!(
            controller.get_status(&container_id).await,
            Err(LifecycleError::ContainerNotFound(_))
        ));
        assert_err!(controller.remove(&container_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_dispatcher() {
        let controller = LifecycleController::new().unwrap();
        running(&controller, "ctr-bye", SubscriptionTier::Free, None).await;
        assert_ok!(controller.shutdown().await);
    }
}
