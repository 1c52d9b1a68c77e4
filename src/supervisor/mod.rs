//! Error supervisor.
//!
//! The [`ErrorHandler`] watches module failures reported on the bus and
//! decides, per failure, whether to ignore it, record it, schedule a bounded
//! recovery, or disable the module. It also detects death spirals (modules
//! that keep failing or restarting) and suspends all automatic recovery for a
//! cool-down window when one is found.
//!
//! Shutdown is idempotent: the first trigger (signal, error burst or stack
//! emergency) starts one shared shutdown future and every later caller gets
//! the same future back.
//!
//! State is kept under a single lock that is never held across an await or
//! an emission. Lifecycle work on one module (recovery, disable, re-enable,
//! shutdown) is serialized through a per-module async lock, and whoever takes
//! it re-checks the module's state before touching it.

pub mod health;
pub mod policy;
pub mod shutdown;
pub mod signals;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::eventbus::correlation::WAITER_PREFIX;
use crate::eventbus::{topics, BreakerState, EmitOutcome, EventBus, SubscriptionId};
use crate::kernel::{ModuleRegistry, ModuleStatus};
use crate::scheduler::UnifiedScheduler;
use crate::types::{Error, ErrorKind, Result, ShutdownId};

pub use health::{
    EmergencyInfo, HealthReport, HealthStatus, ModuleHealthSnapshot, SupervisorCounters,
    SupervisorStatus,
};
pub use policy::{
    backoff_delay, DeathSpiralConfig, DisableReason, ErrorDisposition, ErrorHandlerConfig,
    IgnoreReason, ModuleFault,
};
pub use shutdown::{process_exit_hook, ExitHook, SharedShutdown, ShutdownReport, FORCED_EXIT_CODE};

use policy::{ModuleHealth, PendingTimer};

/// Module id the supervisor subscribes and emits under.
pub const SUPERVISOR_ID: &str = "supervisor";

/// What `handle_process_error` did with a process-level error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessErrorOutcome {
    /// Shutdown already in progress.
    Ignored,
    /// Counted; no registered module to route to.
    Counted,
    /// Routed to the module's error handling.
    Routed(ErrorDisposition),
    /// The error completed a burst and shutdown was triggered.
    ShutdownTriggered,
}

#[derive(Debug)]
struct EmergencyState {
    trigger: String,
    until: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct SupervisorState {
    modules: HashMap<String, ModuleHealth>,
    emergency: Option<EmergencyState>,
    emergency_generation: u64,
    process_errors: VecDeque<Instant>,
    counters: SupervisorCounters,
}

enum Decision {
    Ignore(IgnoreReason),
    Log,
    Pending,
    Disable(DisableReason),
    DeathSpiral { errors: u32, restarts: usize },
    Schedule { attempt: u32, delay: Duration, timer_id: u64, token: CancellationToken },
}

/// Supervises module failures, recovery and shutdown.
pub struct ErrorHandler {
    config: ErrorHandlerConfig,
    registry: Arc<ModuleRegistry>,
    bus: Arc<EventBus>,
    scheduler: RwLock<Option<Arc<UnifiedScheduler>>>,
    exit_hook: RwLock<ExitHook>,
    state: Mutex<SupervisorState>,
    shutting_down: AtomicBool,
    shutdown: Mutex<Option<SharedShutdown>>,
    shutdown_tx: watch::Sender<Option<String>>,
    panics: Arc<AtomicU64>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    lifecycle: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("config", &self.config)
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ErrorHandler {
    pub fn new(config: ErrorHandlerConfig, registry: Arc<ModuleRegistry>, bus: Arc<EventBus>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(None);
        Arc::new(Self {
            config,
            registry,
            bus,
            scheduler: RwLock::new(None),
            exit_hook: RwLock::new(process_exit_hook()),
            state: Mutex::new(SupervisorState::default()),
            shutting_down: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            shutdown_tx,
            panics: Arc::new(AtomicU64::new(0)),
            subscriptions: Mutex::new(Vec::new()),
            lifecycle: Mutex::new(HashMap::new()),
        })
    }

    /// Scheduler stopped during shutdown.
    pub fn attach_scheduler(&self, scheduler: Arc<UnifiedScheduler>) {
        *self.scheduler.write() = Some(scheduler);
    }

    /// Replace the hook invoked when shutdown exceeds its timeout.
    pub fn set_exit_hook(&self, hook: ExitHook) {
        *self.exit_hook.write() = hook;
    }

    pub fn config(&self) -> &ErrorHandlerConfig {
        &self.config
    }

    /// Subscribe to `module:error`, `eventbus:error` and
    /// `protection:emergency_shutdown`. Calling it again is a no-op.
    pub fn initialize(self: &Arc<Self>) {
        let mut subscriptions = self.subscriptions.lock();
        if !subscriptions.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        subscriptions.push(self.bus.subscribe(SUPERVISOR_ID, topics::MODULE_ERROR, move |_, event| {
            if let (Some(this), Some(module_id)) = (weak.upgrade(), event.str_field("moduleId")) {
                let fault = ModuleFault::from_payload(&event.payload);
                this.handle_module_error(module_id, &fault);
            }
            Ok(())
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(self.bus.subscribe(SUPERVISOR_ID, topics::EVENTBUS_ERROR, move |_, event| {
            let Some(this) = weak.upgrade() else {
                return Ok(());
            };
            let module_id = event.str_field("moduleId");
            if module_id.is_some_and(|id| id == SUPERVISOR_ID || id.starts_with(WAITER_PREFIX)) {
                return Ok(());
            }
            let fault = ModuleFault::from_payload(&event.payload);
            this.handle_handler_error(module_id, &fault);
            Ok(())
        }));

        let weak = Arc::downgrade(self);
        subscriptions.push(self.bus.subscribe(SUPERVISOR_ID, topics::EMERGENCY_SHUTDOWN, move |_, event| {
            if let Some(this) = weak.upgrade() {
                let depth = event.payload.get("depth").and_then(|d| d.as_u64()).unwrap_or(0);
                tracing::error!("stack_emergency_shutdown: depth={}", depth);
                drop(this.shutdown(format!("stack depth emergency at depth {depth}")));
            }
            Ok(())
        }));

        tracing::info!("error_handler_initialized");
    }

    // =========================================================================
    // Module errors
    // =========================================================================

    /// Decide what to do about a failure in `module_id`.
    pub fn handle_module_error(self: &Arc<Self>, module_id: &str, fault: &ModuleFault) -> ErrorDisposition {
        let now = Instant::now();
        let decision = if self.is_shutting_down() {
            Decision::Ignore(IgnoreReason::ShuttingDown)
        } else {
            let mut state = self.state.lock();
            let decision = self.decide(&mut state, module_id, fault, now);
            match &decision {
                Decision::Ignore(_) => state.counters.errors_ignored += 1,
                Decision::Schedule { .. } => {
                    state.counters.errors_handled += 1;
                    state.counters.recoveries_scheduled += 1;
                }
                _ => state.counters.errors_handled += 1,
            }
            decision
        };

        match decision {
            Decision::Ignore(reason) => {
                tracing::debug!("module_error_ignored: module={}, reason={:?}, error={}", module_id, reason, fault);
                ErrorDisposition::Ignored(reason)
            }
            Decision::Log => {
                tracing::warn!("module_error_not_recoverable: module={}, error={}", module_id, fault);
                ErrorDisposition::Logged
            }
            Decision::Pending => {
                tracing::debug!("module_recovery_already_pending: module={}", module_id);
                ErrorDisposition::RecoveryPending
            }
            Decision::Disable(reason) => {
                self.disable_module(module_id, reason.clone());
                ErrorDisposition::Disabled(reason)
            }
            Decision::DeathSpiral { errors, restarts } => {
                self.enter_emergency(module_id, errors, restarts);
                self.disable_module(module_id, DisableReason::DeathSpiral);
                ErrorDisposition::Disabled(DisableReason::DeathSpiral)
            }
            Decision::Schedule {
                attempt,
                delay,
                timer_id,
                token,
            } => {
                tracing::info!(
                    "module_recovery_scheduled: module={}, attempt={}, delay_ms={}",
                    module_id,
                    attempt,
                    delay.as_millis()
                );
                let this = Arc::clone(self);
                let id = module_id.to_string();
                let spawned = self.spawn(
                    "module recovery",
                    this.run_recovery(id, attempt, delay, timer_id, token),
                );
                if !spawned {
                    self.clear_recovery(module_id, timer_id);
                    return ErrorDisposition::Logged;
                }
                ErrorDisposition::RecoveryScheduled { attempt, delay }
            }
        }
    }

    fn decide(&self, state: &mut SupervisorState, module_id: &str, fault: &ModuleFault, now: Instant) -> Decision {
        if state.emergency.as_ref().is_some_and(|e| e.until > now) {
            return Decision::Ignore(IgnoreReason::Emergency);
        }
        let health = state.modules.entry(module_id.to_string()).or_default();
        if health.disabled.is_some() {
            return Decision::Ignore(IgnoreReason::Disabled);
        }

        health.error_count += 1;
        health.last_error = Some(fault.clone());

        if health.in_death_spiral(&self.config.death_spiral, now) {
            return Decision::DeathSpiral {
                errors: health.error_count,
                restarts: health.restarts_within(self.config.death_spiral.window, now),
            };
        }
        if !self.config.is_recoverable(fault.kind) {
            return Decision::Log;
        }
        if health.pending_recovery.is_some() {
            return Decision::Pending;
        }
        if health.restart_attempts >= self.config.max_retries {
            return Decision::Disable(DisableReason::RetriesExhausted);
        }
        if health.restarts_last_hour(now) >= self.config.max_restarts_per_hour {
            return Decision::Disable(DisableReason::HourlyQuota);
        }
        if health.restarts_last_day(now) >= self.config.max_restarts_per_day {
            return Decision::Disable(DisableReason::DailyQuota);
        }

        let attempt = health.restart_attempts + 1;
        health.restart_attempts = attempt;
        let delay = self.config.backoff(attempt);
        let timer = PendingTimer::new(delay);
        let decision = Decision::Schedule {
            attempt,
            delay,
            timer_id: timer.id,
            token: timer.token.clone(),
        };
        health.pending_recovery = Some(timer);
        decision
    }

    async fn run_recovery(
        self: Arc<Self>,
        module_id: String,
        attempt: u32,
        delay: Duration,
        timer_id: u64,
        token: CancellationToken,
    ) {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let proceed = {
            let now = Instant::now();
            let mut state = self.state.lock();
            let emergency = state.emergency.as_ref().is_some_and(|e| e.until > now);
            let shutting_down = self.is_shutting_down();
            match state.modules.get_mut(&module_id) {
                Some(health) if health.pending_recovery.as_ref().map(|t| t.id) == Some(timer_id) => {
                    if emergency || shutting_down || health.disabled.is_some() {
                        health.pending_recovery = None;
                        false
                    } else {
                        health.record_restart(now);
                        true
                    }
                }
                _ => false,
            }
        };
        if !proceed {
            tracing::debug!("module_recovery_abandoned: module={}, attempt={}", module_id, attempt);
            return;
        }

        let lock = self.lifecycle_lock(&module_id);
        let guard = lock.lock().await;
        if self.recovery_superseded(&module_id, timer_id) {
            self.clear_recovery(&module_id, timer_id);
            tracing::debug!("module_recovery_abandoned: module={}, attempt={}", module_id, attempt);
            return;
        }

        tracing::info!("module_recovery_attempt: module={}, attempt={}", module_id, attempt);
        let restarted = self.restart_module(&module_id).await;
        drop(guard);
        match restarted {
            Ok(()) => {
                let superseded = {
                    let mut state = self.state.lock();
                    let superseded = self.is_shutting_down()
                        || state.modules.get(&module_id).is_some_and(|h| h.disabled.is_some());
                    if let Some(health) = state.modules.get_mut(&module_id) {
                        if health.pending_recovery.as_ref().map(|t| t.id) == Some(timer_id) {
                            health.pending_recovery = None;
                        }
                        if !superseded {
                            health.error_count = 0;
                            health.restart_attempts = 0;
                        }
                    }
                    if !superseded {
                        state.counters.recoveries_succeeded += 1;
                    }
                    superseded
                };
                // A disable or shutdown queued behind this restart stops the
                // module once the lifecycle lock is released.
                if superseded {
                    tracing::info!(
                        "module_recovery_superseded: module={}, attempt={}",
                        module_id,
                        attempt
                    );
                    return;
                }
                tracing::info!("module_recovered: module={}, attempt={}", module_id, attempt);
                self.emit(
                    topics::MODULE_RECOVERED,
                    json!({ "moduleId": module_id, "attempt": attempt }),
                );
            }
            Err(err) => {
                self.clear_recovery(&module_id, timer_id);
                self.state.lock().counters.recoveries_failed += 1;
                tracing::warn!(
                    "module_recovery_failed: module={}, attempt={}, error={}",
                    module_id,
                    attempt,
                    err
                );
                self.handle_module_error(&module_id, &ModuleFault::from(&err));
            }
        }
    }

    /// True once the recovery armed as `timer_id` may no longer touch the module.
    fn recovery_superseded(&self, module_id: &str, timer_id: u64) -> bool {
        if self.is_shutting_down() {
            return true;
        }
        let state = self.state.lock();
        match state.modules.get(module_id) {
            Some(health) => {
                health.disabled.is_some()
                    || health.pending_recovery.as_ref().map(|t| t.id) != Some(timer_id)
            }
            None => true,
        }
    }

    fn lifecycle_lock(&self, module_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.lifecycle
                .lock()
                .entry(module_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    async fn restart_module(&self, module_id: &str) -> Result<()> {
        if self.registry.status(module_id) == Some(ModuleStatus::Started) {
            if let Err(err) = self.registry.stop_module(module_id).await {
                tracing::warn!("module_stop_before_restart_failed: module={}, error={}", module_id, err);
            }
        }
        self.registry.init_module(module_id).await?;
        self.registry.start_module(module_id).await
    }

    fn clear_recovery(&self, module_id: &str, timer_id: u64) {
        let mut state = self.state.lock();
        if let Some(health) = state.modules.get_mut(module_id) {
            if health.pending_recovery.as_ref().map(|t| t.id) == Some(timer_id) {
                health.pending_recovery = None;
            }
        }
    }

    /// Emit `module:error` for `module_id`, routing it to this handler.
    pub fn report_error(&self, module_id: &str, err: &Error) -> EmitOutcome {
        self.bus.emit_from(
            module_id,
            topics::MODULE_ERROR,
            json!({ "moduleId": module_id, "kind": err.kind(), "error": err.to_string() }),
        )
    }

    // =========================================================================
    // Disable / re-enable
    // =========================================================================

    /// Disable a module: cancel its pending recovery, stop it, and arm one
    /// re-enable attempt after the cooldown. Returns false if already disabled.
    pub fn disable_module(self: &Arc<Self>, module_id: &str, reason: DisableReason) -> bool {
        let timer = PendingTimer::new(self.config.reenable_cooldown);
        let (timer_id, token) = (timer.id, timer.token.clone());
        {
            let mut state = self.state.lock();
            let health = state.modules.entry(module_id.to_string()).or_default();
            if health.disabled.is_some() {
                return false;
            }
            health.disabled = Some(reason.clone());
            health.cancel_recovery();
            health.cancel_reenable();
            health.pending_reenable = Some(timer);
            state.counters.modules_disabled += 1;
        }

        tracing::error!("module_disabled: module={}, reason={}", module_id, reason);
        self.emit(
            topics::MODULE_DISABLED,
            json!({ "moduleId": module_id, "reason": reason.to_string() }),
        );

        let this = Arc::clone(self);
        let id = module_id.to_string();
        let cooldown = self.config.reenable_cooldown;
        self.spawn("module disable", async move {
            let lock = this.lifecycle_lock(&id);
            let guard = lock.lock().await;
            if this.is_disabled(&id) {
                if let Err(err) = this.registry.stop_module(&id).await {
                    tracing::warn!("disabled_module_stop_failed: module={}, error={}", id, err);
                }
            }
            drop(guard);
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(cooldown) => {}
            }
            this.reenable(&id, timer_id).await;
        });
        true
    }

    async fn reenable(self: &Arc<Self>, module_id: &str, timer_id: u64) {
        let proceed = {
            let mut state = self.state.lock();
            let matched = match state.modules.get_mut(module_id) {
                Some(health) if health.pending_reenable.as_ref().map(|t| t.id) == Some(timer_id) => {
                    health.pending_reenable = None;
                    if self.is_shutting_down() {
                        false
                    } else {
                        health.disabled = None;
                        health.restarts.clear();
                        health.error_count = 0;
                        health.restart_attempts = 0;
                        true
                    }
                }
                _ => false,
            };
            if matched {
                state.counters.modules_reenabled += 1;
            }
            matched
        };
        if !proceed {
            return;
        }

        tracing::info!("module_reenabled: module={}", module_id);
        self.emit(topics::MODULE_REENABLED, json!({ "moduleId": module_id }));
        let lock = self.lifecycle_lock(module_id);
        let guard = lock.lock().await;
        if self.is_shutting_down() || self.is_disabled(module_id) {
            return;
        }
        let restarted = async {
            self.registry.init_module(module_id).await?;
            self.registry.start_module(module_id).await
        }
        .await;
        drop(guard);
        if let Err(err) = restarted {
            tracing::warn!("module_reenable_restart_failed: module={}, error={}", module_id, err);
            self.handle_module_error(module_id, &ModuleFault::from(&err));
        }
    }

    pub fn is_disabled(&self, module_id: &str) -> bool {
        self.state
            .lock()
            .modules
            .get(module_id)
            .is_some_and(|h| h.disabled.is_some())
    }

    // =========================================================================
    // Emergency mode
    // =========================================================================

    fn enter_emergency(self: &Arc<Self>, trigger: &str, errors: u32, restarts: usize) {
        let now = Instant::now();
        let cooldown = self.config.emergency_cooldown;
        let (generation, cancelled) = {
            let mut state = self.state.lock();
            if state.emergency.as_ref().is_some_and(|e| e.until > now) {
                return;
            }
            state.emergency_generation += 1;
            let generation = state.emergency_generation;
            state.emergency = Some(EmergencyState {
                trigger: trigger.to_string(),
                until: now + cooldown,
                generation,
            });
            let cancelled = state
                .modules
                .values_mut()
                .map(ModuleHealth::cancel_recovery)
                .filter(|cancelled| *cancelled)
                .count();
            state.counters.emergencies += 1;
            (generation, cancelled)
        };

        tracing::error!(
            "death_spiral_detected: module={}, errors={}, restarts={}, recoveries_cancelled={}",
            trigger,
            errors,
            restarts,
            cancelled
        );
        self.emit(
            topics::EMERGENCY_DEATH_SPIRAL,
            json!({
                "moduleId": trigger,
                "errorCount": errors,
                "restarts": restarts,
                "cooldownMs": u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
            }),
        );

        let this = Arc::clone(self);
        self.spawn("emergency cooldown", async move {
            tokio::time::sleep(cooldown).await;
            this.clear_emergency(generation);
        });
    }

    fn clear_emergency(&self, generation: u64) {
        let cleared = {
            let mut state = self.state.lock();
            match &state.emergency {
                Some(e) if e.generation == generation => state.emergency.take(),
                _ => None,
            }
        };
        if let Some(emergency) = cleared {
            tracing::info!("emergency_cleared: trigger={}", emergency.trigger);
            self.emit(
                topics::EMERGENCY_CLEARED,
                json!({ "moduleId": emergency.trigger }),
            );
        }
    }

    pub fn in_emergency(&self) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .emergency
            .as_ref()
            .is_some_and(|e| e.until > now)
    }

    // =========================================================================
    // Process-level errors
    // =========================================================================

    /// Route a failed subscriber. Failures owned by a registered module go to
    /// that module's error handling, whose quotas bound them. Panics and
    /// failures with no registered owner count toward the process burst.
    pub fn handle_handler_error(self: &Arc<Self>, module_id: Option<&str>, fault: &ModuleFault) -> ProcessErrorOutcome {
        match module_id {
            Some(id) if fault.kind != ErrorKind::Panic && self.registry.contains(id) => {
                self.state.lock().counters.handler_errors += 1;
                ProcessErrorOutcome::Routed(self.handle_module_error(id, fault))
            }
            _ => self.handle_process_error(module_id, fault),
        }
    }

    /// Route a process-level error, escalating to shutdown on a burst.
    pub fn handle_process_error(self: &Arc<Self>, module_id: Option<&str>, fault: &ModuleFault) -> ProcessErrorOutcome {
        if self.is_shutting_down() {
            return ProcessErrorOutcome::Ignored;
        }
        let now = Instant::now();
        let recent = {
            let mut state = self.state.lock();
            state.counters.process_errors += 1;
            state.process_errors.push_back(now);
            let window = self.config.process_error_window;
            while let Some(ts) = state.process_errors.front() {
                if now.saturating_duration_since(*ts) > window {
                    state.process_errors.pop_front();
                } else {
                    break;
                }
            }
            state.process_errors.len()
        };

        if self.config.process_error_burst > 0 && recent >= self.config.process_error_burst {
            tracing::error!(
                "process_error_burst: errors={}, window_ms={}, last_error={}",
                recent,
                self.config.process_error_window.as_millis(),
                fault
            );
            drop(self.shutdown(format!("process error burst: {recent} errors")));
            return ProcessErrorOutcome::ShutdownTriggered;
        }

        match module_id {
            Some(id) if self.registry.contains(id) => {
                ProcessErrorOutcome::Routed(self.handle_module_error(id, fault))
            }
            _ => {
                tracing::warn!("process_error: module={:?}, error={}", module_id, fault);
                ProcessErrorOutcome::Counted
            }
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Begin graceful shutdown, or join the one already in flight.
    pub fn shutdown(self: &Arc<Self>, reason: impl Into<String>) -> SharedShutdown {
        let mut slot = self.shutdown.lock();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }

        let reason = reason.into();
        let id = ShutdownId::new();
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_tx.send_replace(Some(reason.clone()));
        tracing::warn!("shutdown_requested: id={}, reason={}", id, reason);

        let this = Arc::clone(self);
        let future = async move { this.run_shutdown(id, reason).await }.boxed().shared();
        *slot = Some(future.clone());
        drop(slot);

        let driver = future.clone();
        self.spawn("shutdown", async move {
            driver.await;
        });
        future
    }

    async fn run_shutdown(self: Arc<Self>, id: ShutdownId, reason: String) -> ShutdownReport {
        let started = Instant::now();
        {
            let mut state = self.state.lock();
            for health in state.modules.values_mut() {
                health.cancel_recovery();
                health.cancel_reenable();
            }
        }

        let scheduler = self.scheduler.read().clone();
        let tasks_cleared = scheduler.map(|s| s.stop()).unwrap_or(0);

        let mut report = ShutdownReport {
            id,
            reason,
            tasks_cleared,
            ..ShutdownReport::default()
        };
        // Wait out lifecycle work already in flight so nothing restarts a
        // module behind `stop_modules`.
        let in_flight: Vec<Arc<AsyncMutex<()>>> = self.lifecycle.lock().values().cloned().collect();
        let drain_and_stop = async {
            for lock in &in_flight {
                drop(lock.lock().await);
            }
            self.registry.stop_modules().await
        };
        match tokio::time::timeout(self.config.shutdown_timeout, drain_and_stop).await {
            Ok(stop) => {
                report.stopped = stop.stopped;
                report.failures = stop
                    .failures
                    .into_iter()
                    .map(|(id, err)| (id, err.to_string()))
                    .collect();
            }
            Err(_) => {
                report.timed_out = true;
            }
        }
        report.duration = started.elapsed();

        if report.timed_out {
            tracing::error!(
                "shutdown_timeout: id={}, reason={}, timeout_ms={}",
                report.id,
                report.reason,
                self.config.shutdown_timeout.as_millis()
            );
            let hook = self.exit_hook.read().clone();
            hook(FORCED_EXIT_CODE);
        } else {
            tracing::info!(
                "shutdown_complete: id={}, reason={}, stopped={}, failures={}, tasks_cleared={}",
                report.id,
                report.reason,
                report.stopped.len(),
                report.failures.len(),
                report.tasks_cleared
            );
        }
        report
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolve with the shutdown reason once any trigger fires.
    pub async fn wait_for_shutdown(&self) -> String {
        let mut rx = self.shutdown_tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => String::new(),
        };
        reason
    }

    /// Trigger shutdown on SIGINT, SIGTERM or SIGQUIT.
    pub fn install_signal_handlers(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::internal("signal handlers require a Tokio runtime"))?;
        let weak = Arc::downgrade(self);
        Ok(handle.spawn(async move {
            match signals::wait_for_termination().await {
                Ok(signal) => {
                    tracing::warn!("termination_signal_received: signal={}", signal);
                    if let Some(this) = weak.upgrade() {
                        this.shutdown(format!("signal {signal}")).await;
                    }
                }
                Err(err) => {
                    tracing::error!("signal_registration_failed: error={}", err);
                }
            }
        }))
    }

    /// Count panics process-wide, chaining the previously installed hook.
    pub fn install_panic_hook(&self) {
        let panics = Arc::clone(&self.panics);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            panics.fetch_add(1, Ordering::Relaxed);
            previous(info);
        }));
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn status(&self) -> SupervisorStatus {
        let now = Instant::now();
        let state = self.state.lock();
        let mut modules: Vec<ModuleHealthSnapshot> = state
            .modules
            .iter()
            .map(|(id, h)| ModuleHealthSnapshot {
                module_id: id.clone(),
                error_count: h.error_count,
                restart_attempts: h.restart_attempts,
                restarts_last_hour: h.restarts_last_hour(now),
                restarts_last_day: h.restarts_last_day(now),
                disabled: h.disabled.clone(),
                recovery_pending: h.pending_recovery.is_some(),
                reenable_pending: h.pending_reenable.is_some(),
                last_error: h.last_error.clone(),
            })
            .collect();
        modules.sort_by(|a, b| a.module_id.cmp(&b.module_id));

        let emergency = state
            .emergency
            .as_ref()
            .filter(|e| e.until > now)
            .map(|e| EmergencyInfo {
                trigger_module: e.trigger.clone(),
                remaining: e.until.saturating_duration_since(now),
            });

        let mut counters = state.counters.clone();
        counters.panics = self.panics.load(Ordering::Relaxed);
        SupervisorStatus {
            shutting_down: self.is_shutting_down(),
            emergency,
            modules,
            counters,
        }
    }

    /// Summarize runtime health from supervisor, registry and bus state.
    pub fn check_health(&self) -> HealthReport {
        let status = self.status();
        let breaker = self.bus.breaker_state();
        let disabled_modules: Vec<String> = status
            .modules
            .iter()
            .filter(|m| m.disabled.is_some())
            .map(|m| m.module_id.clone())
            .collect();
        let failed_modules: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .filter(|m| m.status == ModuleStatus::Error)
            .map(|m| m.id)
            .collect();
        let recovering = status.modules.iter().filter(|m| m.recovery_pending).count();

        let mut reasons = Vec::new();
        let mut health = HealthStatus::Healthy;
        if status.shutting_down {
            health = HealthStatus::Unhealthy;
            reasons.push("shutting down".to_string());
        }
        if let Some(emergency) = &status.emergency {
            health = HealthStatus::Unhealthy;
            reasons.push(format!("emergency mode triggered by {}", emergency.trigger_module));
        }
        let degraded = [
            (!disabled_modules.is_empty()).then(|| format!("disabled modules: {}", disabled_modules.join(", "))),
            (!failed_modules.is_empty()).then(|| format!("failed modules: {}", failed_modules.join(", "))),
            (recovering > 0).then(|| format!("{recovering} recoveries pending")),
            (breaker != BreakerState::Closed).then(|| format!("circuit breaker {breaker:?}")),
        ];
        for reason in degraded.into_iter().flatten() {
            if health == HealthStatus::Healthy {
                health = HealthStatus::Degraded;
            }
            reasons.push(reason);
        }

        HealthReport {
            status: health,
            reasons,
            breaker,
            disabled_modules,
            failed_modules,
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn emit(&self, event: &str, payload: serde_json::Value) {
        let outcome = self.bus.emit_from(SUPERVISOR_ID, event, payload);
        if let Some(trip) = outcome.trip() {
            tracing::debug!("supervisor_event_blocked: event={}, trip={:?}", event, trip);
        }
    }

    fn spawn<F>(&self, what: &str, future: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(future);
                true
            }
            Err(_) => {
                tracing::warn!("supervisor_spawn_skipped: task={}, reason=no tokio runtime", what);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Module, ModuleManifest};
    use crate::types::ErrorKind;
    use async_trait::async_trait;

    struct Quiet;

    #[async_trait]
    impl Module for Quiet {
        async fn init(&self) -> Result<()> {
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    fn handler(config: ErrorHandlerConfig) -> Arc<ErrorHandler> {
        let bus = Arc::new(EventBus::default());
        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&bus)));
        registry
            .register("games", Arc::new(Quiet), ModuleManifest::new("games", "1.0.0"))
            .unwrap();
        ErrorHandler::new(config, registry, bus)
    }

    fn transient() -> ModuleFault {
        ModuleFault::new(ErrorKind::ConnectionReset, "socket closed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_error_while_pending_is_not_rescheduled() {
        let eh = handler(ErrorHandlerConfig::default());
        assert_eq!(
            eh.handle_module_error("games", &transient()),
            ErrorDisposition::RecoveryScheduled {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(
            eh.handle_module_error("games", &transient()),
            ErrorDisposition::RecoveryPending
        );
        assert_eq!(eh.status().counters.recoveries_scheduled, 1);
    }

    #[tokio::test]
    async fn test_non_recoverable_error_is_logged() {
        let eh = handler(ErrorHandlerConfig::default());
        let fault = ModuleFault::new(ErrorKind::InvalidInput, "bad config");
        assert_eq!(eh.handle_module_error("games", &fault), ErrorDisposition::Logged);
        let status = eh.status();
        assert_eq!(status.modules[0].error_count, 1);
        assert_eq!(status.modules[0].last_error.as_ref(), Some(&fault));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_disables() {
        let eh = handler(ErrorHandlerConfig {
            max_retries: 0,
            ..ErrorHandlerConfig::default()
        });
        assert_eq!(
            eh.handle_module_error("games", &transient()),
            ErrorDisposition::Disabled(DisableReason::RetriesExhausted)
        );
        assert!(eh.is_disabled("games"));
        assert_eq!(
            eh.handle_module_error("games", &transient()),
            ErrorDisposition::Ignored(IgnoreReason::Disabled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let eh = handler(ErrorHandlerConfig::default());
        let first = eh.shutdown("test");
        let second = eh.shutdown("ignored");
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.reason, "test");
        assert_eq!(b.reason, "test");
        assert!(a.is_clean());
        assert_eq!(eh.wait_for_shutdown().await, "test");
        assert_eq!(
            eh.handle_module_error("games", &transient()),
            ErrorDisposition::Ignored(IgnoreReason::ShuttingDown)
        );
    }

    #[tokio::test]
    async fn test_handler_errors_split_between_module_and_process() {
        let eh = handler(ErrorHandlerConfig::default());
        let bad_input = ModuleFault::new(ErrorKind::InvalidInput, "bad input");
        assert_eq!(
            eh.handle_handler_error(Some("games"), &bad_input),
            ProcessErrorOutcome::Routed(ErrorDisposition::Logged)
        );
        assert_eq!(
            eh.handle_handler_error(Some("ghost"), &bad_input),
            ProcessErrorOutcome::Counted
        );
        let panic = ModuleFault::new(ErrorKind::Panic, "handler panicked");
        assert!(matches!(
            eh.handle_handler_error(Some("games"), &panic),
            ProcessErrorOutcome::Routed(_)
        ));

        let counters = eh.status().counters;
        assert_eq!(counters.handler_errors, 1);
        assert_eq!(counters.process_errors, 2);
    }

    #[test]
    fn test_healthy_when_idle() {
        let eh = handler(ErrorHandlerConfig::default());
        let report = eh.check_health();
        assert!(report.is_healthy(), "{:?}", report.reasons);
    }
}
