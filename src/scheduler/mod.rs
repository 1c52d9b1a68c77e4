//! Unified scheduler for cron, interval and one-shot tasks.
//!
//! Every task owns a driver future that holds its timer. Drivers are tracked
//! by task key and released through per-task cancellation tokens, all children
//! of one root token cancelled by [`UnifiedScheduler::stop`].
//!
//! Executions pass a global concurrency gate. When the gate is saturated the
//! execution is re-queued after `requeue_delay` instead of being dropped.

pub mod task;

use chrono::Utc;
use chrono_tz::Tz;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::eventbus::{topics, EventBus};
use crate::kernel::with_recovery_async;
use crate::types::{Error, Result};

pub use task::{
    task_fn, task_key, ExecutionOutcome, TaskHandler, TaskInfo, TaskKind, TaskOptions, TaskStats,
};
use task::{TaskRecord, Trigger};

const SCHEDULER_SOURCE: &str = "scheduler";

// =============================================================================
// Configuration
// =============================================================================

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default IANA timezone for cron expressions.
    pub timezone: String,
    /// Executions allowed to run at once across all tasks.
    pub max_concurrent: usize,
    /// Wait before retrying an execution that found the gate saturated.
    #[serde(with = "humantime_serde")]
    pub requeue_delay: Duration,
    /// Re-queues allowed per execution before it is dropped. `None` is unbounded.
    pub max_requeues: Option<u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            max_concurrent: 10,
            requeue_delay: Duration::from_millis(100),
            max_requeues: None,
        }
    }
}

/// Aggregate scheduler statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub active_tasks: usize,
    pub paused_tasks: usize,
    pub running: usize,
    pub max_concurrent: usize,
    pub total_runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub deferrals: u64,
    pub dropped: u64,
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
}

#[derive(Debug, Default)]
struct GlobalCounters {
    running: usize,
    total_runs: u64,
    successes: u64,
    failures: u64,
    deferrals: u64,
    dropped: u64,
    total_duration: Duration,
}

// =============================================================================
// Scheduler
// =============================================================================

struct SchedulerInner {
    config: SchedulerConfig,
    timezone: Tz,
    tasks: Mutex<HashMap<String, TaskRecord>>,
    gate: Arc<Semaphore>,
    root: CancellationToken,
    bus: RwLock<Option<Arc<EventBus>>>,
    counters: Mutex<GlobalCounters>,
    generation: AtomicU64,
    stopped: AtomicBool,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// Cron, interval and timeout tasks under one concurrency cap.
pub struct UnifiedScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for UnifiedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedScheduler")
            .field("config", &self.inner.config)
            .field("tasks", &self.inner.tasks.lock().len())
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl UnifiedScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let timezone = parse_timezone(&config.timezone)?;
        if config.max_concurrent == 0 {
            return Err(Error::validation("max_concurrent must be at least 1"));
        }
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                gate: Arc::new(Semaphore::new(config.max_concurrent)),
                timezone,
                tasks: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
                bus: RwLock::new(None),
                counters: Mutex::new(GlobalCounters::default()),
                generation: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Publish `task:*` events on `bus`.
    pub fn with_event_bus(self, bus: Arc<EventBus>) -> Self {
        self.attach_event_bus(bus);
        self
    }

    pub fn attach_event_bus(&self, bus: Arc<EventBus>) {
        *self.inner.bus.write() = Some(bus);
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Schedule a cron task.
    ///
    /// Five-field expressions (minute precision) are accepted alongside the
    /// six- and seven-field forms with seconds and years.
    pub fn schedule(&self, id: &str, expression: &str, handler: TaskHandler, opts: TaskOptions) -> Result<String> {
        let tz = match &opts.timezone {
            Some(name) => parse_timezone(name)?,
            None => self.inner.timezone,
        };
        let normalized = normalize_cron(expression);
        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| Error::InvalidSchedule(format!("{expression}: {e}")))?;
        let trigger = Trigger::Cron {
            expression: expression.to_string(),
            schedule: Box::new(schedule),
            tz,
        };
        self.add_task(id, trigger, handler, opts)
    }

    /// Schedule a repeating task every `period`.
    pub fn interval(&self, id: &str, period: Duration, handler: TaskHandler, opts: TaskOptions) -> Result<String> {
        if period.is_zero() {
            return Err(Error::InvalidSchedule(format!("{id}: interval period must be non-zero")));
        }
        self.add_task(id, Trigger::Interval { period }, handler, opts)
    }

    /// Schedule a one-shot task after `delay`. It removes itself after firing.
    pub fn timeout(&self, id: &str, delay: Duration, handler: TaskHandler, opts: TaskOptions) -> Result<String> {
        let delay = if opts.run_immediately { Duration::ZERO } else { delay };
        let trigger = Trigger::Timeout {
            delay,
            fire_at: Instant::now() + delay,
        };
        self.add_task(id, trigger, handler, opts)
    }

    fn add_task(&self, id: &str, trigger: Trigger, handler: TaskHandler, opts: TaskOptions) -> Result<String> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown(format!("scheduler stopped, cannot add {id}")));
        }
        if id.is_empty() {
            return Err(Error::validation("task id cannot be empty"));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::internal("scheduler requires a running Tokio runtime"));
        }

        let key = task_key(id, opts.module.as_deref());
        let kind = trigger.kind();
        let schedule = trigger.describe();
        {
            let mut tasks = self.inner.tasks.lock();
            if tasks.contains_key(&key) {
                return Err(Error::validation(format!("task already scheduled: {key}")));
            }
            let now = Utc::now();
            let next_run = match &trigger {
                Trigger::Cron { .. } => trigger.next_cron_fire(now),
                Trigger::Interval { period } if !opts.run_immediately => {
                    chrono::Duration::from_std(*period).ok().map(|p| now + p)
                }
                Trigger::Timeout { delay, .. } => chrono::Duration::from_std(*delay).ok().map(|d| now + d),
                Trigger::Interval { .. } => Some(now),
            };
            let record = TaskRecord {
                id: id.to_string(),
                module: opts.module.clone(),
                trigger: trigger.clone(),
                handler,
                enabled: true,
                running: false,
                generation: self.inner.generation.fetch_add(1, Ordering::Relaxed),
                token: self.inner.root.child_token(),
                last_run: None,
                next_run,
                created_at: now,
                stats: TaskStats::default(),
            };
            spawn_driver(&self.inner, key.clone(), trigger, opts.run_immediately, &record);
            tasks.insert(key.clone(), record);
        }

        tracing::info!("task_scheduled: key={}, kind={}, schedule={}", key, kind.as_str(), schedule);
        self.inner.emit(
            opts.module.as_deref(),
            topics::TASK_SCHEDULED,
            json!({ "taskId": key, "type": kind, "schedule": schedule, "module": opts.module }),
        );
        Ok(key)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run one execution of `key` now, through the concurrency gate.
    pub async fn execute_task(&self, key: &str) -> Result<ExecutionOutcome> {
        let token = self
            .inner
            .tasks
            .lock()
            .get(key)
            .map(|t| t.token.clone())
            .ok_or_else(|| Error::not_found(format!("unknown task: {key}")))?;
        self.inner.execute(key, &token).await
    }

    // =========================================================================
    // Management
    // =========================================================================

    /// Remove a task and release its driver. Returns false if it did not exist.
    pub fn remove_task(&self, key: &str) -> bool {
        let removed = self.inner.tasks.lock().remove(key);
        match removed {
            Some(record) => {
                record.token.cancel();
                tracing::info!("task_removed: key={}", key);
                self.inner.emit(
                    record.module.as_deref(),
                    topics::TASK_REMOVED,
                    json!({ "taskId": key }),
                );
                true
            }
            None => false,
        }
    }

    /// Remove every task owned by `module`.
    pub fn remove_module_tasks(&self, module: &str) -> usize {
        let keys: Vec<String> = self
            .inner
            .tasks
            .lock()
            .iter()
            .filter(|(_, t)| t.module.as_deref() == Some(module))
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter().filter(|key| self.remove_task(key)).count()
    }

    /// Pause a task, releasing its driver. Returns false if already paused.
    pub fn pause_task(&self, key: &str) -> Result<bool> {
        let module = {
            let mut tasks = self.inner.tasks.lock();
            let record = tasks
                .get_mut(key)
                .ok_or_else(|| Error::not_found(format!("unknown task: {key}")))?;
            if !record.enabled {
                return Ok(false);
            }
            record.enabled = false;
            record.next_run = None;
            record.token.cancel();
            record.module.clone()
        };
        tracing::info!("task_paused: key={}", key);
        self.inner
            .emit(module.as_deref(), topics::TASK_PAUSED, json!({ "taskId": key }));
        Ok(true)
    }

    /// Resume a paused task with a fresh driver. Returns false if not paused.
    pub fn resume_task(&self, key: &str) -> Result<bool> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown(format!("scheduler stopped, cannot resume {key}")));
        }
        let module = {
            let mut tasks = self.inner.tasks.lock();
            let record = tasks
                .get_mut(key)
                .ok_or_else(|| Error::not_found(format!("unknown task: {key}")))?;
            if record.enabled {
                return Ok(false);
            }
            record.enabled = true;
            record.token = self.inner.root.child_token();
            record.generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
            let now = Utc::now();
            record.next_run = match &record.trigger {
                Trigger::Cron { .. } => record.trigger.next_cron_fire(now),
                Trigger::Interval { period } => chrono::Duration::from_std(*period).ok().map(|p| now + p),
                Trigger::Timeout { fire_at, .. } => {
                    let remaining = fire_at.saturating_duration_since(Instant::now());
                    chrono::Duration::from_std(remaining).ok().map(|d| now + d)
                }
            };
            let trigger = record.trigger.clone();
            spawn_driver(&self.inner, key.to_string(), trigger, false, record);
            record.module.clone()
        };
        tracing::info!("task_resumed: key={}", key);
        self.inner
            .emit(module.as_deref(), topics::TASK_RESUMED, json!({ "taskId": key }));
        Ok(true)
    }

    /// Cancel every driver and clear all tasks. Further scheduling is rejected.
    pub fn stop(&self) -> usize {
        let was_stopped = self.inner.stopped.swap(true, Ordering::SeqCst);
        self.inner.root.cancel();
        let cleared = {
            let mut tasks = self.inner.tasks.lock();
            let n = tasks.len();
            tasks.clear();
            n
        };
        if !was_stopped {
            tracing::info!("scheduler_stopped: tasks_cleared={}", cleared);
            self.inner
                .emit(None, topics::SCHEDULER_STOPPED, json!({ "tasksCleared": cleared }));
        }
        cleared
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn task(&self, key: &str) -> Option<TaskInfo> {
        self.inner.tasks.lock().get(key).map(|t| t.snapshot(key))
    }

    /// All task snapshots, sorted by key.
    pub fn tasks(&self) -> Vec<TaskInfo> {
        let mut tasks: Vec<TaskInfo> = self
            .inner
            .tasks
            .lock()
            .iter()
            .map(|(k, t)| t.snapshot(k))
            .collect();
        tasks.sort_by(|a, b| a.key.cmp(&b.key));
        tasks
    }

    pub fn stats(&self) -> SchedulerStats {
        let (active_tasks, paused_tasks) = {
            let tasks = self.inner.tasks.lock();
            let paused = tasks.values().filter(|t| !t.enabled).count();
            (tasks.len() - paused, paused)
        };
        let counters = self.inner.counters.lock();
        SchedulerStats {
            active_tasks,
            paused_tasks,
            running: counters.running,
            max_concurrent: self.inner.config.max_concurrent,
            total_runs: counters.total_runs,
            successes: counters.successes,
            failures: counters.failures,
            deferrals: counters.deferrals,
            dropped: counters.dropped,
            total_duration: counters.total_duration,
        }
    }
}

// =============================================================================
// Execution core
// =============================================================================

impl SchedulerInner {
    async fn execute(&self, key: &str, token: &CancellationToken) -> Result<ExecutionOutcome> {
        let mut requeues: u32 = 0;
        let (permit, handler, module) = loop {
            let (handler, module) = {
                let tasks = self.tasks.lock();
                let record = tasks
                    .get(key)
                    .ok_or_else(|| Error::not_found(format!("unknown task: {key}")))?;
                (Arc::clone(&record.handler), record.module.clone())
            };

            match Arc::clone(&self.gate).try_acquire_owned() {
                Ok(permit) => break (permit, handler, module),
                Err(TryAcquireError::Closed) => {
                    return Err(Error::ShuttingDown("concurrency gate closed".to_string()))
                }
                Err(TryAcquireError::NoPermits) => {
                    requeues += 1;
                    self.counters.lock().deferrals += 1;
                    if let Some(record) = self.tasks.lock().get_mut(key) {
                        record.stats.deferrals += 1;
                    }
                    if let Some(max) = self.config.max_requeues {
                        if requeues > max {
                            self.counters.lock().dropped += 1;
                            if let Some(record) = self.tasks.lock().get_mut(key) {
                                record.stats.dropped += 1;
                            }
                            tracing::warn!("task_execution_dropped: key={}, requeues={}", key, max);
                            return Ok(ExecutionOutcome::Dropped { requeues: max });
                        }
                    }
                    tracing::debug!("task_requeued: key={}, attempt={}", key, requeues);
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Ok(ExecutionOutcome::Cancelled),
                        _ = tokio::time::sleep(self.config.requeue_delay) => {}
                    }
                }
            }
        };

        if let Some(record) = self.tasks.lock().get_mut(key) {
            record.running = true;
        }
        self.counters.lock().running += 1;
        self.emit(module.as_deref(), topics::TASK_START, json!({ "taskId": key }));

        let started = Instant::now();
        let result = with_recovery_async(|| handler(), "scheduled task").await;
        let duration = started.elapsed();
        drop(permit);

        let error = result.err().map(|e| e.to_string());
        {
            let mut counters = self.counters.lock();
            counters.running = counters.running.saturating_sub(1);
            counters.total_runs += 1;
            counters.total_duration += duration;
            if error.is_some() {
                counters.failures += 1;
            } else {
                counters.successes += 1;
            }
        }
        if let Some(record) = self.tasks.lock().get_mut(key) {
            record.running = false;
            record.last_run = Some(Utc::now());
            record.stats.runs += 1;
            record.stats.total_duration += duration;
            record.stats.last_duration = Some(duration);
            match &error {
                Some(message) => {
                    record.stats.failures += 1;
                    record.stats.last_error = Some(message.clone());
                }
                None => record.stats.successes += 1,
            }
        }

        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        match error {
            None => {
                tracing::debug!("task_complete: key={}, duration_ms={}", key, duration_ms);
                self.emit(
                    module.as_deref(),
                    topics::TASK_COMPLETE,
                    json!({ "taskId": key, "durationMs": duration_ms }),
                );
                Ok(ExecutionOutcome::Completed { duration })
            }
            Some(message) => {
                tracing::warn!("task_failed: key={}, error={}", key, message);
                self.emit(
                    module.as_deref(),
                    topics::TASK_ERROR,
                    json!({ "taskId": key, "error": message, "module": module, "durationMs": duration_ms }),
                );
                Ok(ExecutionOutcome::Failed {
                    error: message,
                    duration,
                })
            }
        }
    }

    fn set_next_run(&self, key: &str, generation: u64, next: Option<chrono::DateTime<Utc>>) {
        if let Some(record) = self.tasks.lock().get_mut(key) {
            if record.generation == generation {
                record.next_run = next;
            }
        }
    }

    /// Remove a fired one-shot task unless the key was reused meanwhile.
    fn finish_one_shot(&self, key: &str, generation: u64) {
        let removed = {
            let mut tasks = self.tasks.lock();
            match tasks.get(key) {
                Some(record) if record.generation == generation => tasks.remove(key),
                _ => None,
            }
        };
        if let Some(record) = removed {
            tracing::debug!("timeout_task_completed: key={}", key);
            self.emit(
                record.module.as_deref(),
                topics::TASK_REMOVED,
                json!({ "taskId": key, "reason": "fired" }),
            );
        }
    }

    fn emit(&self, module: Option<&str>, event: &str, payload: Value) {
        let bus = self.bus.read().clone();
        if let Some(bus) = bus {
            bus.emit_from(module.unwrap_or(SCHEDULER_SOURCE), event, payload);
        }
    }
}

// =============================================================================
// Drivers
// =============================================================================

fn spawn_driver(
    inner: &Arc<SchedulerInner>,
    key: String,
    trigger: Trigger,
    run_immediately: bool,
    record: &TaskRecord,
) {
    let weak = Arc::downgrade(inner);
    let token = record.token.clone();
    let generation = record.generation;
    tokio::spawn(async move {
        match trigger {
            Trigger::Interval { period } => {
                drive_interval(weak, key, period, run_immediately, token).await;
            }
            Trigger::Timeout { fire_at, .. } => {
                drive_timeout(weak, key, fire_at, generation, token).await;
            }
            cron @ Trigger::Cron { .. } => {
                drive_cron(weak, key, cron, run_immediately, generation, token).await;
            }
        }
    });
}

async fn drive_interval(
    weak: Weak<SchedulerInner>,
    key: String,
    period: Duration,
    run_immediately: bool,
    token: CancellationToken,
) {
    let start = if run_immediately {
        Instant::now()
    } else {
        Instant::now() + period
    };
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = weak.upgrade() else { break };
        if let Some(record) = inner.tasks.lock().get_mut(&key) {
            record.next_run = chrono::Duration::from_std(period)
                .ok()
                .map(|p| Utc::now() + p);
        }
        if let Err(err) = inner.execute(&key, &token).await {
            tracing::debug!("interval_driver_exit: key={}, reason={}", key, err);
            break;
        }
    }
}

async fn drive_timeout(
    weak: Weak<SchedulerInner>,
    key: String,
    fire_at: Instant,
    generation: u64,
    token: CancellationToken,
) {
    tokio::select! {
        biased;
        _ = token.cancelled() => return,
        _ = tokio::time::sleep_until(fire_at) => {}
    }
    let Some(inner) = weak.upgrade() else { return };
    if let Err(err) = inner.execute(&key, &token).await {
        tracing::debug!("timeout_driver_exit: key={}, reason={}", key, err);
    }
    inner.finish_one_shot(&key, generation);
}

async fn drive_cron(
    weak: Weak<SchedulerInner>,
    key: String,
    trigger: Trigger,
    run_immediately: bool,
    generation: u64,
    token: CancellationToken,
) {
    if run_immediately {
        let Some(inner) = weak.upgrade() else { return };
        if inner.execute(&key, &token).await.is_err() {
            return;
        }
    }

    let mut last_fire: Option<chrono::DateTime<Utc>> = None;
    loop {
        let now = Utc::now();
        let after = match last_fire {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = trigger.next_cron_fire(after) else {
            tracing::info!("cron_schedule_exhausted: key={}", key);
            break;
        };
        {
            let Some(inner) = weak.upgrade() else { break };
            inner.set_next_run(&key, generation, Some(next));
        }
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        last_fire = Some(next);
        let Some(inner) = weak.upgrade() else { break };
        if let Err(err) = inner.execute(&key, &token).await {
            tracing::debug!("cron_driver_exit: key={}, reason={}", key, err);
            break;
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| Error::validation(format!("unknown timezone: {name}")))
}

/// Prepend a seconds field to five-field expressions.
fn normalize_cron(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(hits: &Arc<AtomicUsize>) -> TaskHandler {
        let hits = Arc::clone(hits);
        task_fn(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 0 3 * * *"), "0 0 3 * * *");
    }

    #[test]
    fn test_rejects_unknown_timezone() {
        let err = UnifiedScheduler::new(SchedulerConfig {
            timezone: "Mars/Olympus".to_string(),
            ..SchedulerConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected() {
        let scheduler = UnifiedScheduler::new(SchedulerConfig::default()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let err = scheduler
            .schedule("bad", "not a cron", counting(&hits), TaskOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn test_cron_next_run_in_timezone() {
        let scheduler = UnifiedScheduler::new(SchedulerConfig::default()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let key = scheduler
            .schedule(
                "nightly",
                "0 3 * * *",
                counting(&hits),
                TaskOptions::for_module("cleanup").timezone("America/New_York"),
            )
            .unwrap();
        assert_eq!(key, "cleanup:nightly");
        let info = scheduler.task(&key).unwrap();
        assert_eq!(info.kind, TaskKind::Cron);
        let next = info.next_run.unwrap().with_timezone(&chrono_tz::America::New_York);
        assert_eq!(chrono::Timelike::hour(&next), 3);
        assert_eq!(chrono::Timelike::minute(&next), 0);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let scheduler = UnifiedScheduler::new(SchedulerConfig::default()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let opts = TaskOptions::for_module("games");
        scheduler
            .interval("tick", Duration::from_secs(1), counting(&hits), opts.clone())
            .unwrap();
        assert!(scheduler
            .interval("tick", Duration::from_secs(1), counting(&hits), opts)
            .is_err());
        // Same id under another module is a different key.
        assert!(scheduler
            .interval("tick", Duration::from_secs(1), counting(&hits), TaskOptions::default())
            .is_ok());
        assert_eq!(scheduler.stop(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_task_records_failure() {
        let scheduler = UnifiedScheduler::new(SchedulerConfig::default()).unwrap();
        let key = scheduler
            .timeout(
                "flaky",
                Duration::from_secs(3600),
                task_fn(|| async { Err(Error::internal("backend down")) }),
                TaskOptions::default(),
            )
            .unwrap();
        let outcome = scheduler.execute_task(&key).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Failed { ref error, .. } if error.contains("backend down")));
        let info = scheduler.task(&key).unwrap();
        assert_eq!(info.stats.failures, 1);
        assert_eq!(scheduler.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_is_contained() {
        let scheduler = UnifiedScheduler::new(SchedulerConfig::default()).unwrap();
        let key = scheduler
            .timeout(
                "boom",
                Duration::from_secs(3600),
                task_fn(|| async { panic!("task exploded") }),
                TaskOptions::default(),
            )
            .unwrap();
        let outcome = scheduler.execute_task(&key).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(scheduler.stats().running, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_are_idempotent() {
        let scheduler = UnifiedScheduler::new(SchedulerConfig::default()).unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let key = scheduler
            .interval("tick", Duration::from_millis(100), counting(&hits), TaskOptions::default())
            .unwrap();

        assert!(scheduler.pause_task(&key).unwrap());
        assert!(!scheduler.pause_task(&key).unwrap());
        tokio::time::sleep(Duration::from_millis(550)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(scheduler.resume_task(&key).unwrap());
        assert!(!scheduler.resume_task(&key).unwrap());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(scheduler.pause_task("missing").is_err());
    }

    #[tokio::test]
    async fn test_stop_with_no_tasks_is_safe() {
        let scheduler = UnifiedScheduler::new(SchedulerConfig::default()).unwrap();
        assert_eq!(scheduler.stop(), 0);
        assert_eq!(scheduler.stop(), 0);
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            scheduler.interval("late", Duration::from_secs(1), counting(&hits), TaskOptions::default()),
            Err(Error::ShuttingDown(_))
        ));
    }
}
