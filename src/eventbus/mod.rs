//! Event bus with cascade protection.
//!
//! Modules talk to each other exclusively through this bus. Dispatch is
//! synchronous and depth-first: when a handler emits, the nested dispatch
//! completes before control returns to that handler. That re-entrancy is what
//! the protection pipeline bounds. Every protected emission passes, in order:
//!
//!   1. **Stack depth**: abort at the shutdown depth, signal at lower levels
//!   2. **Rate limit**: cap on emissions in the trailing second
//!   3. **Deduplication**: drop repeats of the same fingerprint within a window
//!   4. **Source loop**: block an (event, source) pair already on the active chain
//!   5. **Circuit breaker**: reject everything while open, one trial when half-open
//!
//! Protection signals (`protection:*`) and `eventbus:error` bypass the pipeline
//! so raising them can never deadlock the bus. They are still depth-bounded.
//!
//! Locks are never held while a handler runs; dispatch iterates over a
//! snapshot of the subscriber list.

pub mod correlation;
pub mod protection;
pub mod stack_monitor;
pub mod topics;

use crate::kernel::with_recovery;
use crate::types::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::time::Instant;

pub use protection::{
    Admission, BreakerSnapshot, BreakerState, CircuitBreaker, CircuitBreakerConfig, DedupCache,
    DedupConfig, RateWindow,
};
pub use stack_monitor::{DepthGuard, DepthLevel, DepthTrips, StackDepthMonitor, StackThresholds};

/// Source recorded for emissions that do not name a module.
pub const SYSTEM_SOURCE: &str = "system";

/// Source recorded for protection signals.
pub const BUS_SOURCE: &str = "eventbus";

/// Extra depth protection signals may use beyond the shutdown threshold.
const SIGNAL_DEPTH_HEADROOM: usize = 8;

// =============================================================================
// Configuration
// =============================================================================

/// Event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Soft per-event listener limit; exceeding it only logs a warning. 0 disables.
    pub max_listeners: usize,
    /// Number of recent events kept for introspection.
    pub event_history: usize,
    /// Protected emissions allowed in any trailing second.
    pub max_events_per_second: usize,
    pub dedup: DedupConfig,
    pub breaker: CircuitBreakerConfig,
    pub stack: StackThresholds,
    /// Occurrences of an (event, source) pair on the active chain that block
    /// a re-emission. 1 blocks the first recurrence.
    pub max_loop_occurrences: usize,
    /// Event name prefixes that skip the protection pipeline.
    pub bypass_prefixes: Vec<String>,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            max_listeners: 50,
            event_history: 100,
            max_events_per_second: 500,
            dedup: DedupConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            stack: StackThresholds::default(),
            max_loop_occurrences: 1,
            bypass_prefixes: vec!["protection:".to_string(), "eventbus:".to_string()],
        }
    }
}

// =============================================================================
// Message Types
// =============================================================================

/// Event envelope delivered to handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub source_module: String,
    pub room: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub sequence_id: u64,
}

impl Event {
    /// String field of the payload, if present.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Event handler. Receives the bus so it can emit re-entrantly.
pub type Handler = Arc<dyn Fn(&EventBus, &Event) -> Result<()> + Send + Sync>;

/// Identifier returned by [`EventBus::subscribe`].
pub type SubscriptionId = u64;

/// One (module, event) -> handler binding.
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub module_id: String,
    pub event: String,
    handler: Handler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("module_id", &self.module_id)
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// Why a protected emission was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trip", rename_all = "snake_case")]
pub enum ProtectionTrip {
    StackShutdown { depth: usize },
    RateLimited { events_last_second: usize },
    Duplicate,
    RecursionBlocked { event: String, source: String },
    CircuitOpen,
}

/// Result of an emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmitOutcome {
    Delivered {
        handlers: usize,
        failed: usize,
        skipped: usize,
    },
    Blocked(ProtectionTrip),
}

impl EmitOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, EmitOutcome::Delivered { .. })
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, EmitOutcome::Blocked(_))
    }

    /// Number of handlers that ran successfully.
    pub fn delivered(&self) -> usize {
        match self {
            EmitOutcome::Delivered { handlers, .. } => *handlers,
            EmitOutcome::Blocked(_) => 0,
        }
    }

    pub fn trip(&self) -> Option<&ProtectionTrip> {
        match self {
            EmitOutcome::Blocked(trip) => Some(trip),
            EmitOutcome::Delivered { .. } => None,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Monotonic counters.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusCounters {
    pub events_emitted: u64,
    pub handler_invocations: u64,
    pub handlers_skipped: u64,
    pub handler_errors: u64,
    pub rate_limited: u64,
    pub duplicates_dropped: u64,
    pub recursions_detected: u64,
    pub recursions_blocked: u64,
    pub stack_aborts: u64,
    pub breaker_rejections: u64,
    pub signals_raised: u64,
    pub signals_suppressed: u64,
    pub per_event: HashMap<String, u64>,
}

/// Point-in-time bus statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub current_depth: usize,
    pub max_depth: usize,
    pub depth_trips: DepthTrips,
    pub breaker: BreakerSnapshot,
    pub events_last_second: usize,
    pub active_subscriptions: usize,
    pub registered_modules: usize,
    pub counters: BusCounters,
}

// =============================================================================
// Internal state
// =============================================================================

#[derive(Debug, Default)]
struct SubscriptionTable {
    by_event: HashMap<String, Vec<Subscription>>,
    by_module: HashMap<String, HashSet<String>>,
    rooms: HashMap<String, HashSet<String>>,
}

impl SubscriptionTable {
    fn count(&self) -> usize {
        self.by_event.values().map(Vec::len).sum()
    }

    fn remove_where<F>(&mut self, event: &str, predicate: F) -> usize
    where
        F: Fn(&Subscription) -> bool,
    {
        let Some(subs) = self.by_event.get_mut(event) else {
            return 0;
        };
        let before = subs.len();
        subs.retain(|s| !predicate(s));
        let removed = before - subs.len();
        if subs.is_empty() {
            self.by_event.remove(event);
        }
        removed
    }

    fn reindex_module(&mut self, module_id: &str, event: &str) {
        let still_subscribed = self
            .by_event
            .get(event)
            .map(|subs| subs.iter().any(|s| s.module_id == module_id))
            .unwrap_or(false);
        if !still_subscribed {
            if let Some(events) = self.by_module.get_mut(module_id) {
                events.remove(event);
                if events.is_empty() {
                    self.by_module.remove(module_id);
                }
            }
        }
    }
}

#[derive(Debug)]
struct ProtectionState {
    rate: RateWindow,
    dedup: DedupCache,
    breaker: CircuitBreaker,
}

#[derive(Debug, Default)]
struct DispatchReport {
    handlers: usize,
    failed: usize,
    skipped: usize,
}

impl From<DispatchReport> for EmitOutcome {
    fn from(report: DispatchReport) -> Self {
        EmitOutcome::Delivered {
            handlers: report.handlers,
            failed: report.failed,
            skipped: report.skipped,
        }
    }
}

/// Pops the hop pushed for the current dispatch when dropped.
struct ChainGuard<'a> {
    chains: &'a Mutex<HashMap<ThreadId, Vec<(String, String)>>>,
    thread: ThreadId,
}

impl Drop for ChainGuard<'_> {
    fn drop(&mut self) {
        let mut chains = self.chains.lock();
        if let Some(chain) = chains.get_mut(&self.thread) {
            chain.pop();
            if chain.is_empty() {
                chains.remove(&self.thread);
            }
        }
    }
}

// =============================================================================
// EventBus
// =============================================================================

/// Process-wide publish/subscribe bus with cascade protection.
#[derive(Debug)]
pub struct EventBus {
    config: EventBusConfig,
    monitor: StackDepthMonitor,
    table: RwLock<SubscriptionTable>,
    protection: Mutex<ProtectionState>,
    chains: Mutex<HashMap<ThreadId, Vec<(String, String)>>>,
    history: Mutex<VecDeque<Event>>,
    counters: Mutex<BusCounters>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
}

impl EventBus {
    /// Create a new EventBus instance.
    pub fn new(config: EventBusConfig) -> Self {
        let protection = ProtectionState {
            rate: RateWindow::new(config.max_events_per_second),
            dedup: DedupCache::new(config.dedup.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
        };
        Self {
            monitor: StackDepthMonitor::new(config.stack),
            table: RwLock::new(SubscriptionTable::default()),
            protection: Mutex::new(protection),
            chains: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(config.event_history)),
            counters: Mutex::new(BusCounters::default()),
            sequence: AtomicU64::new(0),
            next_subscription: AtomicU64::new(0),
            config,
        }
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    // =========================================================================
    // Emission
    // =========================================================================

    /// Emit an event on behalf of the runtime itself.
    pub fn emit(&self, name: &str, payload: Value) -> EmitOutcome {
        self.emit_from(SYSTEM_SOURCE, name, payload)
    }

    /// Emit an event on behalf of `source` and dispatch it synchronously.
    pub fn emit_from(&self, source: &str, name: &str, payload: Value) -> EmitOutcome {
        let event = self.envelope(source, name, payload);
        if self.bypasses_protection(name) {
            return self.dispatch_signal(&event);
        }
        self.emit_protected(event)
    }

    fn emit_protected(&self, event: Event) -> EmitOutcome {
        // 1. Stack depth
        let depth_guard = self.monitor.enter();
        let depth = depth_guard.depth();
        if depth_guard.level() == DepthLevel::Shutdown {
            self.counters.lock().stack_aborts += 1;
            self.note_failure(Instant::now());
            tracing::error!(
                "stack_depth_shutdown: event={}, source={}, depth={}",
                event.name,
                event.source_module,
                depth
            );
            if depth_guard.crossed_threshold() {
                self.raise(
                    topics::EMERGENCY_SHUTDOWN,
                    json!({ "event": event.name, "sourceModule": event.source_module, "depth": depth }),
                );
            }
            return EmitOutcome::Blocked(ProtectionTrip::StackShutdown { depth });
        }
        if depth_guard.crossed_threshold() {
            if let Some(signal) = depth_guard.level().signal() {
                tracing::warn!(
                    "stack_depth_threshold: level={:?}, event={}, depth={}",
                    depth_guard.level(),
                    event.name,
                    depth
                );
                self.raise(
                    signal,
                    json!({ "event": event.name, "sourceModule": event.source_module, "depth": depth }),
                );
            }
        }

        let now = Instant::now();

        // 2. Rate limit
        let rate = self.protection.lock().rate.check_and_record(now);
        if let Err(events_last_second) = rate {
            self.counters.lock().rate_limited += 1;
            self.note_failure(now);
            tracing::warn!(
                "event_rate_limited: event={}, events_last_second={}",
                event.name,
                events_last_second
            );
            self.raise(
                topics::RATE_LIMITED,
                json!({ "event": event.name, "eventsLastSecond": events_last_second }),
            );
            return EmitOutcome::Blocked(ProtectionTrip::RateLimited { events_last_second });
        }

        // 3. Deduplication
        let duplicate = {
            let mut protection = self.protection.lock();
            match protection.dedup.fingerprint(&event.name, &event.payload) {
                Some(fp) => protection.dedup.is_duplicate(&fp, now),
                None => false,
            }
        };
        if duplicate {
            self.counters.lock().duplicates_dropped += 1;
            self.note_failure(now);
            tracing::debug!("event_deduplicated: event={}", event.name);
            return EmitOutcome::Blocked(ProtectionTrip::Duplicate);
        }

        // 4. Source loop
        let occurrences = self.chain_occurrences(&event.name, &event.source_module);
        if occurrences > 0 {
            self.counters.lock().recursions_detected += 1;
            let chain = self.current_chain();
            self.raise(
                topics::RECURSION_DETECTED,
                json!({ "event": event.name, "sourceModule": event.source_module, "chain": chain }),
            );
            if occurrences >= self.config.max_loop_occurrences.max(1) {
                self.counters.lock().recursions_blocked += 1;
                self.note_failure(now);
                tracing::warn!(
                    "recursion_blocked: event={}, source={}, depth={}",
                    event.name,
                    event.source_module,
                    depth
                );
                self.raise(
                    topics::RECURSION_BLOCKED,
                    json!({ "event": event.name, "sourceModule": event.source_module, "chain": chain }),
                );
                return EmitOutcome::Blocked(ProtectionTrip::RecursionBlocked {
                    event: event.name,
                    source: event.source_module,
                });
            }
        }

        // 5. Circuit breaker
        let admission = self.protection.lock().breaker.admit(now);
        if admission == Admission::Rejected {
            self.counters.lock().breaker_rejections += 1;
            tracing::debug!("circuit_open_rejected: event={}", event.name);
            return EmitOutcome::Blocked(ProtectionTrip::CircuitOpen);
        }

        let report = {
            let _hop = self.push_chain(&event.name, &event.source_module);
            self.dispatch(&event)
        };

        match admission {
            Admission::Trial => {
                let state = self
                    .protection
                    .lock()
                    .breaker
                    .finish_trial(report.failed == 0, Instant::now());
                if state == BreakerState::Closed {
                    tracing::info!("circuit_closed: trial_event={}", event.name);
                    self.raise(topics::CIRCUIT_CLOSED, json!({ "event": event.name }));
                } else {
                    tracing::warn!("circuit_reopened: trial_event={}", event.name);
                    self.raise(topics::CIRCUIT_OPEN, json!({ "event": event.name, "trial": true }));
                }
            }
            _ => {
                let now = Instant::now();
                for _ in 0..report.failed {
                    self.note_failure(now);
                }
            }
        }

        report.into()
    }

    /// Protection signals skip the pipeline but stay depth-bounded.
    fn dispatch_signal(&self, event: &Event) -> EmitOutcome {
        let guard = self.monitor.enter_quiet();
        if guard.depth() > self.config.stack.shutdown + SIGNAL_DEPTH_HEADROOM {
            self.counters.lock().signals_suppressed += 1;
            return EmitOutcome::Blocked(ProtectionTrip::StackShutdown {
                depth: guard.depth(),
            });
        }
        self.dispatch(event).into()
    }

    fn raise(&self, name: &str, payload: Value) {
        self.counters.lock().signals_raised += 1;
        let event = self.envelope(BUS_SOURCE, name, payload);
        self.dispatch_signal(&event);
    }

    fn dispatch(&self, event: &Event) -> DispatchReport {
        self.record(event);

        let subscribers: Vec<Subscription> = self
            .table
            .read()
            .by_event
            .get(&event.name)
            .cloned()
            .unwrap_or_default();

        let mut report = DispatchReport::default();
        for sub in &subscribers {
            if !self.room_allows(&sub.module_id, event.room.as_deref()) {
                report.skipped += 1;
                continue;
            }
            match with_recovery(|| (sub.handler)(self, event), "event_handler") {
                Ok(()) => report.handlers += 1,
                Err(err) => {
                    report.failed += 1;
                    self.handler_failed(sub, event, &err);
                }
            }
        }

        let mut counters = self.counters.lock();
        counters.handler_invocations += (report.handlers + report.failed) as u64;
        counters.handlers_skipped += report.skipped as u64;
        report
    }

    fn handler_failed(&self, sub: &Subscription, event: &Event, err: &Error) {
        self.counters.lock().handler_errors += 1;
        tracing::error!(
            "event_handler_failed: module={}, event={}, error={}",
            sub.module_id,
            event.name,
            err
        );
        if event.name == topics::EVENTBUS_ERROR {
            return;
        }
        self.raise(
            topics::EVENTBUS_ERROR,
            json!({
                "moduleId": sub.module_id,
                "event": event.name,
                "error": err.to_string(),
                "kind": err.kind(),
            }),
        );
    }

    fn note_failure(&self, now: Instant) {
        let opened = self.protection.lock().breaker.record_failure(now);
        if opened {
            tracing::warn!("circuit_opened");
            self.raise(topics::CIRCUIT_OPEN, json!({ "trial": false }));
        }
    }

    fn envelope(&self, source: &str, name: &str, mut payload: Value) -> Event {
        let timestamp = Utc::now();
        if let Value::Object(map) = &mut payload {
            map.entry("sourceModule").or_insert_with(|| json!(source));
            map.entry("timestamp")
                .or_insert_with(|| json!(timestamp.timestamp_millis()));
        }
        let room = payload.get("room").and_then(Value::as_str).map(str::to_string);
        Event {
            name: name.to_string(),
            payload,
            source_module: source.to_string(),
            room,
            timestamp,
            sequence_id: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    fn bypasses_protection(&self, name: &str) -> bool {
        self.config
            .bypass_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }

    fn record(&self, event: &Event) {
        {
            let mut counters = self.counters.lock();
            counters.events_emitted += 1;
            *counters.per_event.entry(event.name.clone()).or_insert(0) += 1;
        }
        if self.config.event_history == 0 {
            return;
        }
        let mut history = self.history.lock();
        while history.len() >= self.config.event_history {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    // =========================================================================
    // Active chain
    // =========================================================================

    fn chain_occurrences(&self, name: &str, source: &str) -> usize {
        self.chains
            .lock()
            .get(&thread::current().id())
            .map(|chain| {
                chain
                    .iter()
                    .filter(|(e, s)| e == name && s == source)
                    .count()
            })
            .unwrap_or(0)
    }

    fn current_chain(&self) -> Vec<String> {
        self.chains
            .lock()
            .get(&thread::current().id())
            .map(|chain| chain.iter().map(|(e, s)| format!("{s}:{e}")).collect())
            .unwrap_or_default()
    }

    fn push_chain(&self, name: &str, source: &str) -> ChainGuard<'_> {
        let thread = thread::current().id();
        self.chains
            .lock()
            .entry(thread)
            .or_default()
            .push((name.to_string(), source.to_string()));
        ChainGuard {
            chains: &self.chains,
            thread,
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe `module_id` to `event`. Handlers fire in subscription order.
    pub fn subscribe<F>(&self, module_id: &str, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&EventBus, &Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        let subscription = Subscription {
            id,
            module_id: module_id.to_string(),
            event: event.to_string(),
            handler: Arc::new(handler),
        };

        let listeners = {
            let mut table = self.table.write();
            let subs = table.by_event.entry(event.to_string()).or_default();
            subs.push(subscription);
            let listeners = subs.len();
            table
                .by_module
                .entry(module_id.to_string())
                .or_default()
                .insert(event.to_string());
            listeners
        };

        if self.config.max_listeners > 0 && listeners > self.config.max_listeners {
            tracing::warn!(
                "max_listeners_exceeded: event={}, listeners={}, limit={}",
                event,
                listeners,
                self.config.max_listeners
            );
        }
        tracing::debug!("subscribed: module={}, event={}, id={}", module_id, event, id);
        id
    }

    /// Remove every handler `module_id` registered for `event`.
    pub fn unsubscribe(&self, module_id: &str, event: &str) -> usize {
        let mut table = self.table.write();
        let removed = table.remove_where(event, |s| s.module_id == module_id);
        table.reindex_module(module_id, event);
        if removed > 0 {
            tracing::debug!("unsubscribed: module={}, event={}", module_id, event);
        }
        removed
    }

    /// Remove a single subscription by id.
    pub fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        let mut table = self.table.write();
        let found = table.by_event.iter().find_map(|(event, subs)| {
            subs.iter()
                .find(|s| s.id == id)
                .map(|s| (event.clone(), s.module_id.clone()))
        });
        match found {
            Some((event, module_id)) => {
                table.remove_where(&event, |s| s.id == id);
                table.reindex_module(&module_id, &event);
                true
            }
            None => false,
        }
    }

    /// Remove every subscription owned by `module_id`.
    pub fn unsubscribe_all(&self, module_id: &str) -> usize {
        let mut table = self.table.write();
        let events = table.by_module.remove(module_id).unwrap_or_default();
        events
            .iter()
            .map(|event| table.remove_where(event, |s| s.module_id == module_id))
            .sum()
    }

    /// Register a module's room allowlist. An empty list means every room.
    pub fn register_module<I, S>(&self, module_id: &str, rooms: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rooms: HashSet<String> = rooms.into_iter().map(Into::into).collect();
        self.table.write().rooms.insert(module_id.to_string(), rooms);
    }

    /// Drop a module's allowlist and all of its subscriptions.
    pub fn unregister_module(&self, module_id: &str) -> usize {
        self.table.write().rooms.remove(module_id);
        let removed = self.unsubscribe_all(module_id);
        tracing::debug!(
            "module_unregistered_from_bus: module={}, subscriptions_removed={}",
            module_id,
            removed
        );
        removed
    }

    fn room_allows(&self, module_id: &str, room: Option<&str>) -> bool {
        let Some(room) = room else {
            return true;
        };
        match self.table.read().rooms.get(module_id) {
            Some(allowed) if !allowed.is_empty() => allowed.contains(room),
            _ => true,
        }
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.table
            .read()
            .by_event
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Events `module_id` is subscribed to, sorted.
    pub fn subscriptions_for(&self, module_id: &str) -> Vec<String> {
        let mut events: Vec<String> = self
            .table
            .read()
            .by_module
            .get(module_id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default();
        events.sort();
        events
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.protection.lock().breaker.state()
    }

    pub fn current_depth(&self) -> usize {
        self.monitor.current_depth()
    }

    /// Get current bus statistics.
    pub fn stats(&self) -> BusStats {
        let now = Instant::now();
        let (breaker, events_last_second) = {
            let mut protection = self.protection.lock();
            (protection.breaker.snapshot(now), protection.rate.current(now))
        };
        let (active_subscriptions, registered_modules) = {
            let table = self.table.read();
            (table.count(), table.rooms.len())
        };
        BusStats {
            current_depth: self.monitor.current_depth(),
            max_depth: self.monitor.max_depth(),
            depth_trips: self.monitor.trips(),
            breaker,
            events_last_second,
            active_subscriptions,
            registered_modules,
            counters: self.counters.lock().clone(),
        }
    }

    /// Reset counters and the breaker. Subscriptions are kept.
    pub fn reset_stats(&self) {
        *self.counters.lock() = BusCounters::default();
        self.monitor.reset();
        self.protection.lock().breaker.reset();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn permissive() -> EventBusConfig {
        EventBusConfig {
            dedup: DedupConfig {
                enabled: false,
                ..DedupConfig::default()
            },
            ..EventBusConfig::default()
        }
    }

    #[test]
    fn test_emit_to_zero_subscribers() {
        let bus = EventBus::default();
        let outcome = bus.emit("test.event", json!({}));
        assert_eq!(
            outcome,
            EmitOutcome::Delivered {
                handlers: 0,
                failed: 0,
                skipped: 0
            }
        );
        assert_eq!(bus.stats().counters.events_emitted, 1);
    }

    #[test]
    fn test_subscribers_fire_in_subscription_order() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(name, "greet", move |_, _| {
                order.lock().push(name);
                Ok(())
            });
        }
        assert_eq!(bus.emit("greet", json!({})).delivered(), 3);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_envelope_annotates_payload() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        bus.subscribe("observer", "chat:message", move |_, event| {
            *sink.lock() = Some(event.clone());
            Ok(())
        });
        bus.emit_from("greeter", "chat:message", json!({"room": "lobby", "message": "hi"}));

        let event = seen.lock().clone().unwrap();
        assert_eq!(event.source_module, "greeter");
        assert_eq!(event.room.as_deref(), Some("lobby"));
        assert_eq!(event.str_field("sourceModule"), Some("greeter"));
        assert!(event.payload.get("timestamp").is_some());
        assert_eq!(event.sequence_id, 1);
    }

    #[test]
    fn test_handler_error_is_contained() {
        let bus = EventBus::default();
        let after = counter();
        let errors = counter();
        bus.subscribe("faulty", "x", |_, _| Err(Error::internal("nope")));
        let hits = Arc::clone(&after);
        bus.subscribe("healthy", "x", move |_, _| {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let seen = Arc::clone(&errors);
        bus.subscribe("watcher", topics::EVENTBUS_ERROR, move |_, event| {
            assert_eq!(event.str_field("moduleId"), Some("faulty"));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let outcome = bus.emit("x", json!({}));
        assert_eq!(
            outcome,
            EmitOutcome::Delivered {
                handlers: 1,
                failed: 1,
                skipped: 0
            }
        );
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().counters.handler_errors, 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let bus = EventBus::default();
        bus.subscribe("faulty", "x", |_, _| panic!("handler exploded"));
        let outcome = bus.emit("x", json!({}));
        assert!(matches!(outcome, EmitOutcome::Delivered { failed: 1, .. }));
        assert_eq!(bus.current_depth(), 0);
    }

    #[test]
    fn test_failing_error_handler_is_not_reraised() {
        let bus = EventBus::default();
        bus.subscribe("faulty", "x", |_, _| Err(Error::internal("first")));
        bus.subscribe("faulty-watcher", topics::EVENTBUS_ERROR, |_, _| {
            Err(Error::internal("second"))
        });
        bus.emit("x", json!({}));
        let stats = bus.stats();
        assert_eq!(stats.counters.handler_errors, 2);
        assert_eq!(stats.counters.per_event.get(topics::EVENTBUS_ERROR), Some(&1));
    }

    #[test]
    fn test_room_allowlist_filters_handlers() {
        let bus = EventBus::default();
        let hits = counter();
        bus.register_module("trivia", ["games"]);
        let h = Arc::clone(&hits);
        bus.subscribe("trivia", "chat:message", move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let skipped = bus.emit("chat:message", json!({"room": "lobby", "message": "a"}));
        assert!(matches!(skipped, EmitOutcome::Delivered { skipped: 1, .. }));
        bus.emit("chat:message", json!({"room": "games", "message": "b"}));
        bus.emit("chat:message", json!({"message": "no room"}));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_and_bulk_teardown() {
        let bus = EventBus::default();
        bus.subscribe("media", "a", |_, _| Ok(()));
        bus.subscribe("media", "b", |_, _| Ok(()));
        bus.subscribe("media", "b", |_, _| Ok(()));
        bus.subscribe("economy", "b", |_, _| Ok(()));
        assert_eq!(bus.subscriptions_for("media"), vec!["a", "b"]);

        assert_eq!(bus.unsubscribe("media", "b"), 2);
        assert_eq!(bus.subscriptions_for("media"), vec!["a"]);
        assert_eq!(bus.listener_count("b"), 1);

        bus.register_module("economy", Vec::<String>::new());
        assert_eq!(bus.unregister_module("economy"), 1);
        assert_eq!(bus.listener_count("b"), 0);
        assert_eq!(bus.unsubscribe_all("media"), 1);
        assert_eq!(bus.stats().active_subscriptions, 0);
    }

    #[test]
    fn test_unsubscribe_id() {
        let bus = EventBus::default();
        let id = bus.subscribe("media", "a", |_, _| Ok(()));
        bus.subscribe("media", "a", |_, _| Ok(()));
        assert!(bus.unsubscribe_id(id));
        assert!(!bus.unsubscribe_id(id));
        assert_eq!(bus.listener_count("a"), 1);
        assert_eq!(bus.subscriptions_for("media"), vec!["a"]);
    }

    #[test]
    fn test_unsubscribe_during_dispatch_uses_snapshot() {
        let bus = EventBus::default();
        let hits = counter();
        bus.subscribe("first", "x", |bus, _| {
            bus.unsubscribe_all("second");
            Ok(())
        });
        let h = Arc::clone(&hits);
        bus.subscribe("second", "x", move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.emit("x", json!({}));
        bus.emit("x", json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_nested_emit_completes_before_return() {
        let bus = EventBus::default();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o = Arc::clone(&order);
        bus.subscribe("a", "outer", move |bus, _| {
            o.lock().push("outer-before");
            bus.emit_from("a", "inner", json!({}));
            o.lock().push("outer-after");
            Ok(())
        });
        let o = Arc::clone(&order);
        bus.subscribe("b", "inner", move |_, _| {
            o.lock().push("inner");
            Ok(())
        });
        bus.emit("outer", json!({}));
        assert_eq!(*order.lock(), vec!["outer-before", "inner", "outer-after"]);
        assert_eq!(bus.stats().max_depth, 2);
        assert_eq!(bus.current_depth(), 0);
    }

    #[test]
    fn test_duplicate_within_window_invokes_once() {
        let bus = EventBus::default();
        let hits = counter();
        let h = Arc::clone(&hits);
        bus.subscribe("logger", "chat:message", move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let payload = json!({"message": "hello", "room": "lobby", "username": "ana"});
        assert!(bus.emit("chat:message", payload.clone()).is_delivered());
        assert_eq!(
            bus.emit("chat:message", payload),
            EmitOutcome::Blocked(ProtectionTrip::Duplicate)
        );
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().counters.duplicates_dropped, 1);
    }

    #[test]
    fn test_rate_limit_drops_excess() {
        let bus = EventBus::new(EventBusConfig {
            max_events_per_second: 3,
            ..permissive()
        });
        let limited = counter();
        let l = Arc::clone(&limited);
        bus.subscribe("watcher", topics::RATE_LIMITED, move |_, _| {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        for _ in 0..3 {
            assert!(bus.emit("tick", json!({})).is_delivered());
        }
        assert!(matches!(
            bus.emit("tick", json!({})),
            EmitOutcome::Blocked(ProtectionTrip::RateLimited { events_last_second: 3 })
        ));
        assert_eq!(limited.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_self_reemitting_handler_is_blocked() {
        let bus = EventBus::new(permissive());
        let invocations = counter();
        let inv = Arc::clone(&invocations);
        bus.subscribe("echo", "x", move |bus, _| {
            inv.fetch_add(1, Ordering::SeqCst);
            bus.emit_from("echo", "x", json!({}));
            Ok(())
        });
        let blocked = counter();
        let b = Arc::clone(&blocked);
        bus.subscribe("watcher", topics::RECURSION_BLOCKED, move |_, _| {
            b.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit_from("echo", "x", json!({}));
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        assert_eq!(blocked.load(Ordering::SeqCst), 1);
        assert_eq!(bus.current_depth(), 0);
        assert_eq!(bus.stats().counters.recursions_blocked, 1);
    }

    #[test]
    fn test_loop_tolerance_allows_bounded_repeats() {
        let bus = EventBus::new(EventBusConfig {
            max_loop_occurrences: 3,
            ..permissive()
        });
        let invocations = counter();
        let inv = Arc::clone(&invocations);
        bus.subscribe("echo", "x", move |bus, _| {
            inv.fetch_add(1, Ordering::SeqCst);
            bus.emit_from("echo", "x", json!({}));
            Ok(())
        });
        bus.emit_from("echo", "x", json!({}));
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
        assert_eq!(bus.stats().counters.recursions_detected, 3);
    }

    #[test]
    fn test_stack_shutdown_aborts_deep_chain() {
        let bus = EventBus::new(EventBusConfig {
            stack: StackThresholds {
                warning: 2,
                critical: 4,
                emergency: 6,
                shutdown: 8,
            },
            ..permissive()
        });
        let depth_reached = counter();
        let d = Arc::clone(&depth_reached);
        bus.subscribe("chain", "hop", move |bus, event| {
            d.fetch_add(1, Ordering::SeqCst);
            let n = event.payload["n"].as_u64().unwrap_or(0);
            // A new source per hop defeats the loop detector.
            bus.emit_from(&format!("hop-{n}"), "hop", json!({"n": n + 1}));
            Ok(())
        });
        let shutdowns = counter();
        let s = Arc::clone(&shutdowns);
        bus.subscribe("watcher", topics::EMERGENCY_SHUTDOWN, move |_, _| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit("hop", json!({"n": 0}));
        assert_eq!(depth_reached.load(Ordering::SeqCst), 7);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        let stats = bus.stats();
        assert_eq!(stats.current_depth, 0);
        assert_eq!(stats.counters.stack_aborts, 1);
        assert_eq!(stats.depth_trips.emergencies, 1);
    }

    #[test]
    fn test_protection_signals_bypass_pipeline() {
        let bus = EventBus::new(EventBusConfig {
            max_events_per_second: 1,
            ..permissive()
        });
        bus.emit("tick", json!({}));
        assert!(bus.emit("tick", json!({})).is_blocked());
        assert!(bus.emit(topics::STACK_WARNING, json!({})).is_delivered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_recovers() {
        let bus = EventBus::new(EventBusConfig {
            breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                window: std::time::Duration::from_secs(10),
                cooldown: std::time::Duration::from_secs(5),
            },
            ..permissive()
        });
        bus.subscribe("faulty", "x", |_, _| Err(Error::internal("bad")));
        bus.emit("x", json!({}));
        bus.emit("x", json!({}));
        assert_eq!(bus.breaker_state(), BreakerState::Open);
        assert_eq!(
            bus.emit("y", json!({})),
            EmitOutcome::Blocked(ProtectionTrip::CircuitOpen)
        );

        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        assert!(bus.emit("y", json!({})).is_delivered());
        assert_eq!(bus.breaker_state(), BreakerState::Closed);
    }

    #[test]
    fn test_recent_events_bounded() {
        let bus = EventBus::new(EventBusConfig {
            event_history: 2,
            ..EventBusConfig::default()
        });
        bus.emit("a", json!({}));
        bus.emit("b", json!({}));
        bus.emit("c", json!({}));
        let names: Vec<String> = bus.recent_events(10).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_reset_stats() {
        let bus = EventBus::default();
        for _ in 0..5 {
            bus.emit("test.event", json!({}));
        }
        assert_eq!(bus.stats().counters.events_emitted, 5);
        bus.reset_stats();
        assert_eq!(bus.stats().counters.events_emitted, 0);
    }
}
