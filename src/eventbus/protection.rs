//! Cascade protection primitives.
//!
//! Three small state machines owned by the bus, each driven with an explicit
//! `now` so they can be exercised deterministically:
//! - [`RateWindow`]: sliding one-second event counter
//! - [`DedupCache`]: fingerprint cache with TTL
//! - [`CircuitBreaker`]: closed/open/half-open breaker over protection failures

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// Configuration
// =============================================================================

/// Duplicate-suppression configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Repeats within this window are dropped.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Payload keys that make up the fingerprint together with the event name.
    pub key_fields: Vec<String>,
    /// Upper bound on remembered fingerprints.
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_millis(500),
            key_fields: vec![
                "message".to_string(),
                "room".to_string(),
                "username".to_string(),
            ],
            max_entries: 1000,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` that open the breaker.
    pub failure_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Time spent open before a half-open trial is allowed.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Rate window
// =============================================================================

/// Sliding window counting emissions in the trailing period.
#[derive(Debug)]
pub struct RateWindow {
    timestamps: VecDeque<Instant>,
    period: Duration,
    cap: usize,
}

impl RateWindow {
    pub fn new(cap: usize) -> Self {
        Self::with_period(cap, Duration::from_secs(1))
    }

    pub fn with_period(cap: usize, period: Duration) -> Self {
        Self {
            timestamps: VecDeque::new(),
            period,
            cap,
        }
    }

    /// Record an emission if the window has room.
    ///
    /// Returns the number of emissions already in the window when it is full.
    pub fn check_and_record(&mut self, now: Instant) -> std::result::Result<(), usize> {
        self.prune(now);
        if self.timestamps.len() >= self.cap {
            return Err(self.timestamps.len());
        }
        self.timestamps.push_back(now);
        Ok(())
    }

    /// Emissions in the trailing window.
    pub fn current(&mut self, now: Instant) -> usize {
        self.prune(now);
        self.timestamps.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&ts) = self.timestamps.front() {
            if now.saturating_duration_since(ts) >= self.period {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

// =============================================================================
// Deduplication
// =============================================================================

/// Recent-event fingerprint cache.
#[derive(Debug)]
pub struct DedupCache {
    config: DedupConfig,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupCache {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Build a fingerprint from the event name and the configured key fields.
    ///
    /// Payloads carrying none of the key fields have no fingerprint and are
    /// never deduplicated.
    pub fn fingerprint(&self, name: &str, payload: &Value) -> Option<String> {
        let mut fingerprint = name.to_string();
        let mut matched = false;
        for key in &self.config.key_fields {
            if let Some(value) = payload.get(key) {
                matched = true;
                fingerprint.push('|');
                fingerprint.push_str(key);
                fingerprint.push('=');
                match value {
                    Value::String(s) => fingerprint.push_str(s),
                    other => fingerprint.push_str(&other.to_string()),
                }
            }
        }
        matched.then_some(fingerprint)
    }

    /// Returns true when the fingerprint was seen within the window.
    /// Otherwise records it and returns false.
    pub fn is_duplicate(&mut self, fingerprint: &str, now: Instant) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.prune(now);
        if self.seen.contains_key(fingerprint) {
            return true;
        }
        while self.order.len() >= self.config.max_entries {
            match self.order.pop_front() {
                Some((old, _)) => {
                    self.seen.remove(&old);
                }
                None => break,
            }
        }
        self.seen.insert(fingerprint.to_string(), now);
        self.order.push_back((fingerprint.to_string(), now));
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn prune(&mut self, now: Instant) {
        while let Some((_, ts)) = self.order.front() {
            if now.saturating_duration_since(*ts) >= self.config.window {
                if let Some((fp, _)) = self.order.pop_front() {
                    self.seen.remove(&fp);
                }
            } else {
                break;
            }
        }
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Result of asking the breaker whether an emission may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed.
    Admitted,
    /// The single half-open trial; report its outcome with `finish_trial`.
    Trial,
    Rejected,
}

/// Point-in-time breaker view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: usize,
    /// Remaining open time, if open.
    #[serde(with = "humantime_serde")]
    pub open_for: Option<Duration>,
    pub times_opened: u64,
}

/// Circuit breaker over protection-relevant failures.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: BreakerState,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    trial_in_flight: bool,
    times_opened: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            failures: VecDeque::new(),
            open_until: None,
            trial_in_flight: false,
            times_opened: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Decide whether an emission may proceed.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Admitted,
            BreakerState::Open => {
                let cooled = self.open_until.map(|until| now >= until).unwrap_or(true);
                if cooled {
                    self.state = BreakerState::HalfOpen;
                    self.trial_in_flight = true;
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
            BreakerState::HalfOpen => {
                if self.trial_in_flight {
                    Admission::Rejected
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Record a failure. Returns true if this failure opened the breaker.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Open => false,
            // The in-flight trial decides the outcome on its own.
            BreakerState::HalfOpen if self.trial_in_flight => false,
            BreakerState::HalfOpen => {
                self.open(now);
                true
            }
            BreakerState::Closed => {
                self.failures.push_back(now);
                self.prune(now);
                if self.failures.len() >= self.config.failure_threshold {
                    self.open(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Report the outcome of the half-open trial.
    pub fn finish_trial(&mut self, success: bool, now: Instant) -> BreakerState {
        self.trial_in_flight = false;
        if self.state != BreakerState::HalfOpen {
            return self.state;
        }
        if success {
            self.state = BreakerState::Closed;
            self.failures.clear();
            self.open_until = None;
        } else {
            self.open(now);
        }
        self.state
    }

    pub fn snapshot(&self, now: Instant) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            failure_count: self.failures.len(),
            open_for: match (self.state, self.open_until) {
                (BreakerState::Open, Some(until)) => Some(until.saturating_duration_since(now)),
                _ => None,
            },
            times_opened: self.times_opened,
        }
    }

    pub fn reset(&mut self) {
        self.state = BreakerState::Closed;
        self.failures.clear();
        self.open_until = None;
        self.trial_in_flight = false;
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.open_until = Some(now + self.config.cooldown);
        self.failures.clear();
        self.trial_in_flight = false;
        self.times_opened += 1;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&ts) = self.failures.front() {
            if now.saturating_duration_since(ts) > self.config.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn breaker(threshold: usize) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(5),
        })
    }

    // =========================================================================
    // Rate window
    // =========================================================================

    #[test]
    fn test_rate_window_caps_events_per_second() {
        let mut window = RateWindow::new(3);
        let now = Instant::now();
        assert!(window.check_and_record(now).is_ok());
        assert!(window.check_and_record(now).is_ok());
        assert!(window.check_and_record(now).is_ok());
        assert_eq!(window.check_and_record(now), Err(3));
        assert_eq!(window.current(now), 3);
    }

    #[test]
    fn test_rate_window_slides() {
        let mut window = RateWindow::new(2);
        let start = Instant::now();
        window.check_and_record(start).unwrap();
        window.check_and_record(start).unwrap();
        assert!(window.check_and_record(start + Duration::from_millis(999)).is_err());
        assert!(window.check_and_record(start + Duration::from_secs(1)).is_ok());
    }

    // =========================================================================
    // Dedup
    // =========================================================================

    #[test]
    fn test_fingerprint_uses_key_fields() {
        let cache = DedupCache::new(DedupConfig::default());
        let fp = cache
            .fingerprint(
                "chat:message",
                &json!({"message": "hi", "room": "lobby", "username": "ana", "ts": 1}),
            )
            .unwrap();
        assert_eq!(fp, "chat:message|message=hi|room=lobby|username=ana");
    }

    #[test]
    fn test_fingerprint_absent_without_key_fields() {
        let cache = DedupCache::new(DedupConfig::default());
        assert!(cache.fingerprint("task:complete", &json!({"taskId": "x"})).is_none());
        assert!(cache.fingerprint("tick", &Value::Null).is_none());
    }

    #[test]
    fn test_duplicate_within_window() {
        let mut cache = DedupCache::new(DedupConfig::default());
        let now = Instant::now();
        assert!(!cache.is_duplicate("a", now));
        assert!(cache.is_duplicate("a", now + Duration::from_millis(100)));
        assert!(!cache.is_duplicate("a", now + Duration::from_millis(600)));
    }

    #[test]
    fn test_dedup_bounded() {
        let mut cache = DedupCache::new(DedupConfig {
            max_entries: 2,
            ..DedupConfig::default()
        });
        let now = Instant::now();
        cache.is_duplicate("a", now);
        cache.is_duplicate("b", now);
        cache.is_duplicate("c", now);
        assert_eq!(cache.len(), 2);
        assert!(!cache.is_duplicate("a", now));
    }

    #[test]
    fn test_dedup_disabled() {
        let mut cache = DedupCache::new(DedupConfig {
            enabled: false,
            ..DedupConfig::default()
        });
        let now = Instant::now();
        assert!(!cache.is_duplicate("a", now));
        assert!(!cache.is_duplicate("a", now));
    }

    // =========================================================================
    // Circuit breaker
    // =========================================================================

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut cb = breaker(3);
        let now = Instant::now();
        assert!(!cb.record_failure(now));
        assert!(!cb.record_failure(now));
        assert!(cb.record_failure(now));
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.admit(now + Duration::from_secs(1)), Admission::Rejected);
    }

    #[test]
    fn test_breaker_failures_outside_window_do_not_count() {
        let mut cb = breaker(2);
        let now = Instant::now();
        cb.record_failure(now);
        assert!(!cb.record_failure(now + Duration::from_secs(11)));
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_single_trial_closes() {
        let mut cb = breaker(1);
        let now = Instant::now();
        cb.record_failure(now);
        let later = now + Duration::from_secs(5);
        assert_eq!(cb.admit(later), Admission::Trial);
        assert_eq!(cb.state(), BreakerState::HalfOpen);
        assert_eq!(cb.admit(later), Admission::Rejected);
        assert_eq!(cb.finish_trial(true, later), BreakerState::Closed);
        assert_eq!(cb.admit(later), Admission::Admitted);
    }

    #[test]
    fn test_half_open_failed_trial_reopens() {
        let mut cb = breaker(1);
        let now = Instant::now();
        cb.record_failure(now);
        let later = now + Duration::from_secs(6);
        assert_eq!(cb.admit(later), Admission::Trial);
        assert_eq!(cb.finish_trial(false, later), BreakerState::Open);
        assert_eq!(cb.admit(later + Duration::from_secs(1)), Admission::Rejected);
        let snapshot = cb.snapshot(later);
        assert_eq!(snapshot.times_opened, 2);
        assert_eq!(snapshot.open_for, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_failure_during_trial_does_not_preempt_outcome() {
        let mut cb = breaker(1);
        let now = Instant::now();
        cb.record_failure(now);
        let later = now + Duration::from_secs(5);
        assert_eq!(cb.admit(later), Admission::Trial);
        assert!(!cb.record_failure(later));
        assert_eq!(cb.finish_trial(true, later), BreakerState::Closed);
    }
}
