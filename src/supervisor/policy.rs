//! Recovery policy: configuration, fault classification and backoff.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, ErrorKind};

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Configuration
// =============================================================================

/// Death-spiral thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeathSpiralConfig {
    /// Errors recorded for one module above which emergency mode trips.
    pub max_errors: u32,
    /// Restarts of one module within `window` above which emergency mode trips.
    pub max_restarts: usize,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for DeathSpiralConfig {
    fn default() -> Self {
        Self {
            max_errors: 10,
            max_restarts: 5,
            window: Duration::from_secs(5 * 60),
        }
    }
}

/// Error supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    /// Automatic recovery attempts before a module is disabled.
    pub max_retries: u32,
    /// Backoff base.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Backoff cap.
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    /// Hard limit on graceful shutdown before the exit hook fires.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub max_restarts_per_hour: usize,
    pub max_restarts_per_day: usize,
    pub death_spiral: DeathSpiralConfig,
    /// How long emergency mode suspends automatic recovery.
    #[serde(with = "humantime_serde")]
    pub emergency_cooldown: Duration,
    /// How long a disabled module waits before one re-enable attempt.
    #[serde(with = "humantime_serde")]
    pub reenable_cooldown: Duration,
    /// Error kinds eligible for automatic recovery.
    pub recoverable: Vec<ErrorKind>,
    /// Process-level errors within `process_error_window` that trigger shutdown.
    pub process_error_burst: usize,
    #[serde(with = "humantime_serde")]
    pub process_error_window: Duration,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            max_restarts_per_hour: 10,
            max_restarts_per_day: 50,
            death_spiral: DeathSpiralConfig::default(),
            emergency_cooldown: Duration::from_secs(5 * 60),
            reenable_cooldown: Duration::from_secs(30 * 60),
            recoverable: ErrorKind::default_recoverable(),
            process_error_burst: 10,
            process_error_window: Duration::from_secs(60),
        }
    }
}

impl ErrorHandlerConfig {
    pub fn is_recoverable(&self, kind: ErrorKind) -> bool {
        self.recoverable.contains(&kind)
    }

    /// Backoff before recovery attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(self.retry_delay, self.max_retry_delay, attempt)
    }
}

/// `min(base * 2^(attempt-1), cap)`, saturating.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map(|d| d.min(cap))
        .unwrap_or(cap)
}

// =============================================================================
// Faults and dispositions
// =============================================================================

/// A failure attributed to a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFault {
    pub kind: ErrorKind,
    pub message: String,
}

impl ModuleFault {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Read a fault from a `module:error` or `eventbus:error` payload.
    pub fn from_payload(payload: &Value) -> Self {
        let kind = payload
            .get("kind")
            .cloned()
            .and_then(|k| serde_json::from_value(k).ok())
            .unwrap_or(ErrorKind::Unknown);
        let message = payload
            .get("error")
            .or_else(|| payload.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unspecified error")
            .to_string();
        Self { kind, message }
    }
}

impl From<&Error> for ModuleFault {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ModuleFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Why an error was not acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    ShuttingDown,
    Emergency,
    Disabled,
}

/// Why a module was disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DisableReason {
    DeathSpiral,
    RetriesExhausted,
    HourlyQuota,
    DailyQuota,
    Manual(String),
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::DeathSpiral => f.write_str("death spiral"),
            DisableReason::RetriesExhausted => f.write_str("retries exhausted"),
            DisableReason::HourlyQuota => f.write_str("hourly restart quota exceeded"),
            DisableReason::DailyQuota => f.write_str("daily restart quota exceeded"),
            DisableReason::Manual(reason) => write!(f, "manual: {reason}"),
        }
    }
}

/// What `handle_module_error` did with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    Ignored(IgnoreReason),
    /// Not recoverable; recorded only.
    Logged,
    RecoveryScheduled { attempt: u32, delay: Duration },
    /// A recovery is already pending for this module.
    RecoveryPending,
    Disabled(DisableReason),
}

// =============================================================================
// Per-module state
// =============================================================================

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// Armed timer that can be cancelled before it fires.
#[derive(Debug)]
pub(crate) struct PendingTimer {
    pub(crate) id: u64,
    pub(crate) token: CancellationToken,
    pub(crate) due: Instant,
}

impl PendingTimer {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
            due: Instant::now() + delay,
        }
    }
}

/// Supervisor bookkeeping for one module.
#[derive(Debug, Default)]
pub(crate) struct ModuleHealth {
    pub(crate) error_count: u32,
    pub(crate) restart_attempts: u32,
    /// Restart timestamps kept for the trailing day.
    pub(crate) restarts: VecDeque<Instant>,
    pub(crate) disabled: Option<DisableReason>,
    pub(crate) pending_recovery: Option<PendingTimer>,
    pub(crate) pending_reenable: Option<PendingTimer>,
    pub(crate) last_error: Option<ModuleFault>,
}

impl ModuleHealth {
    pub(crate) fn restarts_within(&self, window: Duration, now: Instant) -> usize {
        self.restarts
            .iter()
            .filter(|ts| now.saturating_duration_since(**ts) <= window)
            .count()
    }

    pub(crate) fn restarts_last_hour(&self, now: Instant) -> usize {
        self.restarts_within(HOUR, now)
    }

    pub(crate) fn restarts_last_day(&self, now: Instant) -> usize {
        self.restarts_within(DAY, now)
    }

    pub(crate) fn record_restart(&mut self, now: Instant) {
        self.restarts.push_back(now);
        while let Some(ts) = self.restarts.front() {
            if now.saturating_duration_since(*ts) > DAY {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Error count or recent restarts above the death-spiral thresholds.
    pub(crate) fn in_death_spiral(&self, config: &DeathSpiralConfig, now: Instant) -> bool {
        self.error_count > config.max_errors
            || self.restarts_within(config.window, now) > config.max_restarts
    }

    pub(crate) fn cancel_recovery(&mut self) -> bool {
        match self.pending_recovery.take() {
            Some(timer) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel_reenable(&mut self) -> bool {
        match self.pending_reenable.take() {
            Some(timer) => {
                timer.token.cancel();
                true
            }
            None => false,
        }
    }
}
