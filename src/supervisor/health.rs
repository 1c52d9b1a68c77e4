//! Read-only supervisor introspection.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::policy::{DisableReason, ModuleFault};
use crate::eventbus::BreakerState;

/// Overall runtime health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Supervisor view of one module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleHealthSnapshot {
    pub module_id: String,
    pub error_count: u32,
    pub restart_attempts: u32,
    pub restarts_last_hour: usize,
    pub restarts_last_day: usize,
    pub disabled: Option<DisableReason>,
    pub recovery_pending: bool,
    pub reenable_pending: bool,
    pub last_error: Option<ModuleFault>,
}

/// Emergency mode details.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyInfo {
    pub trigger_module: String,
    #[serde(with = "humantime_serde")]
    pub remaining: Duration,
}

/// Monotonic supervisor counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorCounters {
    pub errors_handled: u64,
    pub errors_ignored: u64,
    pub recoveries_scheduled: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_failed: u64,
    pub modules_disabled: u64,
    pub modules_reenabled: u64,
    pub emergencies: u64,
    /// Subscriber failures routed to their owning module.
    pub handler_errors: u64,
    pub process_errors: u64,
    pub panics: u64,
}

/// Point-in-time supervisor status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub shutting_down: bool,
    pub emergency: Option<EmergencyInfo>,
    /// Modules the supervisor has seen errors for, sorted by id.
    pub modules: Vec<ModuleHealthSnapshot>,
    pub counters: SupervisorCounters,
}

/// Result of [`ErrorHandler::check_health`](super::ErrorHandler::check_health).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// Human-readable reasons for anything other than healthy.
    pub reasons: Vec<String>,
    pub breaker: BreakerState,
    pub disabled_modules: Vec<String>,
    pub failed_modules: Vec<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
