//! Well-known event names published by the runtime.

// Protection signals. These bypass the protection pipeline.
pub const STACK_WARNING: &str = "protection:stack_warning";
pub const STACK_CRITICAL: &str = "protection:stack_critical";
pub const STACK_EMERGENCY: &str = "protection:stack_emergency";
pub const EMERGENCY_SHUTDOWN: &str = "protection:emergency_shutdown";
pub const RATE_LIMITED: &str = "protection:rate_limited";
pub const RECURSION_DETECTED: &str = "protection:recursion_detected";
pub const RECURSION_BLOCKED: &str = "protection:recursion_blocked";
pub const CIRCUIT_OPEN: &str = "protection:circuit_open";
pub const CIRCUIT_CLOSED: &str = "protection:circuit_closed";

pub const EVENTBUS_ERROR: &str = "eventbus:error";

// Module lifecycle
pub const MODULE_REGISTERED: &str = "module:registered";
pub const MODULE_UNREGISTERED: &str = "module:unregistered";
pub const MODULE_INITIALIZED: &str = "module:initialized";
pub const MODULE_STARTED: &str = "module:started";
pub const MODULE_STOPPED: &str = "module:stopped";
pub const MODULE_STATUS_CHANGED: &str = "module:status-changed";
pub const MODULE_ERROR: &str = "module:error";
pub const MODULE_RECOVERED: &str = "module:recovered";
pub const MODULE_DISABLED: &str = "module:disabled";
pub const MODULE_REENABLED: &str = "module:reenabled";

pub const EMERGENCY_DEATH_SPIRAL: &str = "emergency:death-spiral";
pub const EMERGENCY_CLEARED: &str = "emergency:cleared";

// Scheduler
pub const TASK_SCHEDULED: &str = "task:scheduled";
pub const TASK_START: &str = "task:start";
pub const TASK_COMPLETE: &str = "task:complete";
pub const TASK_ERROR: &str = "task:error";
pub const TASK_REMOVED: &str = "task:removed";
pub const TASK_PAUSED: &str = "task:paused";
pub const TASK_RESUMED: &str = "task:resumed";
pub const SCHEDULER_STOPPED: &str = "scheduler:stopped";
