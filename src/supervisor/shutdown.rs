//! Graceful shutdown types.

use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::types::ShutdownId;

/// Shutdown future shared by every caller of `shutdown`.
pub type SharedShutdown = Shared<BoxFuture<'static, ShutdownReport>>;

/// Invoked with an exit code when graceful shutdown exceeds its timeout.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Exit code passed to the exit hook on a forced exit.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Default hook: terminate the process.
pub fn process_exit_hook() -> ExitHook {
    Arc::new(|code| std::process::exit(code))
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub id: ShutdownId,
    pub reason: String,
    /// Modules stopped, in stop order.
    pub stopped: Vec<String>,
    /// (module, error) for modules whose `stop` failed.
    pub failures: Vec<(String, String)>,
    pub tasks_cleared: usize,
    /// Modules and tasks did not finish within the shutdown timeout.
    pub timed_out: bool,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        !self.timed_out && self.failures.is_empty()
    }
}
