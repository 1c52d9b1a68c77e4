//! Task records, handlers and snapshots.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::Result;

/// Scheduled task body. Invoked once per execution.
pub type TaskHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Build a [`TaskHandler`] from an async closure.
///
/// ```
/// use modhost_core::scheduler::task_fn;
///
/// let handler = task_fn(|| async { Ok(()) });
/// # let _ = handler;
/// ```
pub fn task_fn<F, Fut>(f: F) -> TaskHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

/// Kind of trigger driving a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Cron,
    Interval,
    Timeout,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Cron => "cron",
            TaskKind::Interval => "interval",
            TaskKind::Timeout => "timeout",
        }
    }
}

/// Per-task scheduling options.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Owning module. Prefixes the task key and enables bulk removal.
    pub module: Option<String>,
    /// Timezone override for cron tasks.
    pub timezone: Option<String>,
    /// Run once as soon as the task is scheduled.
    pub run_immediately: bool,
}

impl TaskOptions {
    pub fn for_module(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            ..Self::default()
        }
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn run_immediately(mut self) -> Self {
        self.run_immediately = true;
        self
    }
}

/// Execution statistics for one task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStats {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    /// Executions re-queued because the concurrency gate was saturated.
    pub deferrals: u64,
    /// Executions given up after exceeding the re-queue bound.
    pub dropped: u64,
    #[serde(with = "humantime_serde")]
    pub total_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub last_duration: Option<Duration>,
    pub last_error: Option<String>,
}

impl TaskStats {
    pub fn average_duration(&self) -> Option<Duration> {
        if self.runs == 0 {
            return None;
        }
        u32::try_from(self.runs)
            .ok()
            .map(|runs| self.total_duration / runs)
    }
}

/// Read-only snapshot of a scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub key: String,
    pub id: String,
    pub module: Option<String>,
    pub kind: TaskKind,
    /// Human-readable trigger: cron expression, period or delay.
    pub schedule: String,
    pub enabled: bool,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub stats: TaskStats,
}

/// Result of one `execute_task` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { duration: Duration },
    Failed { error: String, duration: Duration },
    /// The re-queue bound was exceeded while the gate stayed saturated.
    Dropped { requeues: u32 },
    /// The task was removed, paused or the scheduler stopped while waiting.
    Cancelled,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { .. })
    }
}

/// Parsed trigger owned by a task record.
#[derive(Debug, Clone)]
pub(crate) enum Trigger {
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
        tz: Tz,
    },
    Interval {
        period: Duration,
    },
    Timeout {
        delay: Duration,
        fire_at: Instant,
    },
}

impl Trigger {
    pub(crate) fn kind(&self) -> TaskKind {
        match self {
            Trigger::Cron { .. } => TaskKind::Cron,
            Trigger::Interval { .. } => TaskKind::Interval,
            Trigger::Timeout { .. } => TaskKind::Timeout,
        }
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Trigger::Cron { expression, tz, .. } => format!("{expression} ({tz})"),
            Trigger::Interval { period } => format!("every {period:?}"),
            Trigger::Timeout { delay, .. } => format!("after {delay:?}"),
        }
    }

    /// Next fire time in UTC after `after`, for cron triggers.
    pub(crate) fn next_cron_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron { schedule, tz, .. } => schedule
                .after(&after.with_timezone(tz))
                .next()
                .map(|next| next.with_timezone(&Utc)),
            _ => None,
        }
    }
}

/// Live task record.
pub(crate) struct TaskRecord {
    pub(crate) id: String,
    pub(crate) module: Option<String>,
    pub(crate) trigger: Trigger,
    pub(crate) handler: TaskHandler,
    pub(crate) enabled: bool,
    pub(crate) running: bool,
    /// Distinguishes a record from a later one reusing the same key.
    pub(crate) generation: u64,
    pub(crate) token: CancellationToken,
    pub(crate) last_run: Option<DateTime<Utc>>,
    pub(crate) next_run: Option<DateTime<Utc>>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) stats: TaskStats,
}

impl TaskRecord {
    pub(crate) fn snapshot(&self, key: &str) -> TaskInfo {
        TaskInfo {
            key: key.to_string(),
            id: self.id.clone(),
            module: self.module.clone(),
            kind: self.trigger.kind(),
            schedule: self.trigger.describe(),
            enabled: self.enabled,
            running: self.running,
            last_run: self.last_run,
            next_run: self.next_run,
            created_at: self.created_at,
            stats: self.stats.clone(),
        }
    }
}

/// Task key: `"{module}:{id}"` when owned by a module, `id` otherwise.
pub fn task_key(id: &str, module: Option<&str>) -> String {
    match module {
        Some(module) => format!("{module}:{id}"),
        None => id.to_string(),
    }
}
