//! Re-entrancy depth tracking for synchronous event dispatch.
//!
//! Every protected emission enters the monitor and receives a [`DepthGuard`].
//! The guard decrements the depth when dropped, so the counter returns to its
//! pre-emit value on every exit path, including handler panics.
//!
//! Depth is tracked per dispatching thread: a synchronous dispatch tree never
//! crosses threads, and tracking per thread keeps two unrelated dispatch trees
//! from inflating each other's depth.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

/// Depth thresholds for nested emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackThresholds {
    pub warning: usize,
    pub critical: usize,
    pub emergency: usize,
    /// Emissions at or beyond this depth are aborted.
    pub shutdown: usize,
}

impl Default for StackThresholds {
    fn default() -> Self {
        Self {
            warning: 16,
            critical: 32,
            emergency: 48,
            shutdown: 64,
        }
    }
}

/// Classification of a dispatch depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthLevel {
    Normal,
    Warning,
    Critical,
    Emergency,
    Shutdown,
}

impl DepthLevel {
    /// Protection signal raised when the depth crosses into this level.
    pub fn signal(self) -> Option<&'static str> {
        match self {
            DepthLevel::Normal => None,
            DepthLevel::Warning => Some(super::topics::STACK_WARNING),
            DepthLevel::Critical => Some(super::topics::STACK_CRITICAL),
            DepthLevel::Emergency => Some(super::topics::STACK_EMERGENCY),
            DepthLevel::Shutdown => Some(super::topics::EMERGENCY_SHUTDOWN),
        }
    }
}

/// Counters of level crossings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepthTrips {
    pub warnings: u64,
    pub criticals: u64,
    pub emergencies: u64,
    pub shutdowns: u64,
}

/// Tracks synchronous dispatch depth.
#[derive(Debug)]
pub struct StackDepthMonitor {
    thresholds: StackThresholds,
    depths: Mutex<HashMap<ThreadId, usize>>,
    max_depth: AtomicUsize,
    warnings: AtomicU64,
    criticals: AtomicU64,
    emergencies: AtomicU64,
    shutdowns: AtomicU64,
}

impl StackDepthMonitor {
    pub fn new(thresholds: StackThresholds) -> Self {
        Self {
            thresholds,
            depths: Mutex::new(HashMap::new()),
            max_depth: AtomicUsize::new(0),
            warnings: AtomicU64::new(0),
            criticals: AtomicU64::new(0),
            emergencies: AtomicU64::new(0),
            shutdowns: AtomicU64::new(0),
        }
    }

    pub fn thresholds(&self) -> StackThresholds {
        self.thresholds
    }

    /// Classify a depth against the configured thresholds.
    pub fn classify(&self, depth: usize) -> DepthLevel {
        let t = &self.thresholds;
        if depth >= t.shutdown {
            DepthLevel::Shutdown
        } else if depth >= t.emergency {
            DepthLevel::Emergency
        } else if depth >= t.critical {
            DepthLevel::Critical
        } else if depth >= t.warning {
            DepthLevel::Warning
        } else {
            DepthLevel::Normal
        }
    }

    /// Enter one level of dispatch on the current thread.
    pub fn enter(&self) -> DepthGuard<'_> {
        self.enter_inner(true)
    }

    /// Enter without counting level crossings. Used for protection signals,
    /// which must still be depth-bounded but are not protected emissions.
    pub fn enter_quiet(&self) -> DepthGuard<'_> {
        self.enter_inner(false)
    }

    fn enter_inner(&self, count_trips: bool) -> DepthGuard<'_> {
        let thread = thread::current().id();
        let depth = {
            let mut depths = self.depths.lock();
            let entry = depths.entry(thread).or_insert(0);
            *entry += 1;
            *entry
        };
        self.max_depth.fetch_max(depth, Ordering::Relaxed);

        let level = self.classify(depth);
        let crossed = level != self.classify(depth - 1);
        if crossed && count_trips {
            let counter = match level {
                DepthLevel::Normal => None,
                DepthLevel::Warning => Some(&self.warnings),
                DepthLevel::Critical => Some(&self.criticals),
                DepthLevel::Emergency => Some(&self.emergencies),
                DepthLevel::Shutdown => Some(&self.shutdowns),
            };
            if let Some(counter) = counter {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }

        DepthGuard {
            monitor: self,
            thread,
            depth,
            level,
            crossed,
        }
    }

    /// Current depth on the calling thread.
    pub fn current_depth(&self) -> usize {
        self.depths
            .lock()
            .get(&thread::current().id())
            .copied()
            .unwrap_or(0)
    }

    /// Deepest nesting observed on any thread.
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    pub fn trips(&self) -> DepthTrips {
        DepthTrips {
            warnings: self.warnings.load(Ordering::Relaxed),
            criticals: self.criticals.load(Ordering::Relaxed),
            emergencies: self.emergencies.load(Ordering::Relaxed),
            shutdowns: self.shutdowns.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.max_depth.store(self.current_depth(), Ordering::Relaxed);
        self.warnings.store(0, Ordering::Relaxed);
        self.criticals.store(0, Ordering::Relaxed);
        self.emergencies.store(0, Ordering::Relaxed);
        self.shutdowns.store(0, Ordering::Relaxed);
    }

    fn leave(&self, thread: ThreadId) {
        let mut depths = self.depths.lock();
        if let Some(depth) = depths.get_mut(&thread) {
            *depth = depth.saturating_sub(1);
            if *depth == 0 {
                depths.remove(&thread);
            }
        }
    }
}

impl Default for StackDepthMonitor {
    fn default() -> Self {
        Self::new(StackThresholds::default())
    }
}

/// RAII handle for one dispatch level.
#[derive(Debug)]
pub struct DepthGuard<'a> {
    monitor: &'a StackDepthMonitor,
    thread: ThreadId,
    depth: usize,
    level: DepthLevel,
    crossed: bool,
}

impl DepthGuard<'_> {
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn level(&self) -> DepthLevel {
        self.level
    }

    /// True when this entry moved the depth into a new level.
    pub fn crossed_threshold(&self) -> bool {
        self.crossed
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.monitor.leave(self.thread);
    }
}
