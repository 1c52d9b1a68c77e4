//! # Modhost Core - Module Runtime for Chat-Service Bots
//!
//! Runtime layer that hosts independently developed bot modules:
//! - Event bus with cascade protection (stack depth, rate limit, dedup,
//!   source-loop detection, circuit breaker)
//! - Module registry with dependency-ordered lifecycle
//! - Unified scheduler for cron, interval and one-shot tasks
//! - Error supervisor with bounded recovery, death-spiral detection and
//!   graceful shutdown
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────────────────────────────┐
//!                 │                Kernel                  │
//!                 │  ┌──────────┐  ┌──────────┐            │
//!   modules   →   │  │ Registry │  │Scheduler │            │
//!                 │  └────┬─────┘  └────┬─────┘            │
//!                 │       │  events     │  task:*          │
//!                 │  ┌────▼─────────────▼─────┐            │
//!                 │  │        EventBus        │◄── module  │
//!                 │  └────────────┬───────────┘    emits   │
//!                 │      module:error / eventbus:error     │
//!                 │  ┌────────────▼───────────┐            │
//!                 │  │      ErrorHandler      │            │
//!                 │  └────────────────────────┘            │
//!                 └────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod eventbus;
pub mod kernel;
pub mod scheduler;
pub mod supervisor;
pub mod types;

// Internal utilities
pub mod observability;

pub use eventbus::{EmitOutcome, Event, EventBus, EventBusConfig};
pub use kernel::{Kernel, Module, ModuleManifest, ModuleRegistry, ModuleStatus};
pub use scheduler::{SchedulerConfig, UnifiedScheduler};
pub use supervisor::{ErrorHandler, ErrorHandlerConfig};
pub use types::{Config, Error, ErrorKind, Result};
