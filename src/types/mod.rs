//! Core types for the module runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (RequestId, ShutdownId)
//! - **Errors**: Application error types with thiserror derives and the
//!   closed `ErrorKind` classification
//! - **Config**: Aggregated construction-time configuration

mod config;
mod errors;
mod ids;

pub use config::{Config, ObservabilityConfig};
pub use errors::{Error, ErrorKind, LifecyclePhase, Result};
pub use ids::{RequestId, ShutdownId};
