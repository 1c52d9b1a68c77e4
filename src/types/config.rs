//! Configuration structures.
//!
//! Configuration is supplied at construction time as plain structs. Every
//! struct deserializes with defaults so a partial document is enough; reading
//! the document from disk or the environment is left to the host process.

use serde::{Deserialize, Serialize};

use crate::eventbus::EventBusConfig;
use crate::scheduler::SchedulerConfig;
use crate::supervisor::ErrorHandlerConfig;
use crate::types::Result;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Event bus and cascade protection.
    #[serde(default)]
    pub event_bus: EventBusConfig,

    /// Unified scheduler.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Error supervisor.
    #[serde(default)]
    pub error_handler: ErrorHandlerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON document; missing sections keep their defaults.
    pub fn from_json(document: &str) -> Result<Self> {
        Ok(serde_json::from_str(document)?)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing filter directive used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
