//! Kernel types: Module contract, ModuleManifest, ModuleStatus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Error, LifecyclePhase, Result};

/// Capability set every hosted module implements.
///
/// All three hooks are fallible and asynchronous. The registry calls them in
/// dependency order and never concurrently for the same module.
#[async_trait]
pub trait Module: Send + Sync {
    async fn init(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Declarative description of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Modules that must be initialized and started before this one.
    #[serde(default)]
    pub requires: Vec<String>,
    /// Capabilities this module offers to others.
    #[serde(default)]
    pub provides: Vec<String>,
    /// Ordering edges applied only when the target is registered.
    #[serde(default, alias = "optional_requires")]
    pub optional_requires: Vec<String>,
    /// Room allowlist. Empty means every room.
    #[serde(default)]
    pub rooms: Vec<String>,
}

impl ModuleManifest {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            requires: Vec::new(),
            provides: Vec::new(),
            optional_requires: Vec::new(),
            rooms: Vec::new(),
        }
    }

    pub fn requires<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn provides<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.provides.extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn optional_requires<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_requires.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn rooms<I, S>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rooms.extend(rooms.into_iter().map(Into::into));
        self
    }
}

/// Module lifecycle status.
///
/// State transitions:
/// ```text
/// REGISTERED → INITIALIZING → INITIALIZED → STARTING → STARTED → STOPPING → STOPPED
///                   ↓              ↓            ↓          ↓          ↓         │
///                 ERROR ←──────────┴────────────┴──────────┴──────────┘         │
///                   └──────────────→ INITIALIZING ←─────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Registered,
    Initializing,
    Initialized,
    Starting,
    Started,
    Stopping,
    Stopped,
    Error,
}

impl ModuleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleStatus::Registered => "registered",
            ModuleStatus::Initializing => "initializing",
            ModuleStatus::Initialized => "initialized",
            ModuleStatus::Starting => "starting",
            ModuleStatus::Started => "started",
            ModuleStatus::Stopping => "stopping",
            ModuleStatus::Stopped => "stopped",
            ModuleStatus::Error => "error",
        }
    }

    /// Check if the module is running or on its way up or down.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ModuleStatus::Starting | ModuleStatus::Started | ModuleStatus::Stopping
        )
    }

    /// Check if `init()` may be called from this status.
    pub fn can_initialize(self) -> bool {
        matches!(
            self,
            ModuleStatus::Registered | ModuleStatus::Stopped | ModuleStatus::Error
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: ModuleStatus) -> bool {
        use ModuleStatus::*;
        match (self, to) {
            (Registered, Initializing) => true,
            (Initializing, Initialized) => true,
            (Initialized, Starting) => true,
            (Starting, Started) => true,
            (Started, Stopping) => true,
            (Stopping, Stopped) => true,
            // Restarts
            (Stopped, Initializing) => true,
            (Error, Initializing) => true,
            // ERROR is reachable from every in-flight or settled step
            (Error, Error) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    /// Phase whose completion leads to this status, if any.
    pub fn phase(self) -> Option<LifecyclePhase> {
        match self {
            ModuleStatus::Initializing | ModuleStatus::Initialized => Some(LifecyclePhase::Init),
            ModuleStatus::Starting | ModuleStatus::Started => Some(LifecyclePhase::Start),
            ModuleStatus::Stopping | ModuleStatus::Stopped => Some(LifecyclePhase::Stop),
            ModuleStatus::Registered | ModuleStatus::Error => None,
        }
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a registered module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleInfo {
    pub id: String,
    pub manifest: ModuleManifest,
    pub status: ModuleStatus,
    pub last_error: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of stopping every started module.
#[derive(Debug, Default)]
pub struct StopReport {
    /// Modules stopped successfully, in stop order.
    pub stopped: Vec<String>,
    pub failures: Vec<(String, Error)>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}
