//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. [`ErrorKind`] is the closed classification
//! the supervisor uses to decide whether a failure is worth an automatic restart.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Lifecycle phase a module failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePhase {
    Init,
    Start,
    Stop,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::Init => "init",
            LifecyclePhase::Start => "start",
            LifecyclePhase::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Closed classification of failures.
///
/// Recoverability is decided by looking a kind up in the supervisor's
/// configurable table, never by matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionReset,
    ConnectionRefused,
    Timeout,
    StorageBusy,
    RateLimited,
    NotFound,
    InvalidInput,
    InvalidState,
    Dependency,
    Panic,
    Internal,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionReset => "connection_reset",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::Timeout => "timeout",
            ErrorKind::StorageBusy => "storage_busy",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Panic => "panic",
            ErrorKind::Internal => "internal",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Kinds treated as transient by default.
    pub fn default_recoverable() -> Vec<ErrorKind> {
        vec![
            ErrorKind::ConnectionReset,
            ErrorKind::ConnectionRefused,
            ErrorKind::Timeout,
            ErrorKind::StorageBusy,
        ]
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error enum for the module runtime.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid lifecycle state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("timeout: {0}")]
    Timeout(String),

    /// A panic was caught and converted.
    #[error("panic: {0}")]
    Panic(String),

    #[error("module already registered: {0}")]
    DuplicateModule(String),

    #[error("module {module} requires unregistered module {requires}")]
    MissingDependency { module: String, requires: String },

    #[error("dependency cycle detected: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("module {module} is still required by {}", .dependents.join(", "))]
    ModuleInUse {
        module: String,
        dependents: Vec<String>,
    },

    /// A module's own `init`/`start`/`stop` failed.
    #[error("module {module} failed during {phase}: {source}")]
    Lifecycle {
        module: String,
        phase: LifecyclePhase,
        #[source]
        source: Box<Error>,
    },

    /// Typed failure reported by a hosted module.
    #[error("{kind}: {message}")]
    Module { kind: ErrorKind, message: String },

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("shutting down: {0}")]
    ShuttingDown(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify this error for recovery decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) | Error::InvalidSchedule(_) | Error::Serialization(_) => {
                ErrorKind::InvalidInput
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::StateTransition(_) | Error::ShuttingDown(_) | Error::Cancelled(_) => {
                ErrorKind::InvalidState
            }
            Error::Internal(_) => ErrorKind::Internal,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Panic(_) => ErrorKind::Panic,
            Error::DuplicateModule(_)
            | Error::MissingDependency { .. }
            | Error::DependencyCycle(_)
            | Error::ModuleInUse { .. } => ErrorKind::Dependency,
            Error::Lifecycle { source, .. } => source.kind(),
            Error::Module { kind, .. } => *kind,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => ErrorKind::ConnectionReset,
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotConnected => {
                    ErrorKind::ConnectionRefused
                }
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    ErrorKind::Timeout
                }
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                    ErrorKind::InvalidInput
                }
                _ => ErrorKind::Unknown,
            },
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn module(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::Module {
            kind,
            message: msg.into(),
        }
    }

    pub fn lifecycle(module: impl Into<String>, phase: LifecyclePhase, source: Error) -> Self {
        Self::Lifecycle {
            module: module.into(),
            phase,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_classify_as_transient() {
        let reset = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert_eq!(reset.kind(), ErrorKind::ConnectionReset);

        let timed_out = Error::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert_eq!(timed_out.kind(), ErrorKind::Timeout);

        let refused = Error::from(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(refused.kind(), ErrorKind::ConnectionRefused);
    }

    #[test]
    fn test_lifecycle_error_inherits_source_kind() {
        let err = Error::lifecycle("economy", LifecyclePhase::Start, Error::timeout("db"));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("economy failed during start"));
    }

    #[test]
    fn test_module_error_display() {
        let err = Error::module(ErrorKind::StorageBusy, "database is locked");
        assert_eq!(err.to_string(), "storage_busy: database is locked");
        assert_eq!(err.kind(), ErrorKind::StorageBusy);
    }

    #[test]
    fn test_cycle_display_joins_path() {
        let err = Error::DependencyCycle(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_error_kind_serde_snake_case() {
        let json = serde_json::to_string(&ErrorKind::StorageBusy).unwrap();
        assert_eq!(json, "\"storage_busy\"");
        let parsed: ErrorKind = serde_json::from_str("\"connection_reset\"").unwrap();
        assert_eq!(parsed, ErrorKind::ConnectionReset);
    }
}
