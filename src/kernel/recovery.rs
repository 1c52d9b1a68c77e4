//! Panic recovery utilities.
//!
//! A panicking event handler, module lifecycle hook or scheduled task must not
//! take the host process down. These helpers capture the panic, log it and
//! convert it into [`Error::Panic`] so the caller can count and route it like
//! any other failure.

use crate::types::{Error, Result};
use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function with panic recovery.
///
/// # Example
/// ```
/// use modhost_core::kernel::with_recovery;
///
/// let result = with_recovery(|| Ok(7), "my_operation");
/// assert_eq!(result.unwrap(), 7);
/// ```
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Error::Panic(format!("{}: {}", operation_name, panic_msg)))
        }
    }
}

/// Execute an async operation with panic recovery.
///
/// Panics raised while building the future *and* while polling it are caught.
pub async fn with_recovery_async<F, Fut, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let future = match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(fut) => fut,
        Err(panic_payload) => return Err(panic_error(operation_name, &panic_payload)),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic_payload) => Err(panic_error(operation_name, &panic_payload)),
    }
}

fn panic_error(operation_name: &str, payload: &Box<dyn std::any::Any + Send>) -> Error {
    let panic_msg = extract_panic_message(payload);
    tracing::error!(
        "async_panic_recovered: operation={}, panic={}",
        operation_name,
        panic_msg
    );
    Error::Panic(format!("{}: {}", operation_name, panic_msg))
}

/// Extract panic message from panic payload.
pub(crate) fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn test_with_recovery_success() {
        let result = with_recovery(|| Ok(42), "test_operation");
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_with_recovery_error_passes_through() {
        let result: Result<()> = with_recovery(
            || Err(Error::validation("specific validation error")),
            "test_operation",
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("specific validation error"));
    }

    #[test]
    fn test_with_recovery_panic_str() {
        let result: Result<()> = with_recovery(
            || {
                panic!("test panic");
            },
            "handler greeter/chat:message",
        );

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Panic);
        let err_msg = err.to_string();
        assert!(err_msg.contains("handler greeter/chat:message"));
        assert!(err_msg.contains("test panic"));
    }

    #[test]
    fn test_extract_panic_message_string() {
        let panic_result = std::panic::catch_unwind(|| {
            panic!("{}", "formatted message");
        });

        match panic_result {
            Err(payload) => {
                let msg = extract_panic_message(&payload);
                assert!(msg.contains("formatted message"));
            }
            Ok(_) => panic!("Expected panic"),
        }
    }

    #[tokio::test]
    async fn test_with_recovery_async_success() {
        let result = with_recovery_async(|| async { Ok(42) }, "async_test").await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_recovery_async_catches_panic_while_polling() {
        let result: Result<()> = with_recovery_async(
            || async {
                tokio::task::yield_now().await;
                panic!("boom after yield");
            },
            "module start",
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Panic);
        assert!(err.to_string().contains("boom after yield"));
    }
}
