//! Panic recovery utilities.
//!
//! Agent implementations and event handlers are third-party code from the
//! kernel's point of view. A panic in one of them must surface as an error
//! on that operation, not tear down the cognitive loop or the bus.

use crate::types::{Error, Result};
use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function, converting a panic into an [`Error`].
///
/// The panic is captured and logged; callers see `Error::Internal` carrying
/// the panic message.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                msg
            );
            Err(Error::internal(format!(
                "Panic in {operation_name}: {msg}"
            )))
        }
    }
}

/// Async form of [`with_recovery`].
///
/// Panics are caught both while constructing the future and while polling
/// it, so a panicking `.await` point inside the operation still maps to an
/// error.
pub async fn with_recovery_async<F, Fut, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let guarded = AssertUnwindSafe(async move { operation().await }).catch_unwind();

    match guarded.await {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(
                "async_panic_recovered: operation={}, panic={}",
                operation_name,
                msg
            );
            Err(Error::internal(format!(
                "Panic in {operation_name}: {msg}"
            )))
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}
