//! Error reporting helpers for non-fatal paths
//!
//! The development watcher must never take the process down: its failures
//! are logged and treated as "nothing to reload".

use tracing::{debug, warn};

/// Execute an operation and log errors without failing
///
/// Returns `Some(T)` on success, `None` on error (after logging).
///
/// # Example
/// ```rust,ignore
/// let count = log_error(|| registry.rescan(), "Registry rescan failed");
/// ```
pub fn log_error<F, T, E>(operation: F, context: &str) -> Option<T>
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    match operation() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{}: {}", context, e);
            None
        }
    }
}

/// Execute an operation and return a default value on error
///
/// Failures are expected here (a file vanished between listing and stat),
/// so they are only logged at debug level.
pub fn with_default<F, T, E>(operation: F, default: T, context: &str) -> T
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    match operation() {
        Ok(value) => value,
        Err(e) => {
            debug!("{}: {}, using default", context, e);
            default
        }
    }
}
