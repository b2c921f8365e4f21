//! Lock utilities
//!
//! The module registry and the watcher's modification-time map are shared
//! behind `std::sync::Mutex`. These helpers keep the guard scoped to a
//! closure and turn poisoning into an error instead of a panic.

use std::fmt;
use std::sync::Mutex;
use tracing::warn;

/// A previous holder of the lock panicked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPoisoned;

impl fmt::Display for LockPoisoned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("lock poisoned")
    }
}

impl std::error::Error for LockPoisoned {}

/// Execute a closure with a Mutex lock, automatically releasing it
///
/// # Example
/// ```rust,ignore
/// let count = with_lock(&registry, |registry| registry.names().len())?;
/// ```
pub fn with_lock<T, F, R>(mutex: &Mutex<T>, f: F) -> Result<R, LockPoisoned>
where
    F: FnOnce(&mut T) -> R,
{
    match mutex.lock() {
        Ok(mut guard) => Ok(f(&mut guard)),
        Err(_) => {
            warn!("Refusing to use poisoned lock");
            Err(LockPoisoned)
        }
    }
}
