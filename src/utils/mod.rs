//! Shared helpers: logging setup, lock handling, error reporting

pub mod error;
pub mod lock;
pub mod logging;
pub mod signal;

pub use error::{log_error, with_default};
pub use lock::{with_lock, LockPoisoned};
pub use logging::{init_logging, init_logging_from_config};
#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use signal::{create_shutdown_receiver, wait_for_shutdown_signal};
