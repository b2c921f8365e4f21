//! Logging initialization
//!
//! `RUST_LOG` always takes precedence. Otherwise the filter from the
//! configuration file is used, and `info` when neither is set.
//!
//! ```rust,ignore
//! use modinstall::utils::init_logging;
//!
//! init_logging(Some("modinstall=debug"));
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Default filter when neither `RUST_LOG` nor the config provides one
pub const DEFAULT_FILTER: &str = "info";

fn env_filter(filter: Option<&str>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or(DEFAULT_FILTER))
}

/// Human-readable logging to stderr
///
/// Uses `try_init`, so a second call (tests, embedding applications that
/// installed their own subscriber) is a no-op.
pub fn init_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(env_filter(filter))
        .try_init();
}

/// JSON logging for log aggregation
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(env_filter(filter))
        .try_init();
}

/// Initialize logging from the `[logging]` section of `LoaderConfig`
pub fn init_logging_from_config(config: Option<&LoggingConfig>) {
    let filter = config.and_then(|c| c.filter.as_deref());

    if config.map(|c| c.json_format).unwrap_or(false) {
        #[cfg(feature = "json-logging")]
        {
            init_json_logging(filter);
        }
        #[cfg(not(feature = "json-logging"))]
        {
            // Fall back to regular logging if json-logging feature not enabled
            init_logging(filter);
        }
    } else {
        init_logging(filter);
    }
}
