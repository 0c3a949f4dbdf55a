//! Logging initialization shared by the library's tools and by plugin children
//!
//! Filter precedence is the same everywhere:
//! - `RUST_LOG` if it is set
//! - otherwise the filter passed in (usually from [`LoggingConfig`])
//! - otherwise `info`
//!
//! # Usage
//!
//! ```rust,no_run
//! use chanbridge::utils::init_logging;
//!
//! init_logging(None); // Uses RUST_LOG or defaults to "info"
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Pick the effective filter: RUST_LOG, then `filter`, then `default`
fn resolve_filter(filter: Option<&str>, default: &str) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    EnvFilter::new(filter.unwrap_or(default))
}

/// Initialize human-readable logging to stderr.
///
/// Calling it a second time is harmless; the first subscriber stays installed.
pub fn init_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(std::env::var("NO_COLOR").is_err()), // Respect NO_COLOR standard
        )
        .with(resolve_filter(filter, "info"))
        .try_init();
}

/// Initialize logging for a child process spawned through the bridge.
///
/// Without an explicit filter the child logs its own target at `info` and the
/// bridge internals at `debug`, so handshake problems are visible on the
/// parent's stderr. Stdout is left alone.
pub fn init_plugin_logging(plugin_name: &str, filter: Option<&str>) {
    let default_filter = format!("{}=info,chanbridge::process=debug", plugin_name);
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        )
        .with(resolve_filter(filter, &default_filter))
        .try_init();
}

/// Initialize logging with JSON output (for log aggregation)
#[cfg(feature = "json-logging")]
pub fn init_json_logging(filter: Option<&str>) {
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true),
        )
        .with(resolve_filter(filter, "info"))
        .try_init();
}

/// Initialize logging from [`LoggingConfig`]
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
