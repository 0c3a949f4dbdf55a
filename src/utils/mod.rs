//! Logging setup, shutdown signals and caller-side deadlines

pub mod logging;
pub mod signal;
pub mod timeout;

#[cfg(feature = "json-logging")]
pub use logging::init_json_logging;
pub use logging::{init_logging, init_logging_from_config, init_plugin_logging};
pub use signal::wait_for_shutdown_signal;
pub use timeout::{limit_time, with_deadline, DeadlineExceeded, DEFAULT_BRIDGE_DEADLINE};
