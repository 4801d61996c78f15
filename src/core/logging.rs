//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. explicit level passed by the embedding binary
//! 2. `CHILDFLOW_LOG` environment variable (e.g. "info", "debug")
//! 3. default to `info`

use tracing::Level;
use tracing_subscriber::fmt;

use crate::core::errors::{Result, SchedulerError};

pub const LOG_ENV_VAR: &str = "CHILDFLOW_LOG";

/// Install the global fmt subscriber writing to stderr.
///
/// Returns an error when a global subscriber is already installed.
pub fn init_logging(level: Option<Level>) -> Result<()> {
    let level = level.unwrap_or_else(|| {
        std::env::var(LOG_ENV_VAR)
            .ok()
            .and_then(|s| parse_level_str(&s))
            .unwrap_or(Level::INFO)
    });

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| SchedulerError::Configuration(format!("logging already initialised: {}", e)))
}

pub fn parse_level_str(s: &str) -> Option<Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
