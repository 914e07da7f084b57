//! Tracing subscriber setup for the `servo-stand` binary.
//!
//! Level resolution, highest precedence first:
//! 1. `RUST_LOG`, when set
//! 2. `-v` on the command line (`-v` = info, `-vv` and up = debug)
//! 3. `application.log_level` from the configuration
//!
//! Output goes to stderr so that command output on stdout stays clean.

use tracing_subscriber::EnvFilter;

use crate::config::ApplicationConfig;
use crate::error::{AppResult, ServoError};

/// Level directive for the given verbosity count and configured level.
pub fn level_for(verbosity: u8, configured: &str) -> String {
    match verbosity {
        0 => configured.to_string(),
        1 => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Filter honoring `RUST_LOG` before falling back to [`level_for`].
pub fn filter_for(verbosity: u8, application: &ApplicationConfig) -> AppResult<EnvFilter> {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(EnvFilter::from_default_env());
    }
    EnvFilter::try_new(level_for(verbosity, &application.log_level))
        .map_err(|e| ServoError::Logging(e.to_string()))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init(verbosity: u8, application: &ApplicationConfig) -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbosity, application)?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| ServoError::Logging(e.to_string()))
}
