//! Custom error types for the servo stand.
//!
//! Two layers of errors exist, mirroring the two status channels of the bus:
//!
//! - **`ServoError`**: failures that decide whether a servo session is usable at all
//!   (the link could not be opened, the baud rate was refused, actuation could not be
//!   enabled) plus configuration and process-level problems.
//! - **`CommandError`**: a single register exchange that did not succeed. These are
//!   returned as values from steady-state commands (`ping`, `home`, position reads)
//!   and never tear down the session on their own.
//!
//! Failures while *disabling* actuation during disconnect are not represented here at
//! all: they are logged and swallowed so that releasing a session can never block.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::hardware::protocol::{CommResult, DeviceError, DeviceId};

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ServoError>;

/// Failures of a servo session or of the stand around it.
#[derive(Error, Debug)]
pub enum ServoError {
    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The tracing subscriber could not be installed.
    #[error("Failed to initialise logging: {0}")]
    Logging(String),

    /// The transport refused to open.
    #[error("Failed to open serial link {port}")]
    LinkUnavailable {
        /// Serial port path
        port: String,
    },

    /// The transport opened but would not take the requested baud rate.
    #[error("Serial link {port} rejected baud rate {baud_rate}")]
    BaudRateRejected {
        /// Serial port path
        port: String,
        /// Requested rate
        baud_rate: u32,
    },

    /// Torque could not be enabled while connecting.
    #[error("Servo communication error: {0}")]
    ServoCommunication(String),

    /// Orchestrator report for a servo whose link could not be opened.
    #[error("Servo {id} on {port} is unavailable")]
    Unavailable {
        /// Serial port path
        port: String,
        /// Bus address
        id: DeviceId,
    },

    /// A command ran and failed.
    #[error("Command failed: {0}")]
    Command(#[from] CommandError),

    /// Shutdown was requested before the command finished.
    #[error("Interrupted by shutdown")]
    Interrupted,

    /// A real serial port was requested from a build without serial support.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl ServoError {
    /// True for failures that mean "no link", as opposed to a misbehaving device.
    pub fn is_link_unavailable(&self) -> bool {
        matches!(
            self,
            ServoError::LinkUnavailable { .. } | ServoError::BaudRateRejected { .. }
        )
    }
}

/// Failure of a single register-level command.
///
/// `Display` renders the protocol's own description so callers can print it as-is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The exchange failed on the wire.
    #[error("{0}")]
    Comm(CommResult),

    /// The servo answered with error bits set.
    #[error("{0}")]
    Device(DeviceError),

    /// The session is disconnected; nothing was sent.
    #[error("Servo is not connected")]
    NotConnected,

    /// Homing deadline passed before the position converged.
    #[error("Homing did not converge within {0:?}")]
    Timeout(Duration),
}
