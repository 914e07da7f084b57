//! Capability traits for servo devices.
//!
//! `Servo` is the lifecycle every device family implements; `Positioner` adds the
//! register-level commands used by the stand. Code that orchestrates devices is
//! written against these traits, never against a concrete family type.

use async_trait::async_trait;
use tracing::Span;

use crate::error::{AppResult, CommandError};
use crate::hardware::protocol::DeviceId;

/// Returned by [`Positioner::current_position`] when the position cannot be read.
///
/// Encoder positions are never negative, so this cannot collide with a measurement.
pub const UNREADABLE_POSITION: i32 = -1;

/// Connection lifecycle of one servo.
#[async_trait]
pub trait Servo: Send {
    /// Open the link, negotiate the baud rate and, if configured, enable actuation.
    ///
    /// # Errors
    /// - `LinkUnavailable` / `BaudRateRejected` when the link cannot be established
    /// - `ServoCommunication` when actuation could not be enabled; the servo has
    ///   already been disconnected when this is returned
    async fn connect(&mut self) -> AppResult<()>;

    /// Disable actuation if it was enabled by `connect`, then release the link.
    ///
    /// Never fails and never blocks on a faulty link. Safe to call repeatedly,
    /// before `connect`, and after a failed `connect`.
    async fn disconnect(&mut self);

    /// Whether the last `connect` succeeded and no `disconnect` followed.
    fn is_connected(&self) -> bool;

    /// Bus address.
    fn id(&self) -> DeviceId;

    /// Link name, for reports.
    fn port_name(&self) -> &str;

    /// Span that this servo's work should be recorded under.
    fn span(&self) -> Span {
        Span::current()
    }
}

/// Register-level commands of a position-controlled servo.
///
/// Failures are returned as values; none of these tear down the connection.
#[async_trait]
pub trait Positioner: Servo {
    /// Identify the device, returning its model number.
    async fn ping(&mut self) -> Result<u16, CommandError>;

    /// Present position, or [`UNREADABLE_POSITION`] on any failure.
    async fn current_position(&mut self) -> i32;

    /// Switch actuation; true when the write went through on the wire.
    ///
    /// Device error bits are not inspected here.
    async fn enable_torque(&mut self, enable: bool) -> bool;

    /// Command `target` (or the configured home position) and wait until the
    /// servo reports a position within tolerance of it.
    async fn home(&mut self, target: Option<u16>) -> Result<(), CommandError>;
}
