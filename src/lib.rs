//! Core library for the servo stand.
//!
//! Drives the Dynamixel pan/tilt servos of a camera test stand over one shared
//! half-duplex serial bus. Layers, bottom up:
//!
//! - [`hardware`]: Protocol 1.0 codec, bus transports (serial, simulated, shared),
//!   the Dynamixel session state machine and scoped acquisition
//! - [`stand`]: concurrent per-servo operations (ping, home, position monitor)
//! - [`config`], [`logging`], [`cli`], [`runner`]: the `servo-stand` binary's
//!   ambient stack

pub mod cli;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod runner;
pub mod stand;
