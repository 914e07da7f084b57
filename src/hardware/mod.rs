//! Hardware layer: the register protocol, bus transports and servo sessions.
//!
//! - [`protocol`]: Dynamixel Protocol 1.0 types and packet codec
//! - [`transport`]: the bus endpoint contract and its implementations
//! - [`capabilities`]: `Servo` / `Positioner` traits used by the orchestrator
//! - [`dynamixel`]: the Dynamixel session state machine
//! - [`session`]: scoped acquisition with guaranteed release

pub mod capabilities;
pub mod dynamixel;
pub mod mock;
pub mod protocol;
pub mod session;
pub mod shared_bus;
pub mod transport;

#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use capabilities::{Positioner, Servo, UNREADABLE_POSITION};
pub use dynamixel::{ConnectionState, Dynamixel, HomingConfig};
pub use protocol::{CommResult, DeviceError, DeviceId, Register};
pub use session::{join_pending_releases, scoped, ServoSession};
pub use shared_bus::{BusHandle, SharedBus};
pub use transport::Transport;
