//! Command line interface of the `servo-stand` binary.
//!
//! # Usage
//!
//! ```bash
//! # Ping pan and tilt
//! servo-stand ping
//!
//! # Home both servos to 512, with debug logging
//! servo-stand -vv home --target 512
//!
//! # Watch the tilt servo on another port until Ctrl-C
//! servo-stand --port /dev/ttyACM0 query --id 2
//!
//! # Try it without hardware
//! servo-stand --simulate home
//! ```

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::hardware::protocol::DeviceId;

/// Utilities for working with the Dynamixel servos on the test stand
#[derive(Parser, Debug)]
#[command(name = "servo-stand")]
#[command(version)]
#[command(about = "Utilities for working with the Dynamixel servos on the test stand")]
#[command(long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Serial port of the servo bus, overriding the configuration
    #[arg(long, value_name = "PORT", global = true)]
    pub port: Option<String>,

    /// Use a simulated servo bus instead of the serial port
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Subcommand to run; none exits with -2
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Subcommands of `servo-stand`.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Ping every configured servo
    Ping,
    /// Move every configured servo to its home position and wait until it arrives
    Home {
        /// Goal position instead of each servo's home position
        #[arg(long)]
        target: Option<u16>,
    },
    /// Print one servo's position once per second until Ctrl-C
    Query {
        /// Bus address of the servo
        #[arg(long, default_value = "1")]
        id: DeviceId,
    },
    /// Print the effective configuration as TOML
    Config,
    /// Anything else; exits with -2
    #[command(external_subcommand)]
    Unknown(Vec<String>),
}
