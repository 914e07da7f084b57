//! Subcommand execution for the `servo-stand` binary.
//!
//! [`StandRunner`] maps a parsed [`Cli`] onto the stand operations and renders
//! their reports. Command-level failures are printed, not returned: the exit code
//! only distinguishes success from an unknown or missing subcommand.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cli::{Cli, Command};
use crate::config::{BusConfig, StandConfig};
use crate::error::{AppResult, ServoError};
use crate::hardware::mock::MockTransport;
use crate::hardware::session;
use crate::hardware::shared_bus::SharedBus;
use crate::hardware::transport::Transport;
use crate::stand::{self, ServoReport};

/// Exit code after a completed subcommand.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code when startup (configuration, logging, transport) failed.
pub const EXIT_STARTUP_FAILURE: i32 = 1;
/// Exit code for a missing or unknown subcommand.
pub const EXIT_UNKNOWN_COMMAND: i32 = -2;

/// Interval between `query` samples.
pub const QUERY_PERIOD: Duration = Duration::from_secs(1);

/// Runs one invocation of the command line.
pub struct StandRunner {
    cli: Cli,
    config: StandConfig,
}

impl StandRunner {
    /// Runner for `cli` over the loaded `config`.
    pub fn new(cli: Cli, config: StandConfig) -> Self {
        Self { cli, config }
    }

    /// Serial port in use: `--port`, else the configured one.
    pub fn port(&self) -> &str {
        self.cli.port.as_deref().unwrap_or(&self.config.bus.port)
    }

    /// Run against the real (or `--simulate`d) bus, printing to stdout and
    /// stopping on Ctrl-C.
    pub async fn run(&self) -> anyhow::Result<i32> {
        let mut stdout = std::io::stdout();
        self.execute(
            || Ok(SharedBus::new(self.transport()?)),
            shutdown_signal(),
            &mut stdout,
        )
        .await
    }

    /// Run the subcommand. `open_bus` is only called by subcommands that talk to
    /// servos; `shutdown` interrupts them, after which every servo is released.
    pub async fn execute<T, B, C, W>(
        &self,
        open_bus: B,
        shutdown: C,
        out: &mut W,
    ) -> anyhow::Result<i32>
    where
        T: Transport + 'static,
        B: FnOnce() -> AppResult<SharedBus<T>>,
        C: Future<Output = ()>,
        W: Write,
    {
        let command = match &self.cli.command {
            Some(Command::Unknown(args)) => {
                debug!("Unknown sub command {}", args.join(" "));
                return Ok(EXIT_UNKNOWN_COMMAND);
            }
            None => {
                debug!("Unknown sub command <none>");
                return Ok(EXIT_UNKNOWN_COMMAND);
            }
            Some(Command::Config) => {
                write!(out, "{}", self.effective_config().to_toml()?)?;
                return Ok(EXIT_SUCCESS);
            }
            Some(command) => command,
        };

        let bus = open_bus()?;
        let result = self.run_command(command, &bus, shutdown, out).await;
        session::join_pending_releases().await;
        result.map(|()| EXIT_SUCCESS)
    }

    async fn run_command<T, C, W>(
        &self,
        command: &Command,
        bus: &SharedBus<T>,
        shutdown: C,
        out: &mut W,
    ) -> anyhow::Result<()>
    where
        T: Transport + 'static,
        C: Future<Output = ()>,
        W: Write,
    {
        match command {
            Command::Ping => {
                let servos = stand::servos_from_config(bus, &self.config)?;
                for report in stand::ping_all_until(servos, shutdown).await {
                    match &report.result {
                        Ok(model) => writeln!(
                            out,
                            "[ID:{:03}] ping Succeeded. Dynamixel model number : {}",
                            report.id.get(),
                            model
                        )?,
                        Err(_) => writeln!(out, "{}", failure_text(&report))?,
                    }
                }
            }
            Command::Home { target } => {
                let servos = stand::servos_from_config(bus, &self.config)?;
                for report in stand::home_all_until(servos, *target, shutdown).await {
                    match &report.result {
                        Ok(()) => info!(port = %report.port, id = %report.id, "Servo homed"),
                        Err(_) => writeln!(
                            out,
                            "{}: Servo {} failed to home: {}",
                            report.port,
                            report.id,
                            failure_text(&report)
                        )?,
                    }
                }
            }
            Command::Query { id } => {
                let servo = stand::servo_for(bus, &self.config, *id);
                let mut write_error = None;
                let result = stand::monitor(servo, QUERY_PERIOD, shutdown, |sample| {
                    if write_error.is_none() {
                        if let Err(e) = writeln!(out, "{sample}") {
                            write_error = Some(e);
                        }
                    }
                })
                .await;
                if let Some(e) = write_error {
                    warn!(error = %e, "Failed to write position sample");
                }
                if let Err(e) = result {
                    writeln!(out, "{e}")?;
                }
            }
            Command::Config | Command::Unknown(_) => {}
        }
        Ok(())
    }

    /// Loaded configuration with command line overrides applied.
    pub fn effective_config(&self) -> StandConfig {
        let mut config = self.config.clone();
        config.bus.port = self.port().to_string();
        config
    }

    fn transport(&self) -> AppResult<Box<dyn Transport>> {
        if self.cli.simulate {
            info!(port = %self.port(), "Using simulated servo bus");
            return Ok(Box::new(MockTransport::pan_tilt(self.port())));
        }
        serial_transport(self.port(), &self.config.bus)
    }
}

/// Protocol description for command failures, the error text otherwise.
fn failure_text<T>(report: &ServoReport<T>) -> String {
    match &report.result {
        Ok(_) => String::new(),
        Err(ServoError::Command(e)) => e.to_string(),
        Err(e) => e.to_string(),
    }
}

#[cfg(feature = "instrument_serial")]
fn serial_transport(port: &str, bus: &BusConfig) -> AppResult<Box<dyn Transport>> {
    use crate::hardware::serial::SerialTransport;

    Ok(Box::new(
        SerialTransport::new(port).with_read_timeout(bus.read_timeout()),
    ))
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_transport(_port: &str, _bus: &BusConfig) -> AppResult<Box<dyn Transport>> {
    Err(ServoError::SerialFeatureDisabled)
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
