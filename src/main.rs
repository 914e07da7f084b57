//! # servo-stand
//!
//! Ping, home and watch the pan/tilt servos of the camera test stand.
//!
//! ```bash
//! servo-stand ping
//! servo-stand -v --config stand.toml home --target 512
//! RUST_LOG=servo_stand=debug servo-stand query --id 2
//! ```

use std::panic::{self, AssertUnwindSafe};

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use servo_stand::cli::Cli;
use servo_stand::config::StandConfig;
use servo_stand::hardware::join_pending_releases;
use servo_stand::logging;
use servo_stand::runner::{StandRunner, EXIT_STARTUP_FAILURE};
use tracing::{error, info};

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("servo-stand: {e:#}");
            EXIT_STARTUP_FAILURE
        }
    };
    std::process::exit(code);
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    let config = StandConfig::load(cli.config.as_deref())?;
    logging::init(cli.verbose, &config.application)?;

    info!(
        "{} v{} starting...",
        config.application.name,
        env!("CARGO_PKG_VERSION")
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    // Servos dropped while a fault unwinds disconnect in the background; they
    // must finish before the runtime goes away.
    let outcome = runtime.block_on(async {
        let outcome = AssertUnwindSafe(StandRunner::new(cli, config).run())
            .catch_unwind()
            .await;
        join_pending_releases().await;
        outcome
    });

    match outcome {
        Ok(result) => result,
        Err(fault) => {
            error!("servo-stand aborted after releasing all servos");
            panic::resume_unwind(fault)
        }
    }
}
