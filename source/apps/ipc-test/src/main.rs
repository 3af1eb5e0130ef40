// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: `ipctest` binary: request/reply round trips between two simulated processes
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: tests/cli.rs
//!
//! PUBLIC API:
//!   - main(): parses the command line, runs the test, maps failures to exit code 1
//!
//! DEPENDENCIES:
//!   - clap: command line
//!   - env_logger: log output (RUST_LOG, --verbose)

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use ipc_test::{run, AppError};
use log::{error, info};
use neuron::KernelConfig;

/// Test program for inter process communication.
#[derive(Debug, Parser)]
#[command(name = "ipctest", version)]
struct Args {
    /// Kernel configuration (TOML); defaults apply when omitted.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Request/reply exchanges to perform.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    rounds: u32,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

fn execute(args: &Args) -> Result<(), AppError> {
    let config = match &args.config {
        Some(path) => KernelConfig::load(path)?,
        None => KernelConfig::default(),
    };
    run(config, args.rounds)
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match execute(&args) {
        Ok(()) => {
            info!("IPCTEST: ok");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("ipctest: {err}");
            ExitCode::FAILURE
        }
    }
}
