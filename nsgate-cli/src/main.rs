//! nsgate
//!
//! Runs a command inside fresh mount and PID namespaces (optionally a user namespace with
//! mapped ids) or starts a container, then exits exactly the way the command did.

use clap::Parser;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod status;

use cli::Cli;

fn main() {
    // Parse command-line arguments; usage errors exit 2 from clap
    let cli = Cli::parse();

    // Logs go to stderr so the command keeps stdout to itself
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match commands::dispatch(cli.command) {
        Ok(outcome) => status::propagate(outcome),
        Err(e) => {
            eprintln!("nsgate: {e:#}");
            process::exit(status::EXIT_INTERNAL_FAILURE);
        }
    }
}
