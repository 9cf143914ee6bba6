mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use ploop::{ExitStatus, PloopError};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitStatus::Param.into(),
            };
        }
    };

    init_logging(&cli);

    let result = match cli.command {
        Command::Check(args) => commands::check::execute(args, &cli.global),
        Command::Balloon(args) => commands::balloon::execute(args, &cli.global),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            exit_status(&err).into()
        }
    }
}

/// Errors that never reached a [`PloopError`] are argument problems.
fn exit_status(err: &anyhow::Error) -> ExitStatus {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PloopError>())
        .map_or(ExitStatus::Param, PloopError::exit_status)
}

fn init_logging(cli: &Cli) {
    let silent = matches!(&cli.command, Command::Check(args) if args.silent);
    let level = match cli.global.verbose {
        0 if silent => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // A second init only happens under test harnesses.
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(cli.global.verbose > 0)
        .compact()
        .try_init();
}
