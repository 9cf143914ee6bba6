use std::path::PathBuf;

use clap::Args;
use ploop::{CheckOptions, FsckOutcome, check_image};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Force check even if the dirty flag is clear
    #[arg(short = 'f', long)]
    pub force: bool,

    /// Like -f, and also fix fatal errors (dangerous)
    #[arg(short = 'F', long)]
    pub hard_force: bool,

    /// Check for duplicated blocks and holes
    #[arg(short = 'c', long)]
    pub detailed: bool,

    /// Do not modify the image
    #[arg(short = 'r', long)]
    pub read_only: bool,

    /// Report only errors
    #[arg(short = 's', long)]
    pub silent: bool,

    /// Drop the image "in use" flag
    #[arg(short = 'd', long)]
    pub drop_in_use: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Path to the image file
    #[arg(value_name = "DELTA")]
    pub delta: PathBuf,
}

impl CheckArgs {
    fn options(&self) -> CheckOptions {
        CheckOptions {
            force: self.force,
            hard_force: self.hard_force,
            detailed: self.detailed,
            read_only: self.read_only,
            silent: self.silent,
            drop_in_use: self.drop_in_use,
        }
    }
}

pub fn execute(args: CheckArgs, _global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let report = check_image(&args.delta, &args.options())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !args.silent || !report.is_usable() {
        let verdict = match report.outcome {
            FsckOutcome::Clean if report.skipped => "clean (skipped)",
            FsckOutcome::Clean => "clean",
            FsckOutcome::Repaired => "repaired",
            FsckOutcome::Fatal => "fatal errors, not repaired",
            FsckOutcome::Unrepaired => "not repaired",
        };
        println!("{}: {}", args.delta.display(), verdict);
    }

    report.into_result()?;
    Ok(())
}
