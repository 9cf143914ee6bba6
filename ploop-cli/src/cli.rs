use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ploop::PloopOptions;
use ploop_shared::constants::envs;

use crate::commands::{balloon::BalloonArgs, check::CheckArgs};

#[derive(Parser, Debug)]
#[command(name = "ploop", version, about = "ploop image maintenance tool")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Where sysfs is mounted
    #[arg(long, global = true, env = envs::SYSFS_ROOT, value_name = "DIR")]
    pub sysfs_root: Option<PathBuf>,

    /// Directory of the global ploop lock
    #[arg(long, global = true, env = envs::LOCK_DIR, value_name = "DIR")]
    pub lock_dir: Option<PathBuf>,

    /// More logging (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl GlobalFlags {
    pub fn options(&self) -> PloopOptions {
        let mut options = PloopOptions::default();
        if let Some(root) = &self.sysfs_root {
            options.sysfs_root = root.clone();
        }
        if let Some(dir) = &self.lock_dir {
            options.lock_dir = dir.clone();
        }
        options
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check and repair the index of an image
    Check(CheckArgs),
    /// Manage the hidden balloon of a running device
    Balloon(BalloonArgs),
}
