use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Subcommand};
use ploop::balloon::{BalloonFile, ChangeOutcome, CompleteOutcome, RepairOutcome};
use ploop::device::{PloopDevice, device_name};
use ploop::{Balloon, BalloonManager, PloopError};
use ploop_shared::constants::image::SECTOR_BITS;
use serde::Serialize;

#[derive(Args, Debug)]
pub struct BalloonArgs {
    /// ploop device, e.g. /dev/ploop12345
    #[arg(short = 'd', long, value_name = "DEVICE")]
    pub device: PathBuf,

    /// Mount point of the filesystem on the device
    #[arg(short = 'm', long, value_name = "DIR")]
    pub mount_point: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub action: BalloonAction,
}

#[derive(Subcommand, Debug)]
pub enum BalloonAction {
    /// Print the current balloon size
    Show,
    /// Print the in-kernel maintenance state
    Status,
    /// Reset a stale maintenance state
    Clear,
    /// Inflate or shrink the balloon
    Change {
        /// New size; K, M, G or T suffix for bytes, plain number for sectors
        #[arg(short = 's', long, value_parser = parse_size)]
        size: u64,
    },
    /// Finish an interrupted balloon operation
    Complete,
    /// Look for balloon blocks still allocated in the image
    Check,
    /// Reclaim balloon blocks still allocated in the image
    Repair,
}

#[derive(Serialize)]
struct ShowOutput<'a> {
    balloon: &'a Path,
    size: u64,
}

pub fn execute(args: BalloonArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let device = PloopDevice::open(&args.device)?;
    let name = device_name(&args.device)?;
    let manager = BalloonManager::new(device, name, global.options());

    match &args.action {
        BalloonAction::Show => {
            let balloon = open_balloon(&args)?;
            let size = balloon.size()?;
            if args.json {
                print_json(&ShowOutput {
                    balloon: balloon.path(),
                    size,
                })?;
            } else {
                println!("Current size of hidden balloon is {size} bytes");
            }
        }
        BalloonAction::Status => {
            let reply = manager.state()?;
            if args.json {
                print_json(&reply)?;
            } else {
                println!("Current state of in-kernel ploop-balloon: {}", reply.state);
            }
        }
        BalloonAction::Clear => {
            manager.clear_state()?;
        }
        BalloonAction::Change { size } => {
            let balloon = open_balloon(&args)?;
            let outcome = manager.change_size(&balloon, *size)?;
            match outcome {
                _ if args.json => print_json(&outcome)?,
                ChangeOutcome::Inflated { new_size, .. }
                | ChangeOutcome::Truncated { new_size, .. } => {
                    println!("Balloon size is now {new_size} bytes");
                }
                ChangeOutcome::Unchanged { .. } => {}
            }
        }
        BalloonAction::Complete => {
            let outcome = manager.complete()?;
            if args.json {
                print_json(&outcome)?;
            } else if let CompleteOutcome::NothingToComplete { state } = outcome {
                println!("Nothing to complete: kernel is in {state} state");
            }
        }
        BalloonAction::Check | BalloonAction::Repair => {
            let repair = matches!(args.action, BalloonAction::Repair);
            let balloon = open_balloon(&args)?;
            let outcome = manager.check_and_repair(&balloon, repair)?;
            if args.json {
                print_json(&outcome)?;
            } else if let RepairOutcome::Found { free_blocks } = outcome {
                println!("{free_blocks} free blocks found");
            }
        }
    }
    Ok(())
}

fn open_balloon(args: &BalloonArgs) -> anyhow::Result<Balloon> {
    let mount = args.mount_point.as_deref().ok_or_else(|| {
        PloopError::InvalidArgument("this action needs the mount point (-m)".into())
    })?;
    let balloon = Balloon::open(mount)
        .with_context(|| format!("can't open hidden balloon at {}", mount.display()))?;
    Ok(balloon)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Size argument in sectors.
///
/// A `K`, `M`, `G` or `T` suffix means binary multiples of bytes; a plain
/// number is a sector count.
pub fn parse_size(raw: &str) -> Result<u64, String> {
    let raw = raw.trim();
    let (digits, shift) = match raw.char_indices().last() {
        Some((i, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_uppercase() {
                'K' => 10,
                'M' => 20,
                'G' => 30,
                'T' => 40,
                _ => return Err(format!("unknown size suffix {c:?}")),
            };
            (&raw[..i], Some(shift))
        }
        _ => (raw, None),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size {raw:?}"))?;
    match shift {
        None => Ok(value),
        Some(shift) => value
            .checked_mul(1 << shift)
            .map(|bytes| bytes >> SECTOR_BITS)
            .ok_or_else(|| format!("size {raw:?} is too large")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2048", 2048)]
    #[case("1K", 2)]
    #[case("1M", 2048)]
    #[case("1g", 2 * 1024 * 1024)]
    #[case(" 3M ", 3 * 2048)]
    fn test_parse_size(#[case] raw: &str, #[case] sectors: u64) {
        assert_eq!(parse_size(raw).unwrap(), sectors);
    }

    #[rstest]
    #[case("")]
    #[case("M")]
    #[case("12Q")]
    #[case("-1")]
    #[case("99999999999T")]
    fn test_parse_size_rejects(#[case] raw: &str) {
        assert!(parse_size(raw).is_err());
    }
}
