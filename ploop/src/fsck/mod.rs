//! Offline image consistency check.
//!
//! Walks every index slot of a delta, zeroing slots that can't be right and
//! recomputing the allocation head. Afterwards the file tail past the head is
//! trimmed and the header (in-use marker, empty flag) is rewritten.
//!
//! Soft problems (a cluster outside the virtual disk) are fixed on any
//! read-write run. Hard problems (misaligned or out-of-file blocks,
//! duplicates) are fixed only with `hard_force` and are fatal otherwise.

mod bitmap;
mod report;

pub use bitmap::UsageBitmap;
pub use report::{FixAction, Finding, FsckOutcome, FsckReport, SlotProblem, Tail, TailAction};

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use ploop_shared::constants::image::{
    CLUSTER_BITS, CLUSTER_SECTORS, CLUSTER_SIZE, FLAG_EMPTY, HEADER_SIZE, HEADER_SLOTS, SLOT_SIZE,
    SLOTS_PER_PAGE,
};
use ploop_shared::errors::{IoOp, PloopError, PloopResult};
use serde::{Deserialize, Serialize};

use crate::image::{ImageHeader, PageBuf, in_image, read_page_at};

/// Switches of a check run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOptions {
    /// Check even when the in-use marker is clear.
    pub force: bool,
    /// Also zero hard problems. Implies `force`.
    pub hard_force: bool,
    /// Track block usage to find duplicates and holes.
    pub detailed: bool,
    /// Never write to the image.
    pub read_only: bool,
    /// Suppress informational messages.
    pub silent: bool,
    /// Drop the in-use marker of an image left dirty. Implies `force`.
    pub drop_in_use: bool,
}

impl CheckOptions {
    pub fn forced(&self) -> bool {
        self.force || self.hard_force || self.drop_in_use
    }
}

/// Check (and unless read-only, repair) the image at `path`.
///
/// Header errors fail with [`PloopError::Format`] before anything is written.
/// Index problems are reported through [`FsckReport::outcome`]; use
/// [`FsckReport::into_result`] to treat a fatal or unrepaired image as an
/// error.
pub fn check_image(path: &Path, opts: &CheckOptions) -> PloopResult<FsckReport> {
    let name = path.display().to_string();
    let file = OpenOptions::new()
        .read(true)
        .write(!opts.read_only)
        .open(path)
        .map_err(|e| PloopError::io(IoOp::Open, name.clone(), e))?;
    let file_size = file
        .metadata()
        .map_err(|e| PloopError::io(IoOp::Stat, name.clone(), e))?
        .len();

    let mut raw = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut raw, 0)
        .map_err(|e| PloopError::io(IoOp::Read, format!("header of {name}"), e))?;
    let header = ImageHeader::parse(&raw)
        .and_then(|h| h.validate().map(|()| h))
        .and_then(|h| h.check_file_size(file_size).map(|()| h))
        .map_err(|e| in_image(path, e))?;

    let mut report = FsckReport::new(path.to_path_buf());
    if !header.is_dirty() && !opts.forced() {
        if !opts.silent {
            tracing::info!("Image is clean, fsck is skipped");
        }
        report.skipped = true;
        return Ok(report);
    }

    let mut checker = Checker::new(&file, path, opts, &header, file_size);
    checker.scan_index()?;
    checker.finish(report)
}

struct Checker<'a> {
    file: &'a File,
    path: &'a Path,
    opts: &'a CheckOptions,
    header: &'a ImageHeader,
    file_size: u64,
    usage: Option<UsageBitmap>,
    alloc_head: u32,
    findings: Vec<Finding>,
    clean: bool,
    fatal: bool,
    wrote: bool,
}

impl<'a> Checker<'a> {
    fn new(
        file: &'a File,
        path: &'a Path,
        opts: &'a CheckOptions,
        header: &'a ImageHeader,
        file_size: u64,
    ) -> Self {
        let l1_pages = header.l1_pages();
        let usage = opts.detailed.then(|| {
            let blocks = file_size.div_ceil(CLUSTER_SIZE).min(u32::MAX as u64) as u32;
            let mut usage = UsageBitmap::new(blocks.max(l1_pages));
            usage.mark_range(0..l1_pages);
            usage
        });
        Self {
            file,
            path,
            opts,
            header,
            file_size,
            usage,
            alloc_head: l1_pages,
            findings: Vec::new(),
            clean: true,
            fatal: false,
            wrote: false,
        }
    }

    fn writable(&self) -> bool {
        !self.opts.read_only
    }

    fn scan_index(&mut self) -> PloopResult<()> {
        let mut page = PageBuf::new();
        let mut cluster = 0u32;

        for index in 0..self.header.l1_pages() {
            read_page_at(self.file, self.path, index, &mut page)?;
            if self.writable() && self.header.is_dirty() {
                self.write_at(page.as_bytes(), index as u64 * CLUSTER_SIZE, "index table")?;
            }

            let first = if index == 0 { HEADER_SLOTS as usize } else { 0 };
            for pos in first..SLOTS_PER_PAGE as usize {
                let slot = page.slot(pos);
                if slot != 0 {
                    self.check_slot(cluster, slot)?;
                }
                cluster += 1;
            }
        }
        Ok(())
    }

    fn check_slot(&mut self, cluster: u32, slot: u32) -> PloopResult<()> {
        let block = slot >> CLUSTER_BITS;

        if (cluster as u64) << CLUSTER_BITS >= self.header.size_in_sectors {
            tracing::warn!(cluster, "Data cluster beyond block device size");
            return self.resolve(cluster, slot, SlotProblem::BeyondDeviceSize);
        }
        if slot % CLUSTER_SECTORS != 0 {
            tracing::warn!(cluster, slot, "Index slot corrupted: misaligned sector offset");
            return self.resolve(cluster, slot, SlotProblem::Misaligned);
        }
        if (block as u64 + 1) * CLUSTER_SIZE > self.file_size {
            tracing::warn!(block, cluster, "Data cluster beyond EOF");
            return self.resolve(cluster, slot, SlotProblem::BeyondEof);
        }
        let duplicate = self.usage.as_mut().is_some_and(|usage| usage.mark_used(block));
        if duplicate {
            tracing::warn!(block, cluster, "Block is used more than once");
            self.resolve(cluster, slot, SlotProblem::Duplicate)?;
        }

        self.alloc_head = self.alloc_head.max(block + 1);
        Ok(())
    }

    /// Apply the fix policy for `problem` and record the finding.
    fn resolve(&mut self, cluster: u32, slot: u32, problem: SlotProblem) -> PloopResult<()> {
        let hard = problem.is_hard();
        let skip = self.opts.read_only || (hard && !self.opts.hard_force);

        let action = if skip {
            self.clean = false;
            if hard {
                self.fatal = true;
                FixAction::Fatal
            } else {
                FixAction::Skipped
            }
        } else if problem == SlotProblem::Duplicate {
            FixAction::Ignored
        } else {
            let offset = HEADER_SIZE as u64 + cluster as u64 * SLOT_SIZE as u64;
            self.write_at(&0u32.to_le_bytes(), offset, "zero index")?;
            FixAction::Fixed
        };

        match action {
            FixAction::Fatal => tracing::error!(cluster, ?problem, "FATAL"),
            _ => tracing::warn!(cluster, ?problem, "{:?}", action),
        }
        self.findings.push(Finding {
            cluster,
            slot,
            problem,
            action,
        });
        Ok(())
    }

    fn write_at(&mut self, buf: &[u8], offset: u64, what: &str) -> PloopResult<()> {
        self.file.write_all_at(buf, offset).map_err(|e| {
            PloopError::io(IoOp::Write, format!("{} of {}", what, self.path.display()), e)
        })?;
        self.wrote = true;
        Ok(())
    }

    fn sync(&self) -> PloopResult<()> {
        self.file
            .sync_all()
            .map_err(|e| PloopError::io(IoOp::Fsync, self.path.display().to_string(), e))
    }

    fn finish(mut self, mut report: FsckReport) -> PloopResult<FsckReport> {
        let l1_pages = self.header.l1_pages();
        let mut head = self.alloc_head;

        if let Some(usage) = &self.usage {
            report.holes = usage.unset_ranges_below(head).collect();
            for hole in &report.holes {
                if !self.opts.silent {
                    tracing::info!("Hole at blocks {}..{}", hole.start, hole.end);
                }
            }
        }
        report.alloc_head = head;
        report.findings = std::mem::take(&mut self.findings);

        if self.fatal {
            tracing::error!(
                "Fatal errors were found, image {} is not repaired",
                self.path.display()
            );
            report.outcome = FsckOutcome::Fatal;
            return Ok(report);
        }

        let expected_size = head as u64 * CLUSTER_SIZE;
        if expected_size < self.file_size {
            let action = if self.writable() {
                if !self.opts.silent {
                    tracing::info!("Trimming tail");
                }
                self.file.set_len(expected_size).map_err(|e| {
                    PloopError::io(IoOp::Truncate, self.path.display().to_string(), e)
                })?;
                self.wrote = true;
                TailAction::Trimmed
            } else {
                tracing::warn!("Want to trim tail");
                head = self.file_size.div_ceil(CLUSTER_SIZE).min(u32::MAX as u64) as u32;
                TailAction::Reported
            };
            report.tail = Some(Tail {
                action,
                file_size: self.file_size,
                expected_size,
            });
        }

        let flags = if head > l1_pages {
            self.header.flags & !FLAG_EMPTY
        } else {
            self.header.flags | FLAG_EMPTY
        };
        report.dirty = self.header.is_dirty();
        report.wrong_empty_flag = self.header.flags != flags;
        if report.dirty {
            tracing::warn!("Dirty flag is set");
        }
        if report.wrong_empty_flag {
            tracing::warn!("Empty flag is incorrect");
        }

        if !self.clean {
            report.outcome = FsckOutcome::Unrepaired;
            return Ok(report);
        }

        if !report.dirty && !report.wrong_empty_flag {
            if self.wrote {
                self.sync()?;
                report.outcome = FsckOutcome::Repaired;
            }
            return Ok(report);
        }

        if !self.writable() {
            tracing::error!("Image is clean but unable to fix the header on ro image");
            report.outcome = FsckOutcome::Unrepaired;
            return Ok(report);
        }

        let mut header = self.header.clone();
        header.disk_in_use = 0;
        header.flags = flags;
        self.write_at(&header.to_bytes(), 0, "header")?;
        self.sync()?;
        if self.opts.drop_in_use && report.dirty && !self.opts.silent {
            tracing::info!("Dropped in-use flag of {}", self.path.display());
        }

        report.header_rewritten = true;
        report.outcome = FsckOutcome::Repaired;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_implied() {
        assert!(!CheckOptions::default().forced());
        let hard = CheckOptions {
            hard_force: true,
            ..Default::default()
        };
        assert!(hard.forced());
        let drop = CheckOptions {
            drop_in_use: true,
            ..Default::default()
        };
        assert!(drop.forced());
    }

    #[test]
    fn test_options_from_partial_json() {
        let opts: CheckOptions = serde_json::from_str(r#"{"detailed": true}"#).unwrap();
        assert!(opts.detailed);
        assert!(!opts.read_only);
    }

    #[test]
    fn test_bad_signature_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.hdd");
        let junk = vec![0xa5u8; CLUSTER_SIZE as usize];
        std::fs::write(&path, &junk).unwrap();

        let err = check_image(&path, &CheckOptions::default()).unwrap_err();
        assert!(matches!(err, PloopError::Format(_)), "{err}");
        assert_eq!(std::fs::read(&path).unwrap(), junk);
    }

    #[test]
    fn test_index_past_eof_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.hdd");
        let mut header = ImageHeader::new(2048 * 64, 16384);
        header.disk_in_use = 1;
        let mut image = vec![0u8; 2 * CLUSTER_SIZE as usize];
        image[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        std::fs::write(&path, &image).unwrap();

        let err = check_image(&path, &CheckOptions::default()).unwrap_err();
        assert!(matches!(err, PloopError::Format(_)), "{err}");
        assert_eq!(std::fs::read(&path).unwrap(), image);
    }
}
