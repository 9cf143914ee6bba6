//! Result of an image check.

use std::ops::Range;
use std::path::PathBuf;

use ploop_shared::errors::{PloopError, PloopResult};
use serde::Serialize;

/// Overall verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FsckOutcome {
    /// Nothing needed fixing (or the check was skipped).
    Clean,
    /// Problems were found and fixed.
    Repaired,
    /// Unrepairable index corruption; the image must not be used.
    Fatal,
    /// Fixable problems were left alone because the image is read-only.
    Unrepaired,
}

/// What was wrong with an index slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotProblem {
    /// Logical cluster lies outside the virtual disk.
    BeyondDeviceSize,
    /// Sector offset is not cluster aligned.
    Misaligned,
    /// Block lies past the end of the image file.
    BeyondEof,
    /// Block is referenced by another slot too.
    Duplicate,
}

impl SlotProblem {
    /// Hard problems are only fixed on request and are fatal otherwise.
    pub fn is_hard(&self) -> bool {
        !matches!(self, SlotProblem::BeyondDeviceSize)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixAction {
    /// Slot zeroed.
    Fixed,
    /// Left alone; the image is not clean.
    Skipped,
    /// Left alone on purpose.
    Ignored,
    /// Left alone; the image is unusable.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// Logical cluster of the slot.
    pub cluster: u32,
    /// Raw slot value (sector offset).
    pub slot: u32,
    pub problem: SlotProblem,
    pub action: FixAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TailAction {
    Trimmed,
    /// Read-only run: the tail is only reported.
    Reported,
}

/// Image data past the last referenced block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Tail {
    pub action: TailAction,
    pub file_size: u64,
    pub expected_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsckReport {
    pub image: PathBuf,
    pub outcome: FsckOutcome,
    /// Header was clean and no forced check was requested.
    pub skipped: bool,
    pub findings: Vec<Finding>,
    /// Unreferenced blocks below the allocation head (detailed check only).
    pub holes: Vec<Range<u32>>,
    /// One past the highest referenced block.
    pub alloc_head: u32,
    pub tail: Option<Tail>,
    /// The in-use marker was set.
    pub dirty: bool,
    /// The empty flag disagreed with the index.
    pub wrong_empty_flag: bool,
    pub header_rewritten: bool,
}

impl FsckReport {
    pub(crate) fn new(image: PathBuf) -> Self {
        Self {
            image,
            outcome: FsckOutcome::Clean,
            skipped: false,
            findings: Vec::new(),
            holes: Vec::new(),
            alloc_head: 0,
            tail: None,
            dirty: false,
            wrong_empty_flag: false,
            header_rewritten: false,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.outcome, FsckOutcome::Clean | FsckOutcome::Repaired)
    }

    /// Turn a failed verdict into an error.
    pub fn into_result(self) -> PloopResult<Self> {
        match self.outcome {
            FsckOutcome::Clean | FsckOutcome::Repaired => Ok(self),
            FsckOutcome::Fatal => Err(PloopError::Corrupted(format!(
                "fatal errors were found, image {} is not repaired",
                self.image.display()
            ))),
            FsckOutcome::Unrepaired => Err(PloopError::Format(format!(
                "image {} needs repair but was checked read-only",
                self.image.display()
            ))),
        }
    }
}
