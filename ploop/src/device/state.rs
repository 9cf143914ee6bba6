//! Device maintenance state and the operation admission table.
//!
//! The remapping device tracks one maintenance mode at a time. Every
//! user-space maintenance step asks the device for a mode, reads back what the
//! device is actually in, and decides from this table whether to proceed.

use std::fmt;

use ploop_shared::errors::{PloopError, PloopResult};
use serde::Serialize;

/// Maintenance mode reported by the device (`mntn_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceState {
    /// No maintenance in progress.
    Off,
    /// A balloon operation owns the device.
    Balloon,
    /// A free-block list has been loaded and awaits relocation.
    FreeBlocksLoaded,
    /// Write tracking is active.
    Track,
    /// A merge is in progress.
    Merge,
    /// A grow is in progress.
    Grow,
    /// Block relocation is in progress.
    Relocating,
}

impl MaintenanceState {
    pub fn from_raw(raw: u32) -> PloopResult<Self> {
        match raw {
            0 => Ok(MaintenanceState::Off),
            1 => Ok(MaintenanceState::Balloon),
            2 => Ok(MaintenanceState::FreeBlocksLoaded),
            4 => Ok(MaintenanceState::Track),
            5 => Ok(MaintenanceState::Merge),
            6 => Ok(MaintenanceState::Grow),
            7 => Ok(MaintenanceState::Relocating),
            other => Err(PloopError::Protocol(format!(
                "unexpected maintenance type ({other})"
            ))),
        }
    }

    pub fn as_raw(&self) -> u32 {
        match self {
            MaintenanceState::Off => 0,
            MaintenanceState::Balloon => 1,
            MaintenanceState::FreeBlocksLoaded => 2,
            MaintenanceState::Track => 4,
            MaintenanceState::Merge => 5,
            MaintenanceState::Grow => 6,
            MaintenanceState::Relocating => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MaintenanceState::Off => "OFF",
            MaintenanceState::Balloon => "BALLOON",
            MaintenanceState::FreeBlocksLoaded => "FBLOADED",
            MaintenanceState::Track => "TRACK",
            MaintenanceState::Merge => "MERGE",
            MaintenanceState::Grow => "GROW",
            MaintenanceState::Relocating => "RELOC",
        }
    }

    /// An interrupted balloon operation left staged work in the device.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            MaintenanceState::FreeBlocksLoaded | MaintenanceState::Relocating
        )
    }

    /// Another maintenance operation owns the device.
    pub fn is_foreign(&self) -> bool {
        matches!(
            self,
            MaintenanceState::Merge | MaintenanceState::Grow | MaintenanceState::Track
        )
    }
}

impl fmt::Display for MaintenanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Balloon-side operations that go through the admission table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalloonOp {
    /// Shrink the balloon (requested with `inflate=0`).
    Truncate,
    /// Grow the balloon (requested with `inflate=1`).
    Inflate,
    /// Look for leaked balloon blocks (requested with `inflate=1`).
    Check,
    /// Reclaim leaked balloon blocks (requested with `inflate=1`).
    Repair,
    /// Finish an interrupted operation (state queried with `keep_intact=1`).
    Complete,
}

impl BalloonOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BalloonOp::Truncate => "truncate",
            BalloonOp::Inflate => "inflate",
            BalloonOp::Check => "check",
            BalloonOp::Repair => "repair",
            BalloonOp::Complete => "complete",
        }
    }

    /// Value of the `inflate` field of the request.
    pub fn inflate(&self) -> bool {
        matches!(self, BalloonOp::Inflate | BalloonOp::Check | BalloonOp::Repair)
    }

    /// Whether the request must leave the device mode untouched.
    pub fn keep_intact(&self) -> bool {
        matches!(self, BalloonOp::Complete)
    }

    /// Decide what to do now that the device reports `observed`.
    pub fn admit(&self, observed: MaintenanceState) -> Admission {
        use MaintenanceState::*;

        match (self, observed) {
            (BalloonOp::Complete, FreeBlocksLoaded | Relocating) => Admission::Proceed,
            (BalloonOp::Complete, _) => Admission::NothingToDo,

            (_, s) if s.is_incomplete() => Admission::Busy(BusyReason::Incomplete),

            (BalloonOp::Truncate, Off | Merge | Grow | Track) => Admission::Proceed,
            (BalloonOp::Truncate, Balloon) => Admission::ProtocolError,

            (_, Balloon) => Admission::Proceed,
            (_, Merge | Grow | Track) => Admission::Busy(BusyReason::OtherOperation),
            (_, Off) => Admission::ProtocolError,

            // `is_incomplete` states are handled above.
            (_, FreeBlocksLoaded | Relocating) => Admission::Busy(BusyReason::Incomplete),
        }
    }

    /// [`BalloonOp::admit`] folded into a result for operations that can only
    /// proceed or fail.
    pub fn require(&self, observed: MaintenanceState) -> PloopResult<()> {
        match self.admit(observed) {
            Admission::Proceed | Admission::NothingToDo => Ok(()),
            Admission::Busy(BusyReason::Incomplete) => Err(PloopError::Busy(format!(
                "cannot {} balloon: device is in {} state, use complete to finish the previous operation",
                self.as_str(),
                observed
            ))),
            Admission::Busy(BusyReason::OtherOperation) => Err(PloopError::Busy(format!(
                "cannot {} balloon: device is in {} state",
                self.as_str(),
                observed
            ))),
            Admission::ProtocolError => Err(PloopError::Protocol(format!(
                "cannot {} balloon: unexpected {} state after request",
                self.as_str(),
                observed
            ))),
        }
    }
}

impl fmt::Display for BalloonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of consulting the admission table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    NothingToDo,
    Busy(BusyReason),
    ProtocolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    /// A previous balloon operation must be completed first.
    Incomplete,
    /// A merge, grow or tracking session owns the device.
    OtherOperation,
}
