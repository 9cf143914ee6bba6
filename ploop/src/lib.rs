//! ploop - user-space side of the ploop virtual disk maintenance protocols.
//!
//! Two independent engines live here:
//!
//! - [`balloon`]: free-space reclamation. A hidden "balloon" file inside the
//!   guest filesystem is grown or shrunk; blocks the balloon covers are handed
//!   back to the device and live blocks above the new image end are relocated
//!   below it. Every step is serialized through the device maintenance state
//!   ([`device`]) and can be resumed after a crash with
//!   [`balloon::BalloonManager::complete`].
//! - [`fsck`]: offline consistency checking and repair of an image's index
//!   table and header.

pub mod balloon;
pub mod device;
pub mod fsck;
pub mod image;
pub mod lock;
pub mod options;
pub mod sysfs;

pub use ploop_shared::errors::{ExitStatus, IoOp, PloopError, PloopResult};

pub use balloon::{Balloon, BalloonManager};
pub use device::{ControlDevice, MaintenanceState, PloopDevice};
pub use fsck::{CheckOptions, FsckOutcome, FsckReport, check_image};
pub use image::{Delta, ImageHeader, IndexTable};
pub use options::PloopOptions;
pub use sysfs::SysfsTopology;
