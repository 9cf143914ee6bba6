//! ploop shared - errors and on-disk constants
//!
//! This crate contains the error taxonomy, exit codes and image format
//! constants used by the library (`ploop`), the command-line tool and the
//! test fixtures.

pub mod constants;
pub mod errors;

pub use errors::{ExitStatus, IoOp, PloopError, PloopResult};
