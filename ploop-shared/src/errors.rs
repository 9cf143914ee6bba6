//! Error types for ploop tooling.
//!
//! Every error maps onto one exit status of the tool taxonomy so that callers
//! (scripts, orchestration layers) can tell a busy device from a corrupted
//! image without parsing messages.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for ploop operations.
pub type PloopResult<T> = Result<T, PloopError>;

/// System call class of an I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Open,
    Read,
    Write,
    Stat,
    Fsync,
    Truncate,
    Fallocate,
    Flock,
}

impl IoOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoOp::Open => "open",
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::Stat => "fstat",
            IoOp::Fsync => "fsync",
            IoOp::Truncate => "ftruncate",
            IoOp::Fallocate => "fallocate",
            IoOp::Flock => "flock",
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PloopError {
    // ========================================================================
    // Caller errors
    // ========================================================================
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    // ========================================================================
    // System errors
    // ========================================================================
    #[error("{op} {context}: {source}")]
    Io {
        op: IoOp,
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("ioctl {request} failed: {source}")]
    DeviceIoctl {
        request: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("sysfs: {0}")]
    Sysfs(String),

    #[error("lock: {0}")]
    Lock(String),

    // ========================================================================
    // Maintenance protocol
    // ========================================================================
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("busy: {0}")]
    Busy(String),

    // ========================================================================
    // Image content
    // ========================================================================
    #[error("bad image format: {0}")]
    Format(String),

    #[error("image is corrupted: {0}")]
    Corrupted(String),
}

impl PloopError {
    /// Build an I/O error for `op` on the object described by `context`.
    pub fn io(op: IoOp, context: impl Into<String>, source: io::Error) -> Self {
        PloopError::Io {
            op,
            context: context.into(),
            source,
        }
    }

    pub fn ioctl(request: &'static str, source: io::Error) -> Self {
        PloopError::DeviceIoctl { request, source }
    }

    /// Exit status reported by the command-line tool for this error.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            PloopError::InvalidArgument(_) | PloopError::Unsupported(_) => ExitStatus::Param,
            PloopError::Io { op, .. } => match op {
                IoOp::Open => ExitStatus::Open,
                IoOp::Read => ExitStatus::Read,
                IoOp::Write => ExitStatus::Write,
                IoOp::Stat => ExitStatus::Fstat,
                IoOp::Fsync => ExitStatus::Fsync,
                IoOp::Truncate => ExitStatus::Ftruncate,
                IoOp::Fallocate => ExitStatus::Fallocate,
                IoOp::Flock => ExitStatus::Flock,
            },
            PloopError::DeviceIoctl { .. } => ExitStatus::DevIoctl,
            PloopError::Sysfs(_) => ExitStatus::Sysfs,
            PloopError::Lock(_) => ExitStatus::Lock,
            PloopError::Protocol(_) => ExitStatus::Protocol,
            PloopError::Busy(_) => ExitStatus::Busy,
            PloopError::Format(_) | PloopError::Corrupted(_) => ExitStatus::PloopFormat,
        }
    }
}

/// Process exit statuses.
///
/// The numbering is shared with the rest of the ploop tool family; scripts
/// match on these values, so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Ok = 0,
    DevIoctl = 3,
    Open = 4,
    Read = 6,
    Write = 7,
    Sysfs = 9,
    PloopFormat = 11,
    Protocol = 13,
    Fstat = 15,
    Fsync = 16,
    Busy = 17,
    Flock = 18,
    Ftruncate = 19,
    Fallocate = 20,
    Lock = 23,
    Param = 40,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitStatus> for std::process::ExitCode {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitCode::from(status.code())
    }
}
