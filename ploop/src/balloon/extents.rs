//! Balloon extent mapping.
//!
//! The balloon's physical layout comes from FIEMAP. Physical offsets are
//! relative to the filesystem's block device; adding the partition start
//! turns them into offsets inside the ploop device, i.e. logical cluster
//! positions of the image.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use ploop_shared::constants::image::CLUSTER_SIZE;
use ploop_shared::errors::{PloopError, PloopResult};
use serde::Serialize;

use super::file::BalloonFile;

/// A contiguous run of the balloon, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub len: u64,
}

impl Extent {
    pub fn logical_end(&self) -> u64 {
        self.logical + self.len
    }

    pub fn physical_end(&self) -> u64 {
        self.physical + self.len
    }

    /// Device clusters covered by the extent.
    pub fn clusters(&self) -> std::ops::Range<u64> {
        self.physical / CLUSTER_SIZE..self.physical_end() / CLUSTER_SIZE
    }
}

/// Extents of `balloon` in `[range_start, range_end)`, shifted by
/// `physical_base` and checked against the cluster grid.
pub fn map_extents<B: BalloonFile + ?Sized>(
    balloon: &B,
    physical_base: u64,
    range_start: u64,
    range_end: u64,
) -> PloopResult<Vec<Extent>> {
    let raw = balloon.raw_extents(range_start, range_end)?;
    let extents = normalize(raw, physical_base, range_start, range_end)?;
    tracing::debug!(
        balloon = %balloon.path().display(),
        range_start,
        range_end,
        extents = extents.len(),
        "Mapped balloon extents"
    );
    Ok(extents)
}

/// Drop extents outside the range, merge contiguous neighbours and require
/// every result to cover whole clusters.
pub fn normalize(
    mut raw: Vec<Extent>,
    physical_base: u64,
    range_start: u64,
    range_end: u64,
) -> PloopResult<Vec<Extent>> {
    raw.sort_by_key(|e| e.logical);

    let mut merged: Vec<Extent> = Vec::with_capacity(raw.len());
    for e in raw {
        if e.len == 0 || e.logical_end() <= range_start || e.logical >= range_end {
            continue;
        }
        let e = Extent {
            physical: e.physical + physical_base,
            ..e
        };
        match merged.last_mut() {
            Some(last) if last.logical_end() == e.logical && last.physical_end() == e.physical => {
                last.len += e.len;
            }
            Some(last) if last.logical_end() > e.logical => {
                return Err(PloopError::Format(format!(
                    "overlapping balloon extents at logical offset {}",
                    e.logical
                )));
            }
            _ => merged.push(e),
        }
    }

    if let Some(bad) = merged
        .iter()
        .find(|e| e.physical % CLUSTER_SIZE != 0 || e.len % CLUSTER_SIZE != 0)
    {
        return Err(PloopError::Format(format!(
            "balloon extent (logical {}, physical {}, length {}) is not aligned to cluster size {}",
            bad.logical, bad.physical, bad.len, CLUSTER_SIZE
        )));
    }
    Ok(merged)
}

mod raw {
    pub const FIEMAP_FLAG_SYNC: u32 = 0x1;
    pub const FIEMAP_EXTENT_LAST: u32 = 0x1;
    pub const BATCH: usize = 128;

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct FiemapHeader {
        pub fm_start: u64,
        pub fm_length: u64,
        pub fm_flags: u32,
        pub fm_mapped_extents: u32,
        pub fm_extent_count: u32,
        pub fm_reserved: u32,
    }

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct FiemapExtent {
        pub fe_logical: u64,
        pub fe_physical: u64,
        pub fe_length: u64,
        pub fe_reserved64: [u64; 2],
        pub fe_flags: u32,
        pub fe_reserved: [u32; 3],
    }

    #[repr(C)]
    pub struct FiemapRequest {
        pub header: FiemapHeader,
        pub extents: [FiemapExtent; BATCH],
    }

    nix::ioctl_readwrite!(fs_ioc_fiemap, b'f', 11, FiemapHeader);
}

/// FIEMAP over `[start, end)` of `file`.
pub(crate) fn fiemap(file: &File, path: &Path, start: u64, end: u64) -> PloopResult<Vec<Extent>> {
    let mut request = Box::new(raw::FiemapRequest {
        header: raw::FiemapHeader::default(),
        extents: [raw::FiemapExtent::default(); raw::BATCH],
    });
    let mut out = Vec::new();
    let mut pos = start;

    while pos < end {
        request.header = raw::FiemapHeader {
            fm_start: pos,
            fm_length: end - pos,
            fm_flags: raw::FIEMAP_FLAG_SYNC,
            fm_extent_count: raw::BATCH as u32,
            ..Default::default()
        };

        // SAFETY: the header is immediately followed by `fm_extent_count`
        // extent slots, all inside the boxed request.
        unsafe {
            raw::fs_ioc_fiemap(
                file.as_raw_fd(),
                std::ptr::addr_of_mut!(*request).cast::<raw::FiemapHeader>(),
            )
        }
        .map_err(|e| PloopError::ioctl("FS_IOC_FIEMAP", e.into()))?;

        let mapped = (request.header.fm_mapped_extents as usize).min(raw::BATCH);
        if mapped == 0 {
            break;
        }

        let mut last = false;
        for fe in &request.extents[..mapped] {
            out.push(Extent {
                logical: fe.fe_logical,
                physical: fe.fe_physical,
                len: fe.fe_length,
            });
            last |= fe.fe_flags & raw::FIEMAP_EXTENT_LAST != 0;
        }
        if last {
            break;
        }
        let tail = &request.extents[mapped - 1];
        pos = tail.fe_logical + tail.fe_length;
    }

    tracing::trace!(file = %path.display(), start, end, extents = out.len(), "FIEMAP");
    Ok(out)
}
