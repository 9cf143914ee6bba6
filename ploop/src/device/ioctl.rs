//! ioctl bindings for the ploop device.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use ploop_shared::constants::sysfs::DEVICE_PREFIX;
use ploop_shared::errors::{IoOp, PloopError, PloopResult};

use super::{
    BalloonReply, BalloonRequest, ControlDevice, FreeBlocksList, FreeBlocksRequest, FreeExtent,
    MaintenanceState, RelocExtent, RelocRequest,
};

mod raw {
    pub const PLOOP_IOC_MAGIC: u8 = b'P';

    #[repr(C)]
    #[derive(Debug, Default)]
    pub struct BalloonCtl {
        pub mntn_type: u32,
        pub alloc_head: u32,
        pub level: u8,
        pub inflate: u8,
        pub keep_intact: u8,
        pub padding: u8,
    }

    /// Header of `ploop_freeblks_ctl`; followed by `n_extents` triples.
    #[repr(C)]
    pub struct FreeBlksCtl {
        pub level: u32,
        pub n_extents: u32,
        pub alloc_head: u32,
        pub padding: u32,
    }

    /// Header of `ploop_relocblks_ctl`; followed by `n_extents` quads.
    #[repr(C)]
    pub struct RelocBlksCtl {
        pub level: u32,
        pub n_extents: u32,
        pub n_free: u32,
        pub alloc_head: u32,
    }

    nix::ioctl_readwrite_bad!(
        ploop_balloon,
        nix::request_code_write!(PLOOP_IOC_MAGIC, 21, size_of::<BalloonCtl>()),
        BalloonCtl
    );
    nix::ioctl_readwrite_bad!(
        ploop_freeblks,
        nix::request_code_write!(PLOOP_IOC_MAGIC, 22, size_of::<FreeBlksCtl>()),
        FreeBlksCtl
    );
    nix::ioctl_readwrite_bad!(
        ploop_fbget,
        nix::request_code_write!(PLOOP_IOC_MAGIC, 23, size_of::<FreeBlksCtl>()),
        FreeBlksCtl
    );
    nix::ioctl_readwrite_bad!(
        ploop_relocblks,
        nix::request_code_write!(PLOOP_IOC_MAGIC, 24, size_of::<RelocBlksCtl>()),
        RelocBlksCtl
    );
}

const FREEBLKS_HEADER_WORDS: usize = 4;
const FREEBLKS_EXTENT_WORDS: usize = 3;
const RELOC_HEADER_WORDS: usize = 4;
const RELOC_EXTENT_WORDS: usize = 4;

/// An open ploop block device.
#[derive(Debug)]
pub struct PloopDevice {
    file: File,
    path: PathBuf,
}

impl PloopDevice {
    pub fn open(path: &Path) -> PloopResult<Self> {
        let file = File::open(path)
            .map_err(|e| PloopError::io(IoOp::Open, path.display().to_string(), e))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Kernel device name, e.g. `ploop12345`.
    pub fn name(&self) -> PloopResult<String> {
        device_name(&self.path)
    }
}

/// Whole-device name from a device node path (`/dev/ploop0p1` -> `ploop0`).
pub fn device_name(path: &Path) -> PloopResult<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PloopError::InvalidArgument(format!("bad device path {}", path.display())))?;
    let whole = name
        .strip_prefix(DEVICE_PREFIX)
        .and_then(|rest| {
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            (digits > 0).then(|| &name[..DEVICE_PREFIX.len() + digits])
        })
        .unwrap_or(name);
    Ok(whole.to_string())
}

fn extent_words(extents: &[FreeExtent]) -> impl Iterator<Item = u32> + '_ {
    extents.iter().flat_map(|e| [e.clu, e.iblk, e.len])
}

fn reloc_words(extents: &[RelocExtent]) -> impl Iterator<Item = u32> + '_ {
    extents.iter().flat_map(|e| [e.clu, e.iblk, e.len, e.free])
}

impl ControlDevice for PloopDevice {
    fn balloon(&self, request: BalloonRequest) -> PloopResult<BalloonReply> {
        let mut ctl = raw::BalloonCtl {
            inflate: request.inflate as u8,
            keep_intact: request.keep_intact as u8,
            ..Default::default()
        };
        // SAFETY: `ctl` is a live repr(C) struct matching the kernel layout.
        unsafe { raw::ploop_balloon(self.file.as_raw_fd(), &mut ctl) }
            .map_err(|e| PloopError::ioctl("PLOOP_IOC_BALLOON", e.into()))?;

        let reply = BalloonReply {
            state: MaintenanceState::from_raw(ctl.mntn_type)?,
            level: ctl.level as u32,
            alloc_head: ctl.alloc_head,
        };
        tracing::debug!(
            device = %self.path.display(),
            inflate = request.inflate,
            keep_intact = request.keep_intact,
            state = %reply.state,
            level = reply.level,
            alloc_head = reply.alloc_head,
            "PLOOP_IOC_BALLOON"
        );
        Ok(reply)
    }

    fn free_blocks(&self, request: &FreeBlocksRequest) -> PloopResult<u32> {
        let mut buf: Vec<u32> = [request.level, request.extents.len() as u32, 0, 0]
            .into_iter()
            .chain(extent_words(&request.extents))
            .collect();

        // SAFETY: `buf` starts with a FreeBlksCtl header (u32 aligned) and is
        // followed by exactly `n_extents` extents.
        unsafe {
            raw::ploop_freeblks(
                self.file.as_raw_fd(),
                buf.as_mut_ptr().cast::<raw::FreeBlksCtl>(),
            )
        }
        .map_err(|e| PloopError::ioctl("PLOOP_IOC_FREEBLKS", e.into()))?;

        let alloc_head = buf[2];
        tracing::debug!(
            device = %self.path.display(),
            n_extents = request.extents.len(),
            alloc_head,
            "PLOOP_IOC_FREEBLKS"
        );
        Ok(alloc_head)
    }

    fn get_free_blocks(&self, level: u32, capacity: u32) -> PloopResult<FreeBlocksList> {
        let mut buf = vec![0u32; FREEBLKS_HEADER_WORDS + capacity as usize * FREEBLKS_EXTENT_WORDS];
        buf[0] = level;
        buf[1] = capacity;

        // SAFETY: `buf` holds a FreeBlksCtl header and room for `capacity`
        // extents; the kernel writes at most that many.
        unsafe {
            raw::ploop_fbget(
                self.file.as_raw_fd(),
                buf.as_mut_ptr().cast::<raw::FreeBlksCtl>(),
            )
        }
        .map_err(|e| PloopError::ioctl("PLOOP_IOC_FBGET", e.into()))?;

        let n_extents = buf[1];
        let filled = n_extents.min(capacity) as usize;
        let extents = buf[FREEBLKS_HEADER_WORDS..]
            .chunks_exact(FREEBLKS_EXTENT_WORDS)
            .take(filled)
            .map(|w| FreeExtent {
                clu: w[0],
                iblk: w[1],
                len: w[2],
            })
            .collect();
        Ok(FreeBlocksList { n_extents, extents })
    }

    fn relocate_blocks(&self, request: &RelocRequest) -> PloopResult<u32> {
        let mut buf: Vec<u32> = Vec::with_capacity(
            RELOC_HEADER_WORDS + request.extents.len() * RELOC_EXTENT_WORDS,
        );
        buf.extend([
            request.level,
            request.extents.len() as u32,
            request.n_free,
            request.alloc_head,
        ]);
        buf.extend(reloc_words(&request.extents));

        // SAFETY: `buf` starts with a RelocBlksCtl header followed by exactly
        // `n_extents` extents.
        unsafe {
            raw::ploop_relocblks(
                self.file.as_raw_fd(),
                buf.as_mut_ptr().cast::<raw::RelocBlksCtl>(),
            )
        }
        .map_err(|e| PloopError::ioctl("PLOOP_IOC_RELOCBLKS", e.into()))?;

        Ok(buf[3])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ctl_layouts() {
        assert_eq!(size_of::<raw::BalloonCtl>(), 12);
        assert_eq!(size_of::<raw::FreeBlksCtl>(), FREEBLKS_HEADER_WORDS * 4);
        assert_eq!(size_of::<raw::RelocBlksCtl>(), RELOC_HEADER_WORDS * 4);
    }

    #[test]
    fn test_request_words() {
        let free = [FreeExtent {
            clu: 1,
            iblk: 2,
            len: 3,
        }];
        assert_eq!(extent_words(&free).collect::<Vec<_>>(), vec![1, 2, 3]);
        let reloc = [RelocExtent {
            clu: 1,
            iblk: 9,
            len: 1,
            free: 4,
        }];
        assert_eq!(reloc_words(&reloc).collect::<Vec<_>>(), vec![1, 9, 1, 4]);
    }

    #[test]
    fn test_device_name() {
        assert_eq!(device_name(Path::new("/dev/ploop17")).unwrap(), "ploop17");
        assert_eq!(device_name(Path::new("/dev/ploop17p1")).unwrap(), "ploop17");
        assert_eq!(device_name(Path::new("/dev/sdb")).unwrap(), "sdb");
        assert!(device_name(Path::new("/")).is_err());
    }
}
