//! ploop image (delta) format.
//!
//! An image starts with `l1_pages` cluster-sized index pages. Page 0 begins
//! with the 64-byte [`ImageHeader`]; the rest of the pages hold 4-byte slots
//! mapping logical clusters to sector offsets inside the file. Data clusters
//! follow the index.

mod header;
mod index;
mod page;

pub use header::{HeaderVersion, ImageHeader};
pub use index::IndexTable;
pub use page::PageBuf;

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use ploop_shared::constants::image::CLUSTER_SIZE;
use ploop_shared::errors::{IoOp, PloopError, PloopResult};

/// A delta image opened read-only for index inspection.
#[derive(Debug)]
pub struct Delta {
    file: File,
    path: PathBuf,
    header: ImageHeader,
}

impl Delta {
    /// Open `path` and validate its header.
    ///
    /// The image may be in use (dirty); the index is read as is.
    pub fn open(path: &Path, direct_io: bool) -> PloopResult<Self> {
        let mut options = OpenOptions::new();
        options.read(true);
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options
            .open(path)
            .map_err(|e| PloopError::io(IoOp::Open, path.display().to_string(), e))?;

        let file_size = file
            .metadata()
            .map_err(|e| PloopError::io(IoOp::Stat, path.display().to_string(), e))?
            .len();

        let mut page = PageBuf::new();
        read_page_at(&file, path, 0, &mut page)?;
        let header = ImageHeader::parse(page.as_bytes())
            .and_then(|h| h.validate().map(|()| h))
            .and_then(|h| h.check_file_size(file_size).map(|()| h))
            .map_err(|e| in_image(path, e))?;

        tracing::debug!(image = %path.display(), direct_io, "Opened delta");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            header,
        })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read index page `page` into `buf`.
    pub fn read_page(&self, page: u32, buf: &mut PageBuf) -> PloopResult<()> {
        read_page_at(&self.file, &self.path, page, buf)
    }
}

/// Prefix a format error with the image it was found in.
pub(crate) fn in_image(path: &Path, err: PloopError) -> PloopError {
    match err {
        PloopError::Format(msg) => PloopError::Format(format!("{} in image {}", msg, path.display())),
        other => other,
    }
}

/// Read cluster `page` of `file` into `buf`.
pub(crate) fn read_page_at(file: &File, path: &Path, page: u32, buf: &mut PageBuf) -> PloopResult<()> {
    file.read_exact_at(buf.as_bytes_mut(), page as u64 * CLUSTER_SIZE)
        .map_err(|e| {
            PloopError::io(
                IoOp::Read,
                format!("{} (index page {})", path.display(), page),
                e,
            )
        })
}
