use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use ploop::ImageHeader;
use ploop_shared::constants::image::{CLUSTER_BITS, CLUSTER_SIZE, FLAG_EMPTY, HEADER_SIZE, SLOT_SIZE};

/// Builder for on-disk delta images.
///
/// Slots are given as logical cluster -> physical block. The file is as long
/// as the highest mapped block unless [`ImageBuilder::blocks`] says otherwise.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    size_in_sectors: u64,
    l1_pages: u32,
    slots: BTreeMap<u32, u32>,
    dirty: bool,
    flags: Option<u32>,
    blocks: Option<u32>,
    signature: Option<[u8; 16]>,
}

impl ImageBuilder {
    /// Image of `clusters` logical clusters with one index page.
    pub fn new(clusters: u32) -> Self {
        Self {
            size_in_sectors: (clusters as u64) << CLUSTER_BITS,
            l1_pages: 1,
            slots: BTreeMap::new(),
            dirty: false,
            flags: None,
            blocks: None,
            signature: None,
        }
    }

    pub fn l1_pages(mut self, pages: u32) -> Self {
        self.l1_pages = pages;
        self
    }

    /// Map logical cluster `clu` to physical block `iblk`.
    pub fn map(mut self, clu: u32, iblk: u32) -> Self {
        self.slots.insert(clu, iblk << CLUSTER_BITS);
        self
    }

    /// Store `value` in the slot of `clu` as is.
    pub fn raw_slot(mut self, clu: u32, value: u32) -> Self {
        self.slots.insert(clu, value);
        self
    }

    pub fn dirty(mut self, dirty: bool) -> Self {
        self.dirty = dirty;
        self
    }

    /// Header flags; by default the empty flag matches the mapped slots.
    pub fn flags(mut self, flags: u32) -> Self {
        self.flags = Some(flags);
        self
    }

    /// File length in clusters.
    pub fn blocks(mut self, blocks: u32) -> Self {
        self.blocks = Some(blocks);
        self
    }

    pub fn signature(mut self, signature: [u8; 16]) -> Self {
        self.signature = Some(signature);
        self
    }

    fn head(&self) -> u32 {
        self.slots
            .values()
            .map(|slot| (slot >> CLUSTER_BITS) + 1)
            .max()
            .unwrap_or(0)
            .max(self.l1_pages)
    }

    pub fn header(&self) -> ImageHeader {
        let mut header = ImageHeader::new(self.size_in_sectors, self.l1_pages);
        header.disk_in_use = u32::from(self.dirty);
        header.flags = self.flags.unwrap_or(if self.head() > self.l1_pages {
            0
        } else {
            FLAG_EMPTY
        });
        header
    }

    /// Write the image to `path`.
    pub fn write(&self, path: &Path) -> PathBuf {
        let file = File::create(path).unwrap();
        let blocks = self.blocks.unwrap_or_else(|| self.head());
        file.set_len(blocks as u64 * CLUSTER_SIZE).unwrap();

        let mut raw = self.header().to_bytes();
        if let Some(signature) = self.signature {
            raw[..16].copy_from_slice(&signature);
        }
        file.write_all_at(&raw, 0).unwrap();
        for (&clu, &value) in &self.slots {
            let offset = HEADER_SIZE as u64 + clu as u64 * SLOT_SIZE as u64;
            file.write_all_at(&value.to_le_bytes(), offset).unwrap();
        }
        file.sync_all().unwrap();
        path.to_path_buf()
    }
}

/// Raw slot value of logical cluster `clu`.
pub fn read_slot(path: &Path, clu: u32) -> u32 {
    let file = OpenOptions::new().read(true).open(path).unwrap();
    let mut raw = [0u8; SLOT_SIZE];
    file.read_exact_at(&mut raw, HEADER_SIZE as u64 + clu as u64 * SLOT_SIZE as u64)
        .unwrap();
    u32::from_le_bytes(raw)
}

pub fn read_header(path: &Path) -> ImageHeader {
    let file = File::open(path).unwrap();
    let mut raw = [0u8; HEADER_SIZE];
    file.read_exact_at(&mut raw, 0).unwrap();
    ImageHeader::parse(&raw).unwrap()
}
