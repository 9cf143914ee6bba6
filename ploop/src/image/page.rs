//! Cluster-sized, page-aligned I/O buffer.

use ploop_shared::constants::image::{CLUSTER_SIZE, SLOT_SIZE};

const ALIGN: usize = 4096;
const CHUNKS: usize = CLUSTER_SIZE as usize / ALIGN;

#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct Chunk([u8; ALIGN]);

/// One index page worth of bytes, aligned for `O_DIRECT`.
pub struct PageBuf {
    chunks: Vec<Chunk>,
}

impl PageBuf {
    pub fn new() -> Self {
        Self {
            chunks: vec![Chunk([0; ALIGN]); CHUNKS],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: `Chunk` is a repr(C) array of bytes without padding, so the
        // vector is CLUSTER_SIZE contiguous initialized bytes.
        unsafe { std::slice::from_raw_parts(self.chunks.as_ptr().cast::<u8>(), CHUNKS * ALIGN) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `as_bytes`; the borrow is exclusive.
        unsafe {
            std::slice::from_raw_parts_mut(self.chunks.as_mut_ptr().cast::<u8>(), CHUNKS * ALIGN)
        }
    }

    /// Raw value of slot position `pos` within the page.
    pub fn slot(&self, pos: usize) -> u32 {
        let off = pos * SLOT_SIZE;
        let mut raw = [0u8; SLOT_SIZE];
        raw.copy_from_slice(&self.as_bytes()[off..off + SLOT_SIZE]);
        u32::from_le_bytes(raw)
    }

    pub fn set_slot(&mut self, pos: usize, value: u32) {
        let off = pos * SLOT_SIZE;
        self.as_bytes_mut()[off..off + SLOT_SIZE].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for PageBuf {
    fn default() -> Self {
        Self::new()
    }
}
