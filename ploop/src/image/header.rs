//! On-disk image header.

use ploop_shared::constants::image::{
    CLUSTER_BITS, CLUSTER_SECTORS, CLUSTER_SIZE, FLAG_EMPTY, HEADER_SIZE, HEADER_SLOTS,
    MAX_L1_PAGES, SIGNATURE_V1, SIGNATURE_V2, SLOTS_PER_PAGE, TYPE_EXPANDED, offsets,
};
use ploop_shared::errors::{PloopError, PloopResult};
use serde::Serialize;

/// Header revision, selected by the signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderVersion {
    /// `WithoutFreeSpace`: 32-bit size in sectors
    V1,
    /// `WithouFreSpacExt`: 64-bit size in sectors
    V2,
}

impl HeaderVersion {
    pub fn signature(&self) -> &'static [u8; 16] {
        match self {
            HeaderVersion::V1 => SIGNATURE_V1,
            HeaderVersion::V2 => SIGNATURE_V2,
        }
    }
}

/// Decoded 64-byte image header.
///
/// Fields the tools never interpret (geometry, reserved bytes, the unused
/// half of the v1 size) are carried along so that a rewrite changes only
/// the in-use marker and the flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: HeaderVersion,
    pub image_type: u32,
    pub heads: u32,
    pub cylinders: u32,
    /// Cluster size in sectors.
    pub cluster_sectors: u32,
    pub size_tracks: u32,
    /// Virtual disk size in sectors.
    pub size_in_sectors: u64,
    pub disk_in_use: u32,
    /// Offset of the first data cluster, in sectors.
    pub first_block_offset: u32,
    pub flags: u32,
    pub reserved: [u8; 8],
    v1_unused: u32,
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn write_u32(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

impl ImageHeader {
    /// Header for a fresh v2 image with `l1_pages` index pages.
    pub fn new(size_in_sectors: u64, l1_pages: u32) -> Self {
        let heads = 16;
        let sectors_per_track = 63;
        let cylinders = size_in_sectors.div_ceil(heads * sectors_per_track) as u32;
        Self {
            version: HeaderVersion::V2,
            image_type: TYPE_EXPANDED,
            heads: heads as u32,
            cylinders,
            cluster_sectors: CLUSTER_SECTORS,
            size_tracks: size_in_sectors.div_ceil(CLUSTER_SECTORS as u64) as u32,
            size_in_sectors,
            disk_in_use: 0,
            first_block_offset: l1_pages << CLUSTER_BITS,
            flags: FLAG_EMPTY,
            reserved: [0; 8],
            v1_unused: 0,
        }
    }

    /// Decode a header, checking only the signature.
    ///
    /// Use [`ImageHeader::validate`] before trusting the geometry.
    pub fn parse(buf: &[u8]) -> PloopResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(PloopError::Format(format!(
                "header too short: {} bytes",
                buf.len()
            )));
        }

        let sig = &buf[offsets::SIGNATURE..offsets::SIGNATURE + 16];
        let version = if sig == SIGNATURE_V2 {
            HeaderVersion::V2
        } else if sig == SIGNATURE_V1 {
            HeaderVersion::V1
        } else {
            return Err(PloopError::Format("wrong signature".into()));
        };

        let lo = read_u32(buf, offsets::SIZE_IN_SECTORS);
        let hi = read_u32(buf, offsets::SIZE_IN_SECTORS + 4);
        let (size_in_sectors, v1_unused) = match version {
            HeaderVersion::V2 => ((hi as u64) << 32 | lo as u64, 0),
            HeaderVersion::V1 => (lo as u64, hi),
        };

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[offsets::RESERVED..offsets::RESERVED + 8]);

        Ok(Self {
            version,
            image_type: read_u32(buf, offsets::TYPE),
            heads: read_u32(buf, offsets::HEADS),
            cylinders: read_u32(buf, offsets::CYLINDERS),
            cluster_sectors: read_u32(buf, offsets::SECTORS),
            size_tracks: read_u32(buf, offsets::SIZE),
            size_in_sectors,
            disk_in_use: read_u32(buf, offsets::DISK_IN_USE),
            first_block_offset: read_u32(buf, offsets::FIRST_BLOCK_OFFSET),
            flags: read_u32(buf, offsets::FLAGS),
            reserved,
            v1_unused,
        })
    }

    /// Check type, cluster size and index geometry.
    pub fn validate(&self) -> PloopResult<()> {
        if self.image_type != TYPE_EXPANDED {
            return Err(PloopError::Format(format!(
                "wrong type {}",
                self.image_type
            )));
        }
        if self.cluster_sectors != CLUSTER_SECTORS {
            return Err(PloopError::Format(format!(
                "wrong cluster size {} sectors",
                self.cluster_sectors
            )));
        }
        if self.l1_pages() == 0 || self.first_block_offset % self.cluster_sectors != 0 {
            return Err(PloopError::Format(format!(
                "wrong first block offset {}",
                self.first_block_offset
            )));
        }
        if self.l1_pages() > MAX_L1_PAGES {
            return Err(PloopError::Format(format!(
                "index table of {} pages is too large",
                self.l1_pages()
            )));
        }
        Ok(())
    }

    /// Check that the index pages fit in a file of `file_size` bytes.
    pub fn check_file_size(&self, file_size: u64) -> PloopResult<()> {
        let index_size = self.l1_pages() as u64 * CLUSTER_SIZE;
        if index_size > file_size {
            return Err(PloopError::Format(format!(
                "index table of {} pages extends past end of file ({} bytes)",
                self.l1_pages(),
                file_size
            )));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[offsets::SIGNATURE..offsets::SIGNATURE + 16].copy_from_slice(self.version.signature());
        write_u32(&mut buf, offsets::TYPE, self.image_type);
        write_u32(&mut buf, offsets::HEADS, self.heads);
        write_u32(&mut buf, offsets::CYLINDERS, self.cylinders);
        write_u32(&mut buf, offsets::SECTORS, self.cluster_sectors);
        write_u32(&mut buf, offsets::SIZE, self.size_tracks);
        match self.version {
            HeaderVersion::V2 => {
                buf[offsets::SIZE_IN_SECTORS..offsets::SIZE_IN_SECTORS + 8]
                    .copy_from_slice(&self.size_in_sectors.to_le_bytes());
            }
            HeaderVersion::V1 => {
                write_u32(&mut buf, offsets::SIZE_IN_SECTORS, self.size_in_sectors as u32);
                write_u32(&mut buf, offsets::SIZE_IN_SECTORS + 4, self.v1_unused);
            }
        }
        write_u32(&mut buf, offsets::DISK_IN_USE, self.disk_in_use);
        write_u32(&mut buf, offsets::FIRST_BLOCK_OFFSET, self.first_block_offset);
        write_u32(&mut buf, offsets::FLAGS, self.flags);
        buf[offsets::RESERVED..offsets::RESERVED + 8].copy_from_slice(&self.reserved);
        buf
    }

    /// Number of cluster-sized index pages preceding the data area.
    pub fn l1_pages(&self) -> u32 {
        self.first_block_offset >> CLUSTER_BITS
    }

    /// Number of logical cluster slots the index pages can hold.
    pub fn slot_count(&self) -> u32 {
        self.l1_pages()
            .saturating_mul(SLOTS_PER_PAGE)
            .saturating_sub(HEADER_SLOTS)
    }

    pub fn is_dirty(&self) -> bool {
        self.disk_in_use != 0
    }

    pub fn is_empty(&self) -> bool {
        self.flags & FLAG_EMPTY != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_validates() {
        let header = ImageHeader::new(2048 * 100, 1);
        header.validate().unwrap();
        assert_eq!(header.l1_pages(), 1);
        assert_eq!(header.slot_count(), SLOTS_PER_PAGE - 16);
        assert!(header.is_empty());
        assert!(!header.is_dirty());
    }

    #[test]
    fn test_parse_preserves_untouched_fields() {
        let mut header = ImageHeader::new(2048 * 10, 2);
        header.reserved = [1, 2, 3, 4, 5, 6, 7, 8];
        header.disk_in_use = 1;
        let parsed = ImageHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.l1_pages(), 2);
    }

    #[test]
    fn test_v1_size_uses_low_word() {
        let mut bytes = ImageHeader::new(4096, 1).to_bytes();
        bytes[..16].copy_from_slice(SIGNATURE_V1);
        bytes[offsets::SIZE_IN_SECTORS + 4..offsets::SIZE_IN_SECTORS + 8]
            .copy_from_slice(&7u32.to_le_bytes());
        let header = ImageHeader::parse(&bytes).unwrap();
        assert_eq!(header.version, HeaderVersion::V1);
        assert_eq!(header.size_in_sectors, 4096);
        assert_eq!(header.to_bytes(), bytes);
    }

    #[test]
    fn test_wrong_signature() {
        let mut bytes = ImageHeader::new(4096, 1).to_bytes();
        bytes[0] = b'X';
        let err = ImageHeader::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("wrong signature"));
    }

    #[test]
    fn test_validate_rejects_geometry() {
        let mut header = ImageHeader::new(4096, 1);
        header.cluster_sectors = 8;
        assert!(header.validate().unwrap_err().to_string().contains("cluster size"));

        let mut header = ImageHeader::new(4096, 1);
        header.first_block_offset = 0;
        assert!(header.validate().unwrap_err().to_string().contains("first block"));

        let mut header = ImageHeader::new(4096, 1);
        header.first_block_offset = CLUSTER_SECTORS + 8;
        assert!(header.validate().is_err());

        let mut header = ImageHeader::new(4096, 1);
        header.image_type = 1;
        assert!(header.validate().unwrap_err().to_string().contains("wrong type"));
    }

    #[test]
    fn test_oversized_index_is_rejected() {
        let header = ImageHeader::new(4096, MAX_L1_PAGES + 1);
        let err = header.validate().unwrap_err();
        assert!(matches!(err, PloopError::Format(_)));
        assert!(err.to_string().contains("too large"), "{err}");

        let mut header = ImageHeader::new(4096, 1);
        header.first_block_offset = u32::MAX & !(CLUSTER_SECTORS - 1);
        assert!(header.validate().is_err());
        assert!(header.slot_count() > 0);

        ImageHeader::new(4096, MAX_L1_PAGES).validate().unwrap();
    }

    #[test]
    fn test_index_must_fit_in_file() {
        let header = ImageHeader::new(2048 * 64, 4);
        header.check_file_size(4 * CLUSTER_SIZE).unwrap();
        let err = header.check_file_size(2 * CLUSTER_SIZE).unwrap_err();
        assert!(err.to_string().contains("past end of file"), "{err}");
    }
}
