//! Constants shared across ploop crates.
//!
//! Centralized location for on-disk format values and well-known paths.

/// ploop image (delta) format
pub mod image {
    /// Sector size in bits (512 bytes)
    pub const SECTOR_BITS: u32 = 9;

    pub const SECTOR_SIZE: u64 = 1 << SECTOR_BITS;

    /// Cluster size in sectors, in bits (2048 sectors = 1 MiB)
    pub const CLUSTER_BITS: u32 = 11;

    /// Cluster size in sectors
    pub const CLUSTER_SECTORS: u32 = 1 << CLUSTER_BITS;

    /// Cluster size in bytes
    pub const CLUSTER_SIZE: u64 = (CLUSTER_SECTORS as u64) << SECTOR_BITS;

    /// Size of the on-disk header at offset 0
    pub const HEADER_SIZE: usize = 64;

    /// Size of one index slot
    pub const SLOT_SIZE: usize = 4;

    /// Slots per index page (one cluster)
    pub const SLOTS_PER_PAGE: u32 = (CLUSTER_SIZE as u32) / SLOT_SIZE as u32;

    /// Slot positions of page 0 occupied by the header
    pub const HEADER_SLOTS: u32 = (HEADER_SIZE / SLOT_SIZE) as u32;

    /// Largest index table the tools accept; twice its slot count is still a
    /// valid u32 block number
    pub const MAX_L1_PAGES: u32 = u32::MAX / SLOTS_PER_PAGE / 2;

    /// Version 1 signature (32-bit size field)
    pub const SIGNATURE_V1: &[u8; 16] = b"WithoutFreeSpace";

    /// Version 2 signature (64-bit size field)
    pub const SIGNATURE_V2: &[u8; 16] = b"WithouFreSpacExt";

    /// The only image type the tools operate on
    pub const TYPE_EXPANDED: u32 = 2;

    /// Header flag: image holds no data clusters
    pub const FLAG_EMPTY: u32 = 0x1;

    /// Byte offsets of header fields
    pub mod offsets {
        pub const SIGNATURE: usize = 0;
        pub const TYPE: usize = 16;
        pub const HEADS: usize = 20;
        pub const CYLINDERS: usize = 24;
        pub const SECTORS: usize = 28;
        pub const SIZE: usize = 32;
        pub const SIZE_IN_SECTORS: usize = 36;
        pub const DISK_IN_USE: usize = 44;
        pub const FIRST_BLOCK_OFFSET: usize = 48;
        pub const FLAGS: usize = 52;
        pub const RESERVED: usize = 56;
    }
}

/// Delta format names as exposed by the device
pub mod format {
    pub const PLOOP1: &str = "ploop1";
    pub const RAW: &str = "raw";
}

/// Kernel sysfs layout
pub mod sysfs {
    /// Default sysfs mount point
    pub const ROOT: &str = "/sys";

    /// Prefix of ploop device names
    pub const DEVICE_PREFIX: &str = "ploop";

    /// Start offset added when the filesystem sits on a dm-crypt slave (sectors)
    pub const CRYPT_START_OFFSET: u32 = 4096;
}

/// Lock files
pub mod lock {
    /// Default directory for the global lock
    pub const DIR: &str = "/var/lock/ploop";

    /// Global lock file name
    pub const GLOBAL_FILE: &str = "ploop.lck";
}

/// Environment variables
pub mod envs {
    pub const SYSFS_ROOT: &str = "PLOOP_SYSFS_ROOT";
    pub const LOCK_DIR: &str = "PLOOP_LOCK_DIR";
}
