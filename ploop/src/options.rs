//! Configuration for ploop tooling.

use std::path::PathBuf;

use ploop_shared::constants::{envs, lock, sysfs};
use serde::{Deserialize, Serialize};

/// Configuration options shared by the balloon and topology code.
///
/// Users can create it with `PloopOptions::default()` or customize fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PloopOptions {
    /// Mount point of sysfs. Defaults to `/sys`, or `PLOOP_SYSFS_ROOT` if set.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,

    /// Directory holding the global lock file. Defaults to `/var/lock/ploop`,
    /// or `PLOOP_LOCK_DIR` if set.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    /// Read image index pages with `O_DIRECT`, bypassing the page cache.
    ///
    /// The running device updates the index behind the page cache, so this
    /// should stay on for mounted images.
    #[serde(default = "default_direct_io")]
    pub direct_io: bool,
}

fn default_sysfs_root() -> PathBuf {
    std::env::var_os(envs::SYSFS_ROOT)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(sysfs::ROOT))
}

fn default_lock_dir() -> PathBuf {
    std::env::var_os(envs::LOCK_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(lock::DIR))
}

fn default_direct_io() -> bool {
    true
}

impl Default for PloopOptions {
    fn default() -> Self {
        Self {
            sysfs_root: default_sysfs_root(),
            lock_dir: default_lock_dir(),
            direct_io: default_direct_io(),
        }
    }
}

impl PloopOptions {
    pub fn global_lock_path(&self) -> PathBuf {
        self.lock_dir.join(lock::GLOBAL_FILE)
    }
}
