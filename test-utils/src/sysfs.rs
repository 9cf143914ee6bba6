use std::fs;
use std::path::{Path, PathBuf};

use ploop::PloopOptions;
use tempfile::TempDir;

/// Device number for `major:minor`.
pub fn dev_id(major: u64, minor: u64) -> u64 {
    nix::sys::stat::makedev(major, minor)
}

/// A sysfs tree under a temporary directory.
///
/// Also provides a lock directory so [`FakeSysfs::options`] never touches
/// the host.
pub struct FakeSysfs {
    dir: TempDir,
}

impl Default for FakeSysfs {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSysfs {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sys").join("block")).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("sys")
    }

    /// Scratch directory next to the tree, e.g. for images.
    pub fn scratch(&self) -> &Path {
        self.dir.path()
    }

    /// Options pointing at this tree, with buffered index reads.
    pub fn options(&self) -> PloopOptions {
        PloopOptions {
            sysfs_root: self.root(),
            lock_dir: self.dir.path().join("lock"),
            direct_io: false,
        }
    }

    fn write(&self, rel: impl AsRef<Path>, value: &str) {
        let path = self.root().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("{value}\n")).unwrap();
    }

    /// Running device `name` with `deltas[level] = (image, format)`.
    pub fn add_device(&self, name: &str, deltas: &[(&Path, &str)]) {
        let dev = Path::new("block").join(name);
        let top = deltas.len().saturating_sub(1);
        self.write(dev.join("pstate").join("top"), &top.to_string());
        self.write(dev.join("pstate").join("cookie"), "");
        for (level, (image, format)) in deltas.iter().enumerate() {
            let delta = dev.join("pdelta").join(level.to_string());
            self.write(delta.join("image"), &image.display().to_string());
            self.write(delta.join("format"), format);
        }
    }

    pub fn add_partition(&self, device: &str, partition: &str) {
        fs::create_dir_all(self.root().join("block").join(device).join(partition)).unwrap();
    }

    /// Block device `major:minor`; `start` is its partition offset in sectors.
    pub fn add_block_dev(&self, major: u64, minor: u64, start: Option<u32>) {
        let dir = Path::new("dev").join("block").join(format!("{major}:{minor}"));
        fs::create_dir_all(self.root().join(&dir)).unwrap();
        if let Some(start) = start {
            self.write(dir.join("start"), &start.to_string());
        }
    }

    /// dm-crypt device `major:minor` sitting on partition `slave`.
    pub fn add_crypt_dev(&self, major: u64, minor: u64, slave: &str, slave_start: u32) {
        let dir = Path::new("dev").join("block").join(format!("{major}:{minor}"));
        fs::create_dir_all(self.root().join(&dir).join("slaves").join(slave)).unwrap();
        self.write(
            Path::new("class").join("block").join(slave).join("start"),
            &slave_start.to_string(),
        );
    }
}
