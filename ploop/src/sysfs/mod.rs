//! Device topology from sysfs.
//!
//! A running ploop device publishes its delta stack under
//! `/sys/block/<dev>/pdelta/<level>/` and its state under
//! `/sys/block/<dev>/pstate/`. Partition offsets come from the generic block
//! layer (`/sys/dev/block/<major>:<minor>/start`).

use std::fs;
use std::path::{Path, PathBuf};

use nix::sys::stat::{major, minor};
use ploop_shared::constants::sysfs::{CRYPT_START_OFFSET, DEVICE_PREFIX};
use ploop_shared::errors::{PloopError, PloopResult};
use serde::Serialize;

use crate::lock::GlobalLock;

/// One delta of a device's stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaInfo {
    pub level: u32,
    pub image: PathBuf,
    /// Format name, e.g. `ploop1` or `raw`.
    pub format: String,
}

/// Reader for a sysfs tree rooted at `root` (normally `/sys`).
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_dir(&self, device: &str) -> PathBuf {
        self.root.join("block").join(device)
    }

    fn read_attr(&self, path: &Path) -> PloopResult<String> {
        fs::read_to_string(path)
            .map(|s| s.trim_end_matches('\n').to_string())
            .map_err(|e| PloopError::Sysfs(format!("can't read {}: {}", path.display(), e)))
    }

    fn read_u32(&self, path: &Path) -> PloopResult<u32> {
        let value = self.read_attr(path)?;
        value.trim().parse().map_err(|_| {
            PloopError::Sysfs(format!("unexpected value {:?} in {}", value, path.display()))
        })
    }

    /// Level of the top delta of `device`.
    pub fn top_level(&self, device: &str) -> PloopResult<u32> {
        self.read_u32(&self.block_dir(device).join("pstate").join("top"))
    }

    /// Cookie the device was started with (empty when none).
    pub fn cookie(&self, device: &str) -> PloopResult<String> {
        self.read_attr(&self.block_dir(device).join("pstate").join("cookie"))
    }

    pub fn delta(&self, device: &str, level: u32) -> PloopResult<DeltaInfo> {
        let dir = self
            .block_dir(device)
            .join("pdelta")
            .join(level.to_string());
        Ok(DeltaInfo {
            level,
            image: PathBuf::from(self.read_attr(&dir.join("image"))?),
            format: self.read_attr(&dir.join("format"))?,
        })
    }

    pub fn top_delta(&self, device: &str) -> PloopResult<DeltaInfo> {
        let level = self.top_level(device)?;
        self.delta(device, level)
    }

    /// Level at which `image` is attached to `device`, if it is.
    pub fn find_level_by_delta(&self, device: &str, image: &Path) -> PloopResult<Option<u32>> {
        let wanted = canonical(image);
        for level in 0..=self.top_level(device)? {
            let delta = self.delta(device, level)?;
            if canonical(&delta.image) == wanted {
                return Ok(Some(level));
            }
        }
        Ok(None)
    }

    /// Start sector of the block device `dev` within its parent.
    ///
    /// Devices sitting on a dm-crypt mapping have no `start` of their own;
    /// the first slave's start plus the fixed crypt header offset is used.
    /// A whole-disk device starts at 0.
    pub fn partition_start(&self, dev: u64) -> PloopResult<u32> {
        let dir = self
            .root
            .join("dev")
            .join("block")
            .join(format!("{}:{}", major(dev), minor(dev)));
        if !dir.exists() {
            return Err(PloopError::Sysfs(format!(
                "no such block device {}",
                dir.display()
            )));
        }

        let start = dir.join("start");
        if start.exists() {
            return self.read_u32(&start);
        }

        let slaves = list_dir(&dir.join("slaves"))?;
        if let Some(slave) = slaves.first() {
            // TODO: take the data offset from the dm-crypt table instead
            // of assuming the default header size.
            let slave_start = self.root.join("class").join("block").join(slave).join("start");
            let base = self.read_u32(&slave_start)?;
            return base.checked_add(CRYPT_START_OFFSET).ok_or_else(|| {
                PloopError::Sysfs(format!(
                    "start {} of {} overflows with the crypt header",
                    base,
                    slave_start.display()
                ))
            });
        }

        tracing::debug!(dev = %dir.display(), "Block device has no partition offset");
        Ok(0)
    }

    /// First partition of `device` (`ploop0p1`), or the device itself.
    pub fn partition_device(&self, device: &str) -> PloopResult<String> {
        let prefix = format!("{device}p");
        let parts: Vec<String> = list_dir(&self.block_dir(device))?
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect();
        Ok(parts.into_iter().next().unwrap_or_else(|| device.to_string()))
    }

    /// Running ploop devices whose base delta is `image`.
    ///
    /// The global lock must be held so devices don't come and go mid-scan.
    pub fn devices_by_delta(&self, _lock: &GlobalLock, image: &Path) -> PloopResult<Vec<String>> {
        let wanted = canonical(image);
        let mut found = Vec::new();

        for name in list_dir(&self.root.join("block"))? {
            if !is_ploop_device(&name) {
                continue;
            }
            let base = self.block_dir(&name).join("pdelta").join("0").join("image");
            // A device without deltas is not started.
            let Ok(path) = self.read_attr(&base) else {
                continue;
            };
            if canonical(Path::new(&path)) == wanted {
                found.push(name);
            }
        }

        tracing::debug!(image = %image.display(), devices = ?found, "Looked up devices by delta");
        Ok(found)
    }
}

fn is_ploop_device(name: &str) -> bool {
    name.strip_prefix(DEVICE_PREFIX)
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Sorted entry names of `dir`; a missing directory is empty.
fn list_dir(dir: &Path) -> PloopResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(PloopError::Sysfs(format!(
                "can't list {}: {}",
                dir.display(),
                e
            )));
        }
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| PloopError::Sysfs(format!("can't list {}: {}", dir.display(), e)))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ploop_device() {
        assert!(is_ploop_device("ploop0"));
        assert!(is_ploop_device("ploop12345"));
        assert!(!is_ploop_device("ploop0p1"));
        assert!(!is_ploop_device("ploop"));
        assert!(!is_ploop_device("loop0"));
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_dir(&dir.path().join("nope")).unwrap().is_empty());
    }
}
