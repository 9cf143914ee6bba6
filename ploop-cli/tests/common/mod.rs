#![allow(dead_code)]

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use ploop_test_utils::ImageBuilder;
use tempfile::TempDir;

pub struct TestContext {
    pub cmd: Command,
    pub dir: TempDir,
}

impl TestContext {
    pub fn new_cmd(&self) -> Command {
        scratch_cmd(self.dir.path())
    }

    /// Write an image into the scratch dir and return its path.
    pub fn image(&self, builder: ImageBuilder) -> PathBuf {
        builder.write(&self.dir.path().join("root.hdd"))
    }
}

// Keep sysfs lookups and the global lock inside the scratch dir.
fn scratch_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_ploop"));
    cmd.env("PLOOP_SYSFS_ROOT", dir.join("sys"));
    cmd.env("PLOOP_LOCK_DIR", dir);
    cmd.env_remove("RUST_LOG");
    cmd
}

pub fn ploop() -> TestContext {
    let dir = tempfile::tempdir().expect("Failed to create scratch dir");
    TestContext {
        cmd: scratch_cmd(dir.path()),
        dir,
    }
}
