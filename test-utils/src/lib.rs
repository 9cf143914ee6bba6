//! Test doubles and fixtures shared by the ploop integration tests.
//!
//! - [`ImageBuilder`]: writes small delta images with chosen index slots.
//! - [`FakeDevice`]: in-memory model of the device maintenance state machine.
//! - [`FakeBalloon`]: balloon file with a scripted physical layout.
//! - [`FakeSysfs`]: sysfs tree in a temporary directory.

mod balloon;
mod device;
mod image;
mod sysfs;

pub use balloon::FakeBalloon;
pub use device::{DeviceCall, FakeDevice};
pub use image::{ImageBuilder, read_header, read_slot};
pub use sysfs::{FakeSysfs, dev_id};
