//! Topology lookups against a fake sysfs tree.

use ploop::lock::GlobalLock;
use ploop::{ExitStatus, SysfsTopology};
use ploop_test_utils::{FakeSysfs, dev_id};

#[test]
fn top_delta_of_a_stack() {
    let sysfs = FakeSysfs::new();
    let base = sysfs.scratch().join("root.hdd");
    let top = sysfs.scratch().join("root.hdd.snap");
    std::fs::write(&base, b"").unwrap();
    std::fs::write(&top, b"").unwrap();
    sysfs.add_device("ploop7", &[(&base, "ploop1"), (&top, "ploop1")]);

    let topo = SysfsTopology::new(sysfs.root());
    assert_eq!(topo.top_level("ploop7").unwrap(), 1);
    let delta = topo.top_delta("ploop7").unwrap();
    assert_eq!(delta.image, top);
    assert_eq!(delta.format, "ploop1");
    assert_eq!(topo.cookie("ploop7").unwrap(), "");

    assert_eq!(topo.find_level_by_delta("ploop7", &base).unwrap(), Some(0));
    let other = sysfs.scratch().join("other.hdd");
    assert_eq!(topo.find_level_by_delta("ploop7", &other).unwrap(), None);
}

#[test]
fn missing_device_is_sysfs_error() {
    let sysfs = FakeSysfs::new();
    let topo = SysfsTopology::new(sysfs.root());
    let err = topo.top_delta("ploop99").unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::Sysfs);
}

#[test]
fn partition_start_variants() {
    let sysfs = FakeSysfs::new();
    sysfs.add_block_dev(182, 1, Some(2048));
    sysfs.add_block_dev(182, 0, None);
    sysfs.add_crypt_dev(253, 0, "ploop5p1", 2048);
    let topo = SysfsTopology::new(sysfs.root());

    assert_eq!(topo.partition_start(dev_id(182, 1)).unwrap(), 2048);
    assert_eq!(topo.partition_start(dev_id(182, 0)).unwrap(), 0);
    assert_eq!(topo.partition_start(dev_id(253, 0)).unwrap(), 2048 + 4096);

    let err = topo.partition_start(dev_id(8, 3)).unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::Sysfs);
}

#[test]
fn crypt_offset_past_sector_range_is_rejected() {
    let sysfs = FakeSysfs::new();
    sysfs.add_crypt_dev(253, 1, "ploop6p1", u32::MAX - 10);
    let topo = SysfsTopology::new(sysfs.root());

    let err = topo.partition_start(dev_id(253, 1)).unwrap_err();
    assert_eq!(err.exit_status(), ExitStatus::Sysfs);
    assert!(err.to_string().contains("overflows"), "{err}");
}

#[test]
fn partition_device_falls_back_to_whole_disk() {
    let sysfs = FakeSysfs::new();
    let image = sysfs.scratch().join("root.hdd");
    sysfs.add_device("ploop3", &[(&image, "ploop1")]);
    sysfs.add_device("ploop4", &[(&image, "ploop1")]);
    sysfs.add_partition("ploop3", "ploop3p1");

    let topo = SysfsTopology::new(sysfs.root());
    assert_eq!(topo.partition_device("ploop3").unwrap(), "ploop3p1");
    assert_eq!(topo.partition_device("ploop4").unwrap(), "ploop4");
}

#[test]
fn devices_by_base_delta() {
    let sysfs = FakeSysfs::new();
    let image = sysfs.scratch().join("root.hdd");
    let other = sysfs.scratch().join("other.hdd");
    std::fs::write(&image, b"").unwrap();
    std::fs::write(&other, b"").unwrap();
    sysfs.add_device("ploop10", &[(&image, "ploop1")]);
    sysfs.add_device("ploop11", &[(&other, "ploop1")]);
    sysfs.add_device("ploop12", &[(&image, "ploop1")]);
    sysfs.add_partition("ploop10", "ploop10p1");

    let opts = sysfs.options();
    let lock = GlobalLock::acquire(&opts.global_lock_path()).unwrap();
    let topo = SysfsTopology::new(&opts.sysfs_root);
    let found = topo.devices_by_delta(&lock, &image).unwrap();
    assert_eq!(found, vec!["ploop10".to_string(), "ploop12".to_string()]);
}
