use predicates::prelude::*;

mod common;

#[test]
fn test_balloon_requires_device() {
    let mut ctx = common::ploop();
    ctx.cmd.args(["balloon", "status"]).assert().code(40);
}

#[test]
fn test_balloon_rejects_bad_size() {
    let mut ctx = common::ploop();
    ctx.cmd
        .args(["balloon", "-d", "/dev/ploop1", "change", "-s", "12Q"])
        .assert()
        .code(40)
        .stderr(predicate::str::contains("unknown size suffix"));
}

#[test]
fn test_balloon_unknown_action() {
    let mut ctx = common::ploop();
    ctx.cmd
        .args(["balloon", "-d", "/dev/ploop1", "deflate"])
        .assert()
        .code(40);
}

#[test]
fn test_balloon_missing_device_node() {
    let mut ctx = common::ploop();
    let missing = ctx.dir.path().join("ploop404");

    ctx.cmd
        .arg("balloon")
        .arg("-d")
        .arg(&missing)
        .arg("status")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("ploop404"));
}
