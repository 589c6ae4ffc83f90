//! Smoke tests for the `stratus` binary surface.

use assert_cmd::Command;
use predicates::prelude::*;

fn stratus() -> Command {
    Command::cargo_bin("stratus").unwrap_or_else(|err| panic!("binary: {err}"))
}

#[test]
fn help_lists_command_groups() {
    stratus()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("cloud").and(predicate::str::contains("instance")));
}

#[test]
fn unknown_command_fails() {
    stratus().arg("teleport").assert().failure();
}

#[test]
fn missing_instance_is_reported() {
    let tmp = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let store_path = tmp.path().join("store.json");

    stratus()
        .env("STRATUS_STORE_PATH", &store_path)
        .args(["instance", "key", "ghost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("'ghost' not found"));
}

#[test]
fn cloud_ls_on_empty_store_prints_header() {
    let tmp = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let store_path = tmp.path().join("store.json");

    stratus()
        .env("STRATUS_STORE_PATH", &store_path)
        .args(["cloud", "ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("NAME").and(predicate::str::contains("PROVIDER")));
}
