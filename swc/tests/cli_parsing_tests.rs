use assert_cmd::Command;
use predicates::prelude::*;

fn swc() -> Command {
    Command::cargo_bin("swc").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    swc()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("temp-url"))
        .stdout(predicate::str::contains("mkcontainer"))
        .stdout(predicate::str::contains("download"));
}

#[test]
fn test_version() {
    swc()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("swc"));
}

#[test]
fn test_subcommand_is_required() {
    swc()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_temp_url_rejects_bad_ttl() {
    swc()
        .args(["temp-url", "photos", "cat.jpg", "--ttl", "forever"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--ttl"));
}

#[test]
fn test_download_requires_destination() {
    swc()
        .args(["download", "photos", "cat.jpg"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("<FILE>"));
}

#[test]
fn test_unknown_remote() {
    let dir = tempfile::tempdir().unwrap();
    let remotes = dir.path().join("remotes.toml");
    std::fs::write(&remotes, "").unwrap();
    swc()
        .args(["--remotes", remotes.to_str().unwrap(), "--remote", "backup"])
        .args(["list", "photos"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown remote 'backup'"));
}
