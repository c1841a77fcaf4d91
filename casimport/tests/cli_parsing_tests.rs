//! Command line parsing tests for cas-import
//!
//! None of these reach the network: they either stop at `--help` or fail while resolving
//! remotes.

use assert_cmd::Command;
use predicates::prelude::*;

fn cas_import() -> Command {
    Command::cargo_bin("cas-import").unwrap()
}

#[test]
fn test_help_runs() {
    cas_import()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--copy-retry-interval"))
        .stdout(predicate::str::contains("Import options"));
}

#[test]
fn test_version_runs() {
    cas_import().arg("--version").assert().success();
}

#[test]
fn test_progress_type_aliases() {
    for progress_type in ["auto", "Auto", "ProgressBar", "progress-bar", "TextUpdates", "text-updates"] {
        cas_import()
            .args(["--progress-type", progress_type, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn test_progress_type_invalid() {
    cas_import()
        .args(["--progress-type", "fancy", "a", "b", "cas", "src"])
        .assert()
        .failure();
}

#[test]
fn test_requires_source_container() {
    cas_import()
        .args(["src", "dst", "cas"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("SRC_CONTAINERS"));
}

#[test]
fn test_invalid_retry_interval() {
    cas_import()
        .args(["--copy-retry-interval", "soon", "src", "dst", "cas", "files"])
        .assert()
        .failure();
}

#[test]
fn test_throttle_sizes_parse() {
    cas_import()
        .args(["--transfer-throttle", "50MiB", "--chunk-size", "1MiB", "--help"])
        .assert()
        .success();
}

#[test]
fn test_unknown_remote_fails() {
    let dir = tempfile::tempdir().unwrap();
    let remotes = dir.path().join("remotes.toml");
    cas_import()
        .arg("--remotes")
        .arg(&remotes)
        .args(["src", "dst", "cas", "files"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("unknown remote 'src'"));
}

#[test]
fn test_chunk_size_required_for_transfer_throttle() {
    let dir = tempfile::tempdir().unwrap();
    let remotes = dir.path().join("remotes.toml");
    cas_import()
        .arg("--remotes")
        .arg(&remotes)
        .args(["--transfer-throttle", "1MiB", "src", "dst", "cas", "files"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("chunk_size must be specified"));
}
