//! Command line behaviour that does not need external tools.

use assert_cmd::Command;
use predicates::prelude::*;

fn port() -> Command {
    let mut cmd = Command::cargo_bin("kodegen_bundler_port").unwrap();
    for var in [
        "KODEGEN_PORT_PAYLOAD",
        "KODEGEN_PORT_INSTALL_DIR",
        "KODEGEN_PORT_PROFILE",
        "KODEGEN_PORT_CACHE_DIR",
        "KODEGEN_PORT_RUNTIME_DIR",
        "KODEGEN_PORT_SCRATCH_DIR",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn test_help_lists_overrides() {
    port()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--payload"))
        .stdout(predicate::str::contains("--install-dir"));
}

#[test]
fn test_missing_input_fails_without_json() {
    let tmp = tempfile::tempdir().unwrap();
    port()
        .arg(tmp.path().join("missing.dmg"))
        .arg("--install-dir")
        .arg(tmp.path().join("out"))
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("✗"))
        .stderr(predicate::str::contains("does not exist"));
    assert!(!tmp.path().join("out").exists());
}

#[test]
fn test_invalid_start_url_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    port()
        .arg("--start-url")
        .arg("not a url")
        .arg("--install-dir")
        .arg(tmp.path().join("out"))
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("--start-url"));
}

#[test]
fn test_broken_profile_rejected_with_suggestions() {
    let tmp = tempfile::tempdir().unwrap();
    let profile = tmp.path().join("profile.toml");
    std::fs::write(&profile, "name = [unterminated").unwrap();

    port()
        .arg("--profile")
        .arg(&profile)
        .arg("--install-dir")
        .arg(tmp.path().join("out"))
        .arg("--cache-dir")
        .arg(tmp.path().join("cache"))
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("profile"));
}
