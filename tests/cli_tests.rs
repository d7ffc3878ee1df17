//! CLI integration tests
//!
//! Tests the command-line interface using assert_cmd

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Command for the worker-comms binary, isolated from any user config
fn comms_cmd(home: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("worker-comms").unwrap();
    cmd.current_dir(home.path())
        .env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join(".config"))
        .env_remove("WORKER_COMMS_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

// ─────────────────────────────────────────────────────────────────
// Help and Version
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("agent"))
        .stdout(predicate::str::contains("orchestrate"))
        .stdout(predicate::str::contains("local"))
        .stdout(predicate::str::contains("allocate"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version_command() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home)
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("worker-comms"))
        .stdout(predicate::str::contains("Protocol:"))
        .stdout(predicate::str::contains("Target:"));
}

#[test]
fn test_version_json() {
    let home = TempDir::new().unwrap();
    let output = comms_cmd(&home).args(["version", "--json"]).output().unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["name"], "worker-comms");
    assert!(json["git_hash"].is_string());
}

// ─────────────────────────────────────────────────────────────────
// Config Commands
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_config_show_default() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[network]"))
        .stdout(predicate::str::contains("[endpoint]"))
        .stdout(predicate::str::contains("[cluster]"))
        .stdout(predicate::str::contains("[logging]"));
}

#[test]
fn test_config_show_env_override() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home)
        .args(["config", "show"])
        .env("WORKER_COMMS_PORT_MIN", "20000")
        .env("WORKER_COMMS_WORKER_ID", "gpu-node-4")
        .assert()
        .success()
        .stdout(predicate::str::contains("port_min = 20000"))
        .stdout(predicate::str::contains("gpu-node-4"));
}

#[test]
fn test_config_validate_default() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_config_validate_bad_port_range() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("bad.toml");
    fs::write(&path, "[network]\nport_min = 30000\nport_max = 20000\n").unwrap();

    comms_cmd(&home)
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("E102"))
        .stderr(predicate::str::contains("port range is empty"));
}

#[test]
fn test_config_validate_missing_file() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home)
        .args(["config", "validate", "--config", "does-not-exist.toml"])
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("not found"));
}

#[test]
fn test_config_init_then_refuse_overwrite() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("worker-comms.toml");

    comms_cmd(&home)
        .args(["config", "init", "--path"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.exists());

    comms_cmd(&home)
        .args(["config", "init", "--path"])
        .arg(&path)
        .assert()
        .failure();

    comms_cmd(&home)
        .args(["config", "init", "--force", "--path"])
        .arg(&path)
        .assert()
        .success();

    comms_cmd(&home)
        .args(["config", "validate", "--config"])
        .arg(&path)
        .assert()
        .success();
}

// ─────────────────────────────────────────────────────────────────
// Runtime Commands
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_allocate_prints_address() {
    let home = TempDir::new().unwrap();
    let output = comms_cmd(&home).args(["-q", "allocate"]).output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let address: std::net::SocketAddrV4 = stdout.trim().parse().unwrap();
    assert!((10000..32000).contains(&address.port()));
}

#[test]
fn test_allocate_unknown_interface() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home)
        .args(["allocate", "--interface", "no-such-iface0"])
        .assert()
        .failure()
        .code(30)
        .stderr(predicate::str::contains("E300"));
}

#[test]
fn test_local_cluster_exchanges_messages() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home)
        .args(["-q", "local", "--workers", "3"])
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .success()
        .stdout(predicate::str::contains("w0"))
        .stdout(predicate::str::contains("w2"))
        .stdout(predicate::str::contains("sent=2 received=2"));
}

#[test]
fn test_no_subcommand_fails() {
    let home = TempDir::new().unwrap();
    comms_cmd(&home).assert().failure();
}
