//! Integration tests for the reconcile CLI
//!
//! Runs the binary against the simulated backend and checks exit codes and
//! the JSON step report.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn reconcile_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_reconcile"))
}

/// Simulated network with millisecond blocks.
fn write_fast_config(dir: &Path) -> PathBuf {
    let path = dir.join("reconcile.toml");
    let mut file = std::fs::File::create(&path).expect("Failed to create config");
    writeln!(
        file,
        r#"
backend = "sim"

[timeouts]
commit = 5000
verify = 10000

[sim]
commit_latency = 5
verify_latency = 10
"#
    )
    .expect("Failed to write config");
    path
}

fn run(args: &[&str]) -> Output {
    Command::new(reconcile_binary())
        .args(args)
        .env_remove("RECONCILE_CONFIG")
        .env_remove("RECONCILE_BACKEND")
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute reconcile")
}

#[test]
fn test_sim_run_exits_zero_and_writes_report() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fast_config(dir.path());
    let report = dir.path().join("report.json");

    let output = run(&[
        "--config",
        config.to_str().unwrap(),
        "--report",
        report.to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "reconcile failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    let steps = json["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 14);
    assert_eq!(steps[0]["step"], "auto_approved_deposit");
    assert_eq!(steps[13]["step"], "withdrawal");
    assert_eq!(steps[13]["token"], "ETH");
    assert!(steps[13]["verified_ms"].is_u64());
    assert!(json["finished_at"].is_string());
}

#[test]
fn test_native_only_run() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fast_config(dir.path());

    let output = run(&[
        "--config",
        config.to_str().unwrap(),
        "--tokens",
        "ETH",
        "--deposit-amount",
        "0.005",
    ]);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn test_unknown_token_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_fast_config(dir.path());

    let output = run(&[
        "--config",
        config.to_str().unwrap(),
        "--tokens",
        "0x7777777777777777777777777777777777777777",
    ]);
    assert_eq!(output.status.code(), Some(8));
}

#[test]
fn test_missing_config_file_fails() {
    let output = run(&["--config", "/nonexistent/reconcile.toml"]);
    assert!(!output.status.success());
}
