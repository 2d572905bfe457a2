//! Smoke tests -- verify the binary runs and the subcommands are wired up.

use assert_cmd::Command;
use predicates::prelude::*;

fn write_config(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("ctlbench.toml");
    std::fs::write(&path, body).unwrap();
    path
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("ctlbench")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("SDN controllers"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("ctlbench")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("ctlbench"));
}

#[test]
fn test_run_subcommand_exists() {
    Command::cargo_bin("ctlbench")
        .unwrap()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--output-dir"));
}

#[test]
fn test_plan_lists_combinations() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        r#"
[test]
test_repeats = 2

[[dimensions]]
name = "threads"
values = [1, 4]
"#,
    );

    Command::cargo_bin("ctlbench")
        .unwrap()
        .arg("plan")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(
            predicates::str::contains("4 combination(s)")
                .and(predicates::str::contains("threads=1 repeat_id=0"))
                .and(predicates::str::contains("threads=4 repeat_id=1")),
        );
}

#[test]
fn test_plan_json() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "[[dimensions]]\nname = \"mode\"\nvalues = [\"Latency\", \"Throughput\"]\n",
    );

    let output = Command::cargo_bin("ctlbench")
        .unwrap()
        .args(["plan", "--json", "--config"])
        .arg(&config)
        .output()
        .unwrap();
    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed[1]["mode"], "Throughput");
}

#[test]
fn test_invalid_config_fails() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(dir.path(), "[monitor]\nchannel_capacity = 0\n");

    Command::cargo_bin("ctlbench")
        .unwrap()
        .arg("plan")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure();
}

#[test]
fn test_check_reports_missing_handler() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        &format!(
            "[controller]\nbase_dir = \"{}\"\n",
            dir.path().join("no-such-controller").display()
        ),
    );

    Command::cargo_bin("ctlbench")
        .unwrap()
        .arg("check")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicates::str::contains("handler not found"));
}
