//! End-to-end tests for the proctor binary.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

fn write_plan(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn proctor(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_proctor"))
        .args(args)
        .env("PROCTOR_LOG_DIR", dir.join("logs"))
        .env_remove("PROCTOR_CONFIG")
        .current_dir(dir)
        .output()
        .unwrap()
}

const PASSING: &str = r#"
[[scenarios]]
name = "echo"

[[scenarios.steps]]
kind = "run"
program = "/bin/sh"
args = ["-c", "echo hello from the tool"]

[[scenarios.steps]]
kind = "expect"
expectation = { kind = "contains_line", needle = "hello" }
"#;

const FAILING: &str = r#"
[[scenarios]]
name = "wrong exit"

[[scenarios.steps]]
kind = "run"
program = "/bin/sh"
args = ["-c", "echo oops; exit 3"]

[[scenarios]]
name = "never reached"

[[scenarios.steps]]
kind = "run"
program = "/bin/true"
"#;

#[test]
fn test_run_passing_plan() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, "pass.toml", PASSING);

    let out = proctor(dir.path(), &["run", plan.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success(), "stdout: {stdout}");
    assert!(stdout.contains("PASS  echo"));
    assert!(stdout.contains("1 passed, 0 failed"));
}

#[test]
fn test_run_stops_after_failure() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, "fail.toml", FAILING);

    let out = proctor(dir.path(), &["run", plan.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout.contains("FAIL  wrong exit"));
    assert!(!stdout.contains("never reached"));
}

#[test]
fn test_keep_going_runs_everything() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, "fail.toml", FAILING);

    let out = proctor(dir.path(), &["run", "--keep-going", plan.to_str().unwrap()]);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout.contains("PASS  never reached"));
    assert!(stdout.contains("1 passed, 1 failed"));
}

#[test]
fn test_validate_reports_bad_plan() {
    let dir = TempDir::new().unwrap();
    let good = write_plan(&dir, "good.toml", PASSING);
    let bad = write_plan(
        &dir,
        "bad.toml",
        "[[scenarios]]\nname = \"x\"\n[[scenarios.steps]]\nkind = \"stop\"\nservice = \"svc\"\n",
    );

    let out = proctor(
        dir.path(),
        &["validate", good.to_str().unwrap(), bad.to_str().unwrap()],
    );
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert_eq!(out.status.code(), Some(1));
    assert!(stdout.contains("OK    "));
    assert!(stdout.contains("never started"));
}

#[test]
fn test_config_shows_env_override() {
    let dir = TempDir::new().unwrap();
    let out = Command::new(env!("CARGO_BIN_EXE_proctor"))
        .arg("config")
        .env("PROCTOR_SETTLE_DELAY", "5s")
        .env_remove("PROCTOR_CONFIG")
        .current_dir(dir.path())
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success());
    assert!(stdout.contains("settle_delay = \"5s\""));
}

#[test]
fn test_report_file_has_one_line_per_scenario() {
    let dir = TempDir::new().unwrap();
    let plan = write_plan(&dir, "fail.toml", FAILING);
    let report = dir.path().join("report.jsonl");

    let out = proctor(
        dir.path(),
        &[
            "run",
            "--keep-going",
            "--report",
            report.to_str().unwrap(),
            plan.to_str().unwrap(),
        ],
    );
    assert_eq!(out.status.code(), Some(1));

    let content = std::fs::read_to_string(&report).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"scenario\":\"wrong exit\""));
    assert!(lines[0].contains("\"passed\":false"));
    assert!(lines[1].contains("\"scenario\":\"never reached\""));
}
