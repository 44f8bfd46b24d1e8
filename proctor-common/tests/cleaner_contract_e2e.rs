//! Cleaner contract E2E scenarios against a scripted stand-in binary.
//!
//! The stand-in mimics the cleaner's observable behavior: Go-style help on
//! stderr with exit code 2, version and author lines, structured
//! configuration logs, and an `--output` listing file.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use proctor_common::contracts::{
    CLEANER_HELP, CleanerCommand, DATA_ENG_SERVICE, DataEngService, cleaner_authors,
    cleaner_configuration, cleaner_help, cleaner_version, vacuum_progress,
};
use proctor_common::logging::init_test_logging;
use proctor_common::{Expectation, HarnessConfig, HarnessError, ScenarioContext};
use tempfile::TempDir;

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn mock_cleaner(dir: &Path) -> PathBuf {
    let help = CLEANER_HELP.replace("        ", "    \t");
    let body = format!(
        r#"
case "$1" in
  --help|-help|-h)
    cat >&2 <<'HELP'
{help}
HELP
    exit 2 ;;
  --version|-version)
    echo "Insights Results Aggregator Cleaner version 1.0" ;;
  --authors|-authors)
    echo "Pavel Tisnovsky, Red Hat Inc." ;;
  --show-configuration|-show-configuration)
    for m in "DB connection configuration" "Storage configuration" "Logging configuration" "Cleaner configuration"; do
      echo "{{\"level\":\"info\",\"message\":\"$m\"}}" >&2
    done ;;
  -vacuum)
    echo '{{"level":"info","driverName":"postgres","message":"DB connection configuration"}}'
    echo '{{"level":"info","message":"Vacuuming started"}}'
    echo '{{"level":"info","message":"Vacuuming finished"}}' ;;
  --output)
    : > "$2"
    if [ -n "$CLEANER_RECORDS" ]; then printf '%b' "$CLEANER_RECORDS" > "$2"; fi ;;
  --cleanup)
    echo "deleting $3" ;;
  *)
    echo "flag provided but not defined: $1" >&2
    exit 2 ;;
esac
"#
    );
    write_script(dir, "cleaner", &body)
}

fn context(dir: &TempDir, name: &str) -> (ScenarioContext, CleanerCommand) {
    init_test_logging();
    let config = HarnessConfig {
        log_dir: dir.path().join("logs"),
        cleaner_binary: mock_cleaner(dir.path()),
        ..HarnessConfig::default()
    };
    let cleaner = CleanerCommand::from_config(&config);
    (ScenarioContext::new(name, &config).unwrap(), cleaner)
}

#[test]
fn test_help_is_exact() {
    let dir = TempDir::new().unwrap();
    let (mut ctx, cleaner) = context(&dir, "help");
    let (spec, codes) = cleaner.flag("--help");
    ctx.run_to_completion(spec, &codes).unwrap();
    assert_eq!(ctx.last_exit_code(), Some(2));
    ctx.expect(&cleaner_help()).unwrap();
    assert!(ctx.finish().passed());
}

#[test]
fn test_version_and_authors() {
    let dir = TempDir::new().unwrap();
    let (mut ctx, cleaner) = context(&dir, "version");

    let (spec, codes) = cleaner.flag("--version");
    ctx.run_to_completion(spec, &codes).unwrap();
    ctx.expect(&cleaner_version()).unwrap();
    assert!(ctx.expect(&cleaner_authors()).is_err());

    let (spec, codes) = cleaner.flag("--authors");
    ctx.run_to_completion(spec, &codes).unwrap();
    ctx.expect(&cleaner_authors()).unwrap();
}

#[test]
fn test_configuration_messages() {
    let dir = TempDir::new().unwrap();
    let (mut ctx, cleaner) = context(&dir, "configuration");
    let (spec, codes) = cleaner.flag("--show-configuration");
    ctx.run_to_completion(spec, &codes).unwrap();
    ctx.expect(&cleaner_configuration()).unwrap();
}

#[test]
fn test_vacuum() {
    let dir = TempDir::new().unwrap();
    let (mut ctx, cleaner) = context(&dir, "vacuum");
    let (spec, codes) = cleaner.vacuum();
    ctx.run_to_completion(spec, &codes).unwrap();
    ctx.expect(&vacuum_progress()).unwrap();
}

#[test]
fn test_unknown_flag_fails_strict_run() {
    let dir = TempDir::new().unwrap();
    let (mut ctx, cleaner) = context(&dir, "unknown flag");
    let (spec, _) = cleaner.flag("--bogus");
    let err = ctx
        .run_to_completion(spec, &proctor_common::ExitCodes::success())
        .unwrap_err();
    assert!(err.is_expectation_failure());
    ctx.expect(&Expectation::contains_line("flag provided but not defined"))
        .unwrap();
}

#[test]
fn test_empty_listing() {
    let dir = TempDir::new().unwrap();
    let (mut ctx, cleaner) = context(&dir, "empty listing");
    let listing = dir.path().join("test");
    let (spec, codes) = cleaner.list_older_than(&listing, "90 days");
    ctx.run_to_completion(spec, &codes).unwrap();
    ctx.expect(&Expectation::empty_artifact(&listing)).unwrap();
}

#[test]
fn test_listing_record_set() {
    let dir = TempDir::new().unwrap();
    let (mut ctx, cleaner) = context(&dir, "listing");
    let listing = dir.path().join("test");

    let env = proctor_common::EnvironmentBuilder::from_current()
        .with_override(
            "CLEANER_RECORDS",
            "c1,2021-01-01\\nc2,2021-01-02\\nc1,2021-02-01\\n",
        )
        .build();
    let (spec, codes) = cleaner.list_older_than(&listing, "90 days");
    ctx.run_to_completion(spec.env(env), &codes).unwrap();

    ctx.expect(&Expectation::record_set(&listing, ["c1", "c2"]))
        .unwrap();
    let err = ctx
        .expect(&Expectation::record_set(&listing, ["c1", "c3"]))
        .unwrap_err();
    let HarnessError::Expectation(failure) = err else {
        panic!("expected an expectation failure, got {err:?}");
    };
    let rendered = failure.to_string();
    assert!(rendered.contains("c2"));
    assert!(rendered.contains("c3"));
}

#[test]
fn test_cleanup_clusters_command() {
    let dir = TempDir::new().unwrap();
    let (mut ctx, cleaner) = context(&dir, "cleanup");
    let (spec, codes) = cleaner.cleanup_clusters(["c1", "c2"]);
    ctx.run_to_completion(spec, &codes).unwrap();
    ctx.expect(&Expectation::exact("deleting c1,c2")).unwrap();
}

#[test]
fn test_data_eng_service_start() {
    init_test_logging();
    let dir = TempDir::new().unwrap();
    let runner = write_script(
        dir.path(),
        "uvicorn",
        "echo \"serving $1 on port $3 with $5\"\necho \"endpoint=$INFERENCE_ENDPOINT\" >&2\nexec sleep 30\n",
    );
    let config = HarnessConfig {
        log_dir: dir.path().join("logs"),
        settle_delay: Duration::from_millis(300),
        service_program: runner,
        ..HarnessConfig::default()
    };
    let mut ctx = ScenarioContext::new("Data eng running", &config).unwrap();

    let log = DataEngService::from_config(&config, 8000)
        .with_env("INFERENCE_ENDPOINT", "http://localhost:9000")
        .start(&mut ctx)
        .unwrap();
    assert!(log.ends_with("ccx-upgrades-data-eng/Data_eng_running.log"));
    assert!(ctx.service_running(DATA_ENG_SERVICE).unwrap());

    ctx.expect_service_log(
        DATA_ENG_SERVICE,
        &Expectation::line_at(0, "serving ccx_upgrades_data_eng.main:app on port 8000"),
    )
    .unwrap();
    ctx.expect_service_log(
        DATA_ENG_SERVICE,
        &Expectation::contains_line("endpoint=http://localhost:9000"),
    )
    .unwrap();

    let report = ctx.finish();
    assert!(report.passed());
    assert!(report.cleanup.is_clean());
}
