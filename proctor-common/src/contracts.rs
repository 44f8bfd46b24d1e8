//! Command lines and canned expectations for the tools under test.
//!
//! The harness knows nothing about these tools beyond how they are invoked
//! and what they print; their behavior is their own business.

use std::path::{Path, PathBuf};

use crate::completion::CompletionPolicy;
use crate::config::HarnessConfig;
use crate::env_overlay::EnvironmentBuilder;
use crate::error::HarnessResult;
use crate::expect::{Expectation, ExitCodes};
use crate::launch::LaunchSpec;
use crate::scenario::ScenarioContext;

/// Exact help text of the cleaner, as printed by `--help`.
pub const CLEANER_HELP: &str = "Clowder is not enabled, skipping init...
Usage of insights-results-aggregator-cleaner:
  -authors
        show authors
  -cleanup
        perform database cleanup
  -clusters string
        list of clusters to cleanup
  -fill-in-db
        fill-in database by test data
  -max-age string
        max age for displaying old records
  -multiple-rule-disable
        list clusters with the same rule(s) disabled by different users
  -output string
        filename for old cluster listing
  -show-configuration
        show configuration
  -summary
        print summary table after cleanup
  -vacuum
        vacuum database
  -version
        show cleaner version";

pub const CLEANER_VERSION: &str = "Insights Results Aggregator Cleaner version 1.0";
pub const CLEANER_AUTHORS: &str = "Pavel Tisnovsky, Red Hat Inc.";

/// Service name used for the data-engineering service's log partition.
pub const DATA_ENG_SERVICE: &str = "ccx-upgrades-data-eng";

/// Invocations of the aggregator cleaner.
#[derive(Debug, Clone)]
pub struct CleanerCommand {
    binary: PathBuf,
}

impl CleanerCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn from_config(config: &HarnessConfig) -> Self {
        Self::new(&config.cleaner_binary)
    }

    fn spec(&self) -> LaunchSpec {
        LaunchSpec::new(&self.binary).name("cleaner")
    }

    /// List records older than `age` into `output`. Must exit 0.
    pub fn list_older_than(&self, output: &Path, age: &str) -> (LaunchSpec, ExitCodes) {
        let spec = self
            .spec()
            .arg("--output")
            .arg(output)
            .args(["--max-age", age]);
        (spec, ExitCodes::success())
    }

    /// Delete the given clusters. Must exit 0.
    pub fn cleanup_clusters<I, S>(&self, clusters: I) -> (LaunchSpec, ExitCodes)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let list = clusters
            .into_iter()
            .map(|c| c.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let spec = self.spec().args(["--cleanup", "--clusters"]).arg(list);
        (spec, ExitCodes::success())
    }

    /// Vacuum the database. Must exit 0.
    pub fn vacuum(&self) -> (LaunchSpec, ExitCodes) {
        (self.spec().arg("-vacuum"), ExitCodes::success())
    }

    /// Run with a single flag such as `--help` or `--version`.
    ///
    /// Exit code 2 is accepted because Go's flag package uses it for help.
    pub fn flag(&self, flag: &str) -> (LaunchSpec, ExitCodes) {
        (self.spec().arg(flag), ExitCodes::success_or(2))
    }
}

/// The data-engineering HTTP service, served by an ASGI runner.
#[derive(Debug, Clone)]
pub struct DataEngService {
    program: PathBuf,
    app: String,
    log_config: PathBuf,
    port: u16,
    overrides: Vec<(String, String)>,
}

impl DataEngService {
    pub fn from_config(config: &HarnessConfig, port: u16) -> Self {
        Self {
            program: config.service_program.clone(),
            app: config.service_app.clone(),
            log_config: config.service_log_config.clone(),
            port,
            overrides: Vec::new(),
        }
    }

    /// Environment override applied on top of the harness environment.
    /// Later rows win for repeated names.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((name.into(), value.into()));
        self
    }

    pub fn with_envs<I, K, V>(mut self, rows: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.overrides
            .extend(rows.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        let env = EnvironmentBuilder::from_current()
            .with_overrides(self.overrides.iter().cloned())
            .build();
        LaunchSpec::new(&self.program)
            .name(DATA_ENG_SERVICE)
            .arg(&self.app)
            .args(["--port".to_string(), self.port.to_string()])
            .arg("--log-config")
            .arg(&self.log_config)
            .env(env)
    }

    /// Start under the configured settle delay; log goes to
    /// `<log_dir>/ccx-upgrades-data-eng/<scenario>.log`.
    pub fn start(&self, ctx: &mut ScenarioContext) -> HarnessResult<PathBuf> {
        let policy = CompletionPolicy::settle(ctx.config().settle_delay);
        ctx.start_service(DATA_ENG_SERVICE, self.launch_spec(), &policy)
    }
}

pub fn cleaner_help() -> Expectation {
    Expectation::exact(CLEANER_HELP)
}

pub fn cleaner_version() -> Expectation {
    Expectation::contains_line(CLEANER_VERSION)
}

pub fn cleaner_authors() -> Expectation {
    Expectation::contains_line(CLEANER_AUTHORS)
}

/// Structured log messages printed by `--show-configuration`.
pub fn cleaner_configuration() -> Expectation {
    Expectation::messages([
        "DB connection configuration",
        "Storage configuration",
        "Logging configuration",
        "Cleaner configuration",
    ])
}

pub fn vacuum_progress() -> Expectation {
    Expectation::fragments([
        "DB connection configuration",
        "driverName",
        "postgres",
        "Vacuuming started",
        "Vacuuming finished",
    ])
}
