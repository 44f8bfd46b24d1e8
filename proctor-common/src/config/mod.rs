//! Harness configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `PROCTOR_*` environment variables.

pub mod env;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collect::NoiseFilter;
use crate::completion::DEFAULT_SETTLE_DELAY;

pub use env::{ConfigSource, EnvError, EnvParser, Sourced};

/// Line printed by Go binaries built with coverage instrumentation.
pub const GOCOVERDIR_NOISE: &str = r"^warning: GOCOVERDIR not set, no coverage data emitted$";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid environment: {}", join_errors(.0))]
    Env(Vec<EnvError>),

    #[error("Invalid noise pattern: {0}")]
    NoisePattern(#[from] regex::Error),
}

fn join_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration for the test harness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Base directory for per-scenario service logs
    pub log_dir: PathBuf,
    /// Delay applied after starting a long-running service
    #[serde(with = "duration_serde")]
    pub settle_delay: Duration,
    /// Upper bound for run-to-completion steps; `None` waits forever
    #[serde(with = "duration_serde::option")]
    pub exit_timeout: Option<Duration>,
    /// Regexes for lines dropped from captured output before checks
    pub noise_patterns: Vec<String>,
    /// Whether service log files survive a passing scenario
    pub keep_logs: bool,
    /// Log level for the harness's own tracing output
    pub log_level: String,
    /// Cleaner executable
    pub cleaner_binary: PathBuf,
    /// Program used to serve the data-engineering app
    pub service_program: PathBuf,
    /// ASGI application path handed to the service program
    pub service_app: String,
    /// Logging configuration passed to the service
    pub service_log_config: PathBuf,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            settle_delay: DEFAULT_SETTLE_DELAY,
            exit_timeout: Some(Duration::from_secs(60)),
            noise_patterns: vec![GOCOVERDIR_NOISE.to_string()],
            keep_logs: true,
            log_level: "info".to_string(),
            cleaner_binary: PathBuf::from("insights-results-aggregator-cleaner"),
            service_program: PathBuf::from("uvicorn"),
            service_app: "ccx_upgrades_data_eng.main:app".to_string(),
            service_log_config: PathBuf::from("config/ccx-upgrades-data-eng_logging.yaml"),
        }
    }
}

impl HarnessConfig {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Load a TOML config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Defaults, then `path` if given, then the process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        base.with_env(&mut EnvParser::new())
    }

    /// Apply `PROCTOR_*` overrides, reporting every invalid variable at once.
    pub fn with_env(mut self, parser: &mut EnvParser) -> Result<Self, ConfigError> {
        self.log_dir = parser.get_path("LOG_DIR", self.log_dir).value;
        self.settle_delay = parser.get_duration("SETTLE_DELAY", self.settle_delay).value;
        self.exit_timeout = parser
            .get_optional_duration("EXIT_TIMEOUT", self.exit_timeout)
            .value;
        self.keep_logs = parser.get_bool("KEEP_LOGS", self.keep_logs).value;
        self.log_level = parser.get_log_level("LOG_LEVEL", &self.log_level).value;
        self.cleaner_binary = parser
            .get_path("CLEANER_BINARY", self.cleaner_binary)
            .value;
        self.service_program = parser
            .get_path("SERVICE_PROGRAM", self.service_program)
            .value;

        let errors = parser.take_errors();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Env(errors))
        }
    }

    /// Compile `noise_patterns`.
    pub fn noise_filter(&self) -> Result<NoiseFilter, ConfigError> {
        Ok(NoiseFilter::from_patterns(&self.noise_patterns)?)
    }

    /// Apply overrides from an explicit map (used by tests and embedding runners).
    pub fn with_env_vars(self, vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        self.with_env(&mut EnvParser::with_vars(vars))
    }
}

/// Serde adapter storing durations as humantime strings ("2s", "1m").
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_str("none"),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            let raw = String::deserialize(deserializer)?;
            if raw.eq_ignore_ascii_case("none") {
                return Ok(None);
            }
            humantime::parse_duration(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
    }
}
