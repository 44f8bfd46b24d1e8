//! Environment variable parsing with type safety.
//!
//! Collects every parse error so all problems can be reported at once.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Invalid duration format.
    #[error("Invalid duration for {var}: {value}")]
    InvalidDuration { var: String, value: String },

    /// Invalid log level.
    #[error("Invalid log level for {var}: {value}")]
    InvalidLogLevel { var: String, value: String },
}

/// Where a configuration value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    Environment(String),
}

/// A value together with its source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sourced<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> Sourced<T> {
    fn from_env(value: T, var: String) -> Self {
        Self {
            value,
            source: ConfigSource::Environment(var),
        }
    }

    fn default_value(value: T) -> Self {
        Self {
            value,
            source: ConfigSource::Default,
        }
    }

    pub fn is_from_env(&self) -> bool {
        matches!(self.source, ConfigSource::Environment(_))
    }
}

/// Type-safe parser for `PROCTOR_*` variables.
pub struct EnvParser {
    prefix: &'static str,
    vars: Option<HashMap<String, String>>,
    errors: Vec<EnvError>,
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    /// Parser reading the process environment.
    pub fn new() -> Self {
        Self {
            prefix: "PROCTOR_",
            vars: None,
            errors: Vec::new(),
        }
    }

    /// Parser reading a fixed set of variables instead of the process
    /// environment.
    pub fn with_vars(vars: HashMap<String, String>) -> Self {
        Self {
            vars: Some(vars),
            ..Self::new()
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn lookup(&self, var_name: &str) -> Option<String> {
        match &self.vars {
            Some(vars) => vars.get(var_name).cloned(),
            None => std::env::var(var_name).ok(),
        }
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) => Sourced::from_env(value, var_name),
            None => Sourced::default_value(default.to_string()),
        }
    }

    /// Get a path value with default.
    pub fn get_path(&mut self, name: &str, default: PathBuf) -> Sourced<PathBuf> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) if !value.trim().is_empty() => {
                Sourced::from_env(PathBuf::from(value.trim()), var_name)
            }
            _ => Sourced::default_value(default),
        }
    }

    /// Get a boolean value with default.
    ///
    /// Accepts: 1, true, yes, on (for true)
    ///          0, false, no, off, "" (for false)
    pub fn get_bool(&mut self, name: &str, default: bool) -> Sourced<bool> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) => {
                let parsed = match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        self.errors.push(EnvError::InvalidValue {
                            var: var_name.clone(),
                            expected: "boolean (true/false/1/0/yes/no)".to_string(),
                            value: value.clone(),
                        });
                        default
                    }
                };
                Sourced::from_env(parsed, var_name)
            }
            None => Sourced::default_value(default),
        }
    }

    /// Get a duration in humantime format ("2s", "1m 30s").
    pub fn get_duration(&mut self, name: &str, default: Duration) -> Sourced<Duration> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) => match humantime::parse_duration(value.trim()) {
                Ok(d) => Sourced::from_env(d, var_name),
                Err(_) => {
                    self.errors.push(EnvError::InvalidDuration {
                        var: var_name.clone(),
                        value,
                    });
                    Sourced::default_value(default)
                }
            },
            None => Sourced::default_value(default),
        }
    }

    /// Get an optional duration; "none", "off" and "0" disable it.
    pub fn get_optional_duration(
        &mut self,
        name: &str,
        default: Option<Duration>,
    ) -> Sourced<Option<Duration>> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) => match value.trim().to_lowercase().as_str() {
                "none" | "off" | "0" => Sourced::from_env(None, var_name),
                trimmed => match humantime::parse_duration(trimmed) {
                    Ok(d) => Sourced::from_env(Some(d), var_name),
                    Err(_) => {
                        self.errors.push(EnvError::InvalidDuration {
                            var: var_name.clone(),
                            value,
                        });
                        Sourced::default_value(default)
                    }
                },
            },
            None => Sourced::default_value(default),
        }
    }

    /// Get a tracing log level (trace, debug, info, warn, error).
    pub fn get_log_level(&mut self, name: &str, default: &str) -> Sourced<String> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(value) => {
                let lower = value.to_lowercase();
                if matches!(
                    lower.as_str(),
                    "trace" | "debug" | "info" | "warn" | "error" | "off"
                ) {
                    Sourced::from_env(lower, var_name)
                } else {
                    self.errors.push(EnvError::InvalidLogLevel {
                        var: var_name.clone(),
                        value,
                    });
                    Sourced::default_value(default.to_string())
                }
            }
            None => Sourced::default_value(default.to_string()),
        }
    }
}
