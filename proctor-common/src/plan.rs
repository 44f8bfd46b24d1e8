//! TOML scenario plans executed by the `proctor` binary.
//!
//! ```toml
//! [[scenarios]]
//! name = "Cleaner prints its version"
//!
//! [[scenarios.steps]]
//! kind = "run"
//! args = ["--version"]
//! exit_codes = [0, 2]
//!
//! [[scenarios.steps]]
//! kind = "expect"
//! expectation = { kind = "contains_line", needle = "version 1.0" }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::completion::{CompletionPolicy, ReadinessProbe};
use crate::config::HarnessConfig;
use crate::env_overlay::EnvironmentBuilder;
use crate::error::HarnessResult;
use crate::expect::{Expectation, ExitCodes};
use crate::launch::LaunchSpec;
use crate::scenario::{ScenarioContext, ScenarioReport};

/// Errors raised while loading or validating a plan file.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Failed to read plan {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse plan {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Plan {} contains no scenarios", .0.display())]
    Empty(PathBuf),

    #[error("Scenario '{scenario}' step {step}: invalid duration '{value}'")]
    InvalidDuration {
        scenario: String,
        step: usize,
        value: String,
    },

    #[error("Scenario '{scenario}' step {step}: service '{service}' is never started")]
    UnknownService {
        scenario: String,
        step: usize,
        service: String,
    },
}

/// A plan file: one or more scenarios run in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub scenarios: Vec<ScenarioPlan>,
}

/// One scenario: a name and its ordered steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioPlan {
    pub name: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    /// Run a program to completion and keep its output. `program` defaults
    /// to the configured cleaner binary.
    Run {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<PathBuf>,
        #[serde(default)]
        args: Vec<String>,
        /// Overrides on top of the harness environment.
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        exit_codes: ExitCodes,
    },
    /// Start a long-running service. `program` defaults to the configured
    /// service program.
    Start {
        service: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        program: Option<PathBuf>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        ready: Readiness,
    },
    /// Terminate a started service.
    Stop { service: String },
    /// Check the last output, or a service log when `service` is set.
    Expect {
        expectation: Expectation,
        #[serde(default)]
        service: Option<String>,
    },
    /// Check the last run's exit code.
    ExpectExit { exit_codes: ExitCodes },
}

/// How a started service is judged ready. Durations are humantime strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Readiness {
    /// Sleep for the configured settle delay.
    #[default]
    Settle,
    /// Settle, then require the service to still be running.
    SettleAlive,
    Delay {
        delay: String,
        #[serde(default)]
        require_alive: bool,
    },
    Port {
        port: u16,
        #[serde(default = "default_ready_timeout")]
        timeout: String,
    },
    File {
        path: PathBuf,
        #[serde(default = "default_ready_timeout")]
        timeout: String,
    },
}

fn default_ready_timeout() -> String {
    "30s".to_string()
}

impl Readiness {
    fn durations(&self) -> Vec<&str> {
        match self {
            Self::Settle | Self::SettleAlive => Vec::new(),
            Self::Delay { delay, .. } => vec![delay.as_str()],
            Self::Port { timeout, .. } | Self::File { timeout, .. } => vec![timeout.as_str()],
        }
    }

    /// Resolve into a completion policy. Durations must already be valid.
    fn policy(&self, config: &HarnessConfig) -> CompletionPolicy {
        let parse = |raw: &str| humantime::parse_duration(raw).unwrap_or(config.settle_delay);
        match self {
            Self::Settle => CompletionPolicy::settle(config.settle_delay),
            Self::SettleAlive => CompletionPolicy::settle_alive(config.settle_delay),
            Self::Delay {
                delay,
                require_alive,
            } => CompletionPolicy::SettleDelay {
                delay: parse(delay),
                require_alive: *require_alive,
            },
            Self::Port { port, timeout } => {
                CompletionPolicy::poll(ReadinessProbe::localhost(*port), parse(timeout))
            }
            Self::File { path, timeout } => {
                CompletionPolicy::poll(ReadinessProbe::FileExists(path.clone()), parse(timeout))
            }
        }
    }
}

impl PlanFile {
    pub fn from_toml_str(content: &str, origin: &Path) -> Result<Self, PlanError> {
        let plan: Self = toml::from_str(content).map_err(|source| PlanError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        if plan.scenarios.is_empty() {
            return Err(PlanError::Empty(origin.to_path_buf()));
        }
        Ok(plan)
    }

    /// Read, parse and validate a plan file.
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let plan = Self::from_toml_str(&content, path)?;
        plan.validate()?;
        debug!(path = %path.display(), scenarios = plan.scenarios.len(), "Loaded plan");
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        self.scenarios.iter().try_for_each(ScenarioPlan::validate)
    }
}

impl ScenarioPlan {
    /// Reject unparseable durations and references to services no earlier
    /// step starts.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut started = BTreeSet::new();
        for (index, step) in self.steps.iter().enumerate() {
            let step_no = index + 1;
            let referenced = match step {
                Step::Start { service, ready, .. } => {
                    for raw in ready.durations() {
                        if humantime::parse_duration(raw).is_err() {
                            return Err(PlanError::InvalidDuration {
                                scenario: self.name.clone(),
                                step: step_no,
                                value: raw.to_string(),
                            });
                        }
                    }
                    started.insert(service.as_str());
                    None
                }
                Step::Stop { service } => Some(service),
                Step::Expect {
                    service: Some(service),
                    ..
                } => Some(service),
                _ => None,
            };
            if let Some(service) = referenced
                && !started.contains(service.as_str())
            {
                return Err(PlanError::UnknownService {
                    scenario: self.name.clone(),
                    step: step_no,
                    service: service.clone(),
                });
            }
        }
        Ok(())
    }

    /// Execute every step in order, stopping at the first failure.
    ///
    /// Step failures are recorded in the report; only a context that cannot
    /// be created is returned as an error.
    pub fn execute(&self, config: &HarnessConfig) -> HarnessResult<ScenarioReport> {
        let mut ctx = ScenarioContext::new(&self.name, config)?;
        for (index, step) in self.steps.iter().enumerate() {
            if let Err(e) = run_step(&mut ctx, step, config) {
                info!(
                    scenario = %self.name,
                    step = index + 1,
                    "Stopping scenario after failed step: {e}"
                );
                break;
            }
        }
        Ok(ctx.finish())
    }
}

fn launch_spec(program: &Path, args: &[String], env: &BTreeMap<String, String>) -> LaunchSpec {
    let spec = LaunchSpec::new(program).args(args);
    if env.is_empty() {
        spec
    } else {
        let env = EnvironmentBuilder::from_current()
            .with_overrides(env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .build();
        spec.env(env)
    }
}

fn run_step(ctx: &mut ScenarioContext, step: &Step, config: &HarnessConfig) -> HarnessResult<()> {
    match step {
        Step::Run {
            program,
            args,
            env,
            exit_codes,
        } => {
            let program = program.as_deref().unwrap_or(config.cleaner_binary.as_path());
            ctx.run_to_completion(launch_spec(program, args, env), exit_codes)
                .map(|_| ())
        }
        Step::Start {
            service,
            program,
            args,
            env,
            ready,
        } => {
            let program = program.as_deref().unwrap_or(config.service_program.as_path());
            ctx.start_service(service, launch_spec(program, args, env), &ready.policy(config))
                .map(|_| ())
        }
        Step::Stop { service } => ctx.terminate_service(service),
        Step::Expect {
            expectation,
            service: None,
        } => ctx.expect(expectation),
        Step::Expect {
            expectation,
            service: Some(service),
        } => ctx.expect_service_log(service, expectation),
        Step::ExpectExit { exit_codes } => ctx.expect_exit_code(exit_codes),
    }
}
