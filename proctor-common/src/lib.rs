//! Process lifecycle and output verification for black-box acceptance tests.
//!
//! A scenario launches the tool under test with a derived environment,
//! waits for it according to a [`CompletionPolicy`], captures its combined
//! stdout and stderr as ordered lines, checks [`Expectation`]s against them,
//! and terminates whatever it started through a [`CleanupRegistry`].

pub mod cleanup;
pub mod collect;
pub mod completion;
pub mod config;
pub mod contracts;
pub mod env_overlay;
pub mod error;
pub mod expect;
pub mod launch;
pub mod logging;
pub mod plan;
pub mod scenario;

pub use cleanup::{CleanupFailure, CleanupRegistry, CleanupReport};
pub use collect::{CapturedOutput, NoiseFilter, collect, collect_within};
pub use completion::{Completion, CompletionError, CompletionPolicy, ReadinessProbe};
pub use config::{ConfigError, HarnessConfig};
pub use env_overlay::{EnvMap, EnvironmentBuilder};
pub use error::{HarnessError, HarnessResult};
pub use expect::{ExitCodes, Expectation, ExpectationFailure, check, check_exit_code};
pub use launch::{LaunchError, LaunchSpec, OutputSink, ProcessHandle, launch};
pub use plan::{PlanError, PlanFile, ScenarioPlan, Step};
pub use scenario::{ScenarioContext, ScenarioReport, StepRecord};
