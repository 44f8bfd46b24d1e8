//! Error taxonomy shared by every harness step.
//!
//! Each concern owns its error type next to the code that raises it; this
//! module unifies them so scenario steps can propagate with `?`.

use crate::completion::CompletionError;
use crate::config::ConfigError;
use crate::expect::ExpectationFailure;
use crate::launch::LaunchError;

/// Error type for harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error("Expectation failed: {0}")]
    Expectation(#[from] ExpectationFailure),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("No captured output yet: run a process to completion before checking '{0}'")]
    NoOutput(String),
}

impl HarnessError {
    /// True when the error is a failed assertion rather than a broken step.
    pub fn is_expectation_failure(&self) -> bool {
        matches!(self, Self::Expectation(_))
    }
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;
