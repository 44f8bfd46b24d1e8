//! Per-scenario state threaded through every step.
//!
//! A [`ScenarioContext`] owns everything one scenario accumulates: the last
//! captured output and exit code, long-running services addressable by
//! name, the log files they write, and the cleanup registry that tears it
//! all down. Nothing is shared between scenarios.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupRegistry, CleanupReport, SharedHandle, lock_handle};
use crate::collect::{CapturedOutput, NoiseFilter, collect, collect_within};
use crate::completion::{Completion, CompletionPolicy};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::expect::{Expectation, ExitCodes, check, check_exit_code};
use crate::launch::{LaunchSpec, OutputSink, launch};

/// Least time given to drain a pipe after exit, even when the exit
/// timeout is nearly spent.
const MIN_DRAIN: Duration = Duration::from_millis(250);

/// Outcome of a single scenario step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub description: String,
    pub passed: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Summary returned by [`ScenarioContext::finish`].
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub cleanup: CleanupReport,
}

impl ScenarioReport {
    /// Cleanup failures are logged but never fail a scenario.
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.passed)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|s| !s.passed)
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

struct Service {
    handle: SharedHandle,
    log_path: PathBuf,
}

/// Explicit state for one running scenario.
pub struct ScenarioContext {
    name: String,
    config: HarnessConfig,
    noise: NoiseFilter,
    started_at: DateTime<Utc>,
    cleanup: CleanupRegistry,
    services: HashMap<String, Service>,
    last_output: Option<CapturedOutput>,
    last_exit_code: Option<i32>,
    steps: Vec<StepRecord>,
}

impl ScenarioContext {
    pub fn new(name: impl Into<String>, config: &HarnessConfig) -> HarnessResult<Self> {
        let name = name.into();
        let noise = config.noise_filter()?;
        info!(scenario = %name, "Starting scenario");
        Ok(Self {
            name,
            config: config.clone(),
            noise,
            started_at: Utc::now(),
            cleanup: CleanupRegistry::new(),
            services: HashMap::new(),
            last_output: None,
            last_exit_code: None,
            steps: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Output of the most recent run-to-completion step, noise removed.
    pub fn last_output(&self) -> Option<&CapturedOutput> {
        self.last_output.as_ref()
    }

    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Where `service` writes its combined output for this scenario:
    /// `<log_dir>/<service>/<scenario>.log`.
    pub fn service_log_path(&self, service: &str) -> PathBuf {
        self.config
            .log_dir
            .join(sanitize_component(service))
            .join(format!("{}.log", sanitize_component(&self.name)))
    }

    /// Launch `spec` with a pipe sink, wait for it to exit, and keep its
    /// output for later expectations.
    ///
    /// The output is stored before the exit code is checked, so a rejected
    /// exit code still leaves the output available for diagnosis.
    pub fn run_to_completion(
        &mut self,
        spec: LaunchSpec,
        accepted: &ExitCodes,
    ) -> HarnessResult<&CapturedOutput> {
        let description = format!("run {}", spec.command_line());
        let started = Instant::now();
        let result = self.run_inner(spec, accepted);
        self.record(description, started, &result);
        result?;
        self.last_output
            .as_ref()
            .ok_or_else(|| HarnessError::NoOutput("run".to_string()))
    }

    fn run_inner(&mut self, spec: LaunchSpec, accepted: &ExitCodes) -> HarnessResult<()> {
        self.last_output = None;
        self.last_exit_code = None;

        let spec = spec.sink(OutputSink::Pipe);
        let started = Instant::now();
        let handle = self.cleanup.register_process(launch(&spec)?);
        let mut guard = lock_handle(&handle);

        let policy = CompletionPolicy::wait_for_exit(self.config.exit_timeout);
        let completion = policy.apply(&mut guard)?;
        let drain = self
            .config
            .exit_timeout
            .map(|limit| limit.saturating_sub(started.elapsed()).max(MIN_DRAIN));
        let output = collect_within(&mut guard, drain)?.without_noise(&self.noise);
        let code = match completion {
            Completion::Exited { code } => code,
            _ => guard.exit_code(),
        };
        drop(guard);

        debug!(
            scenario = %self.name,
            exit_code = ?code,
            lines = output.len(),
            "Process completed"
        );
        self.last_output = Some(output);
        self.last_exit_code = code;
        check_exit_code(code, accepted)?;
        Ok(())
    }

    /// Launch a long-running service whose output goes to its scenario log
    /// file, then block until `policy` is satisfied.
    ///
    /// The service is registered for cleanup before the policy runs, so it
    /// is terminated even when it never becomes ready.
    pub fn start_service(
        &mut self,
        service: &str,
        spec: LaunchSpec,
        policy: &CompletionPolicy,
    ) -> HarnessResult<PathBuf> {
        let description = format!("start service {service}");
        let started = Instant::now();
        let result = self.start_inner(service, spec, policy);
        self.record(description, started, &result);
        result
    }

    fn start_inner(
        &mut self,
        service: &str,
        spec: LaunchSpec,
        policy: &CompletionPolicy,
    ) -> HarnessResult<PathBuf> {
        if let Some(existing) = self.services.get(service)
            && lock_handle(&existing.handle).is_running()
        {
            info!(scenario = %self.name, service, "Service already running");
            return Ok(existing.log_path.clone());
        }

        let log_path = self.service_log_path(service);
        let spec = spec.name(service).sink(OutputSink::File(log_path.clone()));
        let handle = self.cleanup.register_process(launch(&spec)?);
        self.services.insert(
            service.to_string(),
            Service {
                handle: Arc::clone(&handle),
                log_path: log_path.clone(),
            },
        );

        let completion = policy.apply(&mut lock_handle(&handle))?;
        info!(
            scenario = %self.name,
            service,
            log = %log_path.display(),
            ?completion,
            "Service started"
        );
        Ok(log_path)
    }

    fn service(&self, service: &str) -> HarnessResult<&Service> {
        self.services
            .get(service)
            .ok_or_else(|| HarnessError::ServiceNotFound(service.to_string()))
    }

    /// Whether a started service is still alive.
    pub fn service_running(&self, service: &str) -> HarnessResult<bool> {
        Ok(lock_handle(&self.service(service)?.handle).is_running())
    }

    /// Stop a service now instead of at cleanup. Stopping twice is harmless.
    pub fn terminate_service(&mut self, service: &str) -> HarnessResult<()> {
        let description = format!("stop service {service}");
        let started = Instant::now();
        let result = self
            .service(service)
            .and_then(|s| Ok(lock_handle(&s.handle).terminate()?));
        self.record(description, started, &result);
        result
    }

    /// Everything a service has written to its log file so far.
    pub fn service_log(&self, service: &str) -> HarnessResult<CapturedOutput> {
        let output = collect(&mut lock_handle(&self.service(service)?.handle))?;
        Ok(output.without_noise(&self.noise))
    }

    /// Check an expectation against the last run's output. Artifact
    /// expectations read their file and need no prior run.
    pub fn expect(&mut self, expectation: &Expectation) -> HarnessResult<()> {
        let description = format!("expect {expectation}");
        let started = Instant::now();
        let result = self.expect_inner(expectation);
        self.record(description, started, &result);
        result
    }

    fn expect_inner(&self, expectation: &Expectation) -> HarnessResult<()> {
        if expectation.reads_artifact() {
            return Ok(check(expectation, &CapturedOutput::default())?);
        }
        let output = self
            .last_output
            .as_ref()
            .ok_or_else(|| HarnessError::NoOutput(expectation.to_string()))?;
        Ok(check(expectation, output)?)
    }

    /// Check an expectation against a service's log file.
    pub fn expect_service_log(
        &mut self,
        service: &str,
        expectation: &Expectation,
    ) -> HarnessResult<()> {
        let description = format!("expect {expectation} in {service} log");
        let started = Instant::now();
        let result = self
            .service_log(service)
            .and_then(|output| Ok(check(expectation, &output)?));
        self.record(description, started, &result);
        result
    }

    /// Check the last run's exit code.
    pub fn expect_exit_code(&mut self, accepted: &ExitCodes) -> HarnessResult<()> {
        let description = format!("expect exit code in {accepted}");
        let started = Instant::now();
        let result = match &self.last_output {
            Some(_) => check_exit_code(self.last_exit_code, accepted).map_err(HarnessError::from),
            None => Err(HarnessError::NoOutput("exit code".to_string())),
        };
        self.record(description, started, &result);
        result
    }

    /// Register an extra termination action, e.g. removing a generated file.
    pub fn register_cleanup<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        self.cleanup.register(label, action);
    }

    /// Run cleanup and summarize the scenario.
    ///
    /// Service logs are removed only when the scenario passed and
    /// `keep_logs` is off.
    pub fn finish(mut self) -> ScenarioReport {
        let cleanup = self.cleanup.run_all();
        let report = ScenarioReport {
            scenario: std::mem::take(&mut self.name),
            started_at: self.started_at,
            finished_at: Utc::now(),
            steps: std::mem::take(&mut self.steps),
            cleanup,
        };

        if report.passed() && !self.config.keep_logs {
            for service in self.services.values() {
                remove_log(&service.log_path);
            }
        }

        if report.passed() {
            info!(scenario = %report.scenario, steps = report.steps.len(), "Scenario passed");
        } else {
            error!(
                scenario = %report.scenario,
                failed = report.failed_steps().count(),
                "Scenario failed"
            );
        }
        report
    }

    fn record<T>(&mut self, description: String, started: Instant, result: &HarnessResult<T>) {
        let duration = started.elapsed();
        let error = match result {
            Ok(_) => {
                debug!(scenario = %self.name, step = %description, ?duration, "Step passed");
                None
            }
            Err(e) => {
                warn!(scenario = %self.name, step = %description, "Step failed: {e}");
                Some(e.to_string())
            }
        };
        self.steps.push(StepRecord {
            description,
            passed: error.is_none(),
            error,
            duration,
        });
    }
}

impl std::fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<&str> = self.services.keys().map(String::as_str).collect();
        services.sort_unstable();
        f.debug_struct("ScenarioContext")
            .field("name", &self.name)
            .field("services", &services)
            .field("cleanup", &self.cleanup)
            .field("last_exit_code", &self.last_exit_code)
            .finish()
    }
}

fn remove_log(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed service log"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove service log: {e}"),
    }
}

/// Make a scenario or service name safe to use as a path component.
fn sanitize_component(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "scenario".to_string()
    } else {
        sanitized
    }
}
