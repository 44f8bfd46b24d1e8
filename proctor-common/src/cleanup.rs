//! Per-scenario termination actions that run exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::launch::ProcessHandle;

/// Process handle shared between a scenario and its cleanup entry.
pub type SharedHandle = Arc<Mutex<ProcessHandle>>;

/// Lock a shared handle, recovering from a poisoned lock.
pub fn lock_handle(handle: &SharedHandle) -> MutexGuard<'_, ProcessHandle> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

type CleanupAction = Box<dyn FnOnce() -> Result<(), String> + Send>;

struct CleanupEntry {
    label: String,
    action: CleanupAction,
}

/// One cleanup action that failed. Logged, never the scenario's failure reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupFailure {
    pub label: String,
    pub reason: String,
}

impl std::fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cleanup '{}' failed: {}", self.label, self.reason)
    }
}

/// Outcome of draining a registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub executed: usize,
    pub failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ordered termination actions owned by one scenario.
///
/// Dropping the registry runs whatever is still pending.
#[derive(Default)]
pub struct CleanupRegistry {
    entries: Vec<CleanupEntry>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a zero-argument termination action.
    pub fn register<F>(&mut self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Result<(), String> + Send + 'static,
    {
        let label = label.into();
        debug!(label = %label, "Registered cleanup");
        self.entries.push(CleanupEntry {
            label,
            action: Box::new(action),
        });
    }

    /// Take ownership of a process handle and terminate it at cleanup time.
    pub fn register_process(&mut self, handle: ProcessHandle) -> SharedHandle {
        let shared = Arc::new(Mutex::new(handle));
        self.register_shared(Arc::clone(&shared));
        shared
    }

    /// Terminate a shared handle at cleanup time. Termination is idempotent,
    /// so earlier explicit terminations through other clones are harmless.
    pub fn register_shared(&mut self, handle: SharedHandle) {
        let label = {
            let guard = lock_handle(&handle);
            format!("terminate {} (pid={})", guard.name(), guard.pid())
        };
        self.register(label, move || {
            lock_handle(&handle).terminate().map_err(|e| e.to_string())
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke every pending action once, in registration order.
    ///
    /// A failing or panicking action is logged and does not stop the rest.
    /// Calling this again only runs actions registered since.
    pub fn run_all(&mut self) -> CleanupReport {
        let mut report = CleanupReport::default();
        if self.entries.is_empty() {
            return report;
        }
        info!(pending = self.entries.len(), "Starting cleanup");

        for entry in self.entries.drain(..) {
            report.executed += 1;
            let action = entry.action;
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(action))
                .unwrap_or_else(|_| Err("cleanup action panicked".to_string()));
            match outcome {
                Ok(()) => debug!(label = %entry.label, "Cleanup done"),
                Err(reason) => {
                    warn!(label = %entry.label, "Cleanup failed: {reason}");
                    report.failures.push(CleanupFailure {
                        label: entry.label,
                        reason,
                    });
                }
            }
        }
        report
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = self.entries.iter().map(|e| e.label.as_str()).collect();
        f.debug_struct("CleanupRegistry")
            .field("pending", &labels)
            .finish()
    }
}

impl Drop for CleanupRegistry {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            self.run_all();
        }
    }
}
