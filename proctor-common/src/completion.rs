//! When a launched process is ready to assert on.

use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::launch::ProcessHandle;

/// Settle delay used for long-running services when nothing else is configured.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Error raised while waiting for a completion condition.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Process '{name}' timed out after {timeout:?} and was killed")]
    TimedOut { name: String, timeout: Duration },

    #[error("Process '{name}' exited early ({})", describe_code(.code))]
    ExitedEarly { name: String, code: Option<i32> },

    #[error("Process '{name}' not ready after {timeout:?}: {probe}")]
    NotReady {
        name: String,
        probe: ReadinessProbe,
        timeout: Duration,
    },

    #[error("IO error while waiting: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "killed by signal".to_string(),
    }
}

/// Readiness check used by [`CompletionPolicy::PollUntilReady`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessProbe {
    /// A TCP connect to `host:port` succeeds.
    TcpPort { host: String, port: u16 },
    /// The file exists.
    FileExists(PathBuf),
}

impl ReadinessProbe {
    pub fn localhost(port: u16) -> Self {
        Self::TcpPort {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    fn is_ready(&self) -> bool {
        match self {
            Self::TcpPort { host, port } => (host.as_str(), *port)
                .to_socket_addrs()
                .map(|mut addrs| {
                    addrs.any(|addr| {
                        TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
                    })
                })
                .unwrap_or(false),
            Self::FileExists(path) => path.exists(),
        }
    }
}

impl std::fmt::Display for ReadinessProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TcpPort { host, port } => write!(f, "tcp {host}:{port}"),
            Self::FileExists(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// Rule for when a process is considered ready for assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Block until the process exits and record its exit code.
    ///
    /// With a timeout the process is killed at the deadline; `None` waits
    /// forever.
    WaitForExit { timeout: Option<Duration> },
    /// Sleep for a fixed interval without waiting for exit.
    SettleDelay { delay: Duration, require_alive: bool },
    /// Poll a readiness probe with backoff, bounded by `timeout`.
    PollUntilReady {
        probe: ReadinessProbe,
        timeout: Duration,
        max_interval: Duration,
    },
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self::WaitForExit { timeout: None }
    }
}

/// What the policy observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exited { code: Option<i32> },
    Settled,
    Ready { after: Duration },
}

impl CompletionPolicy {
    pub fn wait_for_exit(timeout: Option<Duration>) -> Self {
        Self::WaitForExit { timeout }
    }

    pub fn settle(delay: Duration) -> Self {
        Self::SettleDelay {
            delay,
            require_alive: false,
        }
    }

    /// Settle, then fail if the process already exited.
    pub fn settle_alive(delay: Duration) -> Self {
        Self::SettleDelay {
            delay,
            require_alive: true,
        }
    }

    pub fn poll(probe: ReadinessProbe, timeout: Duration) -> Self {
        Self::PollUntilReady {
            probe,
            timeout,
            max_interval: Duration::from_millis(500),
        }
    }

    /// Block the calling thread until the policy is satisfied.
    pub fn apply(&self, handle: &mut ProcessHandle) -> Result<Completion, CompletionError> {
        match self {
            Self::WaitForExit { timeout: None } => {
                debug!(name = handle.name(), "Waiting for exit");
                handle.wait()?;
                Ok(Completion::Exited {
                    code: handle.exit_code(),
                })
            }
            Self::WaitForExit {
                timeout: Some(timeout),
            } => {
                debug!(name = handle.name(), "Waiting for exit (timeout: {timeout:?})");
                match handle.wait_timeout(*timeout)? {
                    Some(_) => Ok(Completion::Exited {
                        code: handle.exit_code(),
                    }),
                    None => {
                        warn!(name = handle.name(), "Process timed out after {timeout:?}");
                        handle.terminate()?;
                        Err(CompletionError::TimedOut {
                            name: handle.name().to_string(),
                            timeout: *timeout,
                        })
                    }
                }
            }
            Self::SettleDelay {
                delay,
                require_alive,
            } => {
                debug!(name = handle.name(), "Settling for {delay:?}");
                thread::sleep(*delay);
                if *require_alive && !handle.is_running() {
                    return Err(CompletionError::ExitedEarly {
                        name: handle.name().to_string(),
                        code: handle.exit_code(),
                    });
                }
                Ok(Completion::Settled)
            }
            Self::PollUntilReady {
                probe,
                timeout,
                max_interval,
            } => poll_until_ready(handle, probe, *timeout, *max_interval),
        }
    }
}

fn poll_until_ready(
    handle: &mut ProcessHandle,
    probe: &ReadinessProbe,
    timeout: Duration,
    max_interval: Duration,
) -> Result<Completion, CompletionError> {
    debug!(name = handle.name(), "Waiting for {probe} (timeout: {timeout:?})");

    let start = Instant::now();
    let mut delay = Duration::from_millis(10).min(max_interval);
    while start.elapsed() < timeout {
        if probe.is_ready() {
            info!(name = handle.name(), "Ready after {:?}: {probe}", start.elapsed());
            return Ok(Completion::Ready {
                after: start.elapsed(),
            });
        }
        if !handle.is_running() {
            return Err(CompletionError::ExitedEarly {
                name: handle.name().to_string(),
                code: handle.exit_code(),
            });
        }
        thread::sleep(delay);
        delay = (delay * 2).min(max_interval);
    }

    warn!(name = handle.name(), "Not ready after {timeout:?}: {probe}");
    Err(CompletionError::NotReady {
        name: handle.name().to_string(),
        probe: probe.clone(),
        timeout,
    })
}
