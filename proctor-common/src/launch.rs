//! Process launching with combined output capture.
//!
//! A launched process writes both stdout and stderr into one sink: an
//! in-process pipe drained by a background reader, or a log file.

use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::env_overlay::EnvMap;

/// Where a launched process writes its combined output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSink {
    /// In-memory pipe read by the harness.
    Pipe,
    /// Log file opened for write (truncated) at launch.
    File(PathBuf),
}

/// The executable failed to start.
#[derive(Debug, thiserror::Error)]
#[error("Process failed to start: {program}: {source}")]
pub struct LaunchError {
    pub program: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Fully-resolved description of a process to start.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    name: String,
    program: PathBuf,
    args: Vec<OsString>,
    env: Option<EnvMap>,
    sink: OutputSink,
    current_dir: Option<PathBuf>,
}

impl LaunchSpec {
    /// Describe a launch of `program` with no arguments, the inherited
    /// environment and a pipe sink.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let name = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        Self {
            name,
            program,
            args: Vec::new(),
            env: None,
            sink: OutputSink::Pipe,
            current_dir: None,
        }
    }

    /// Label used in logs and cleanup reports.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Replace the child environment entirely.
    pub fn env(mut self, env: EnvMap) -> Self {
        self.env = Some(env);
        self
    }

    pub fn sink(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn label(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn environment(&self) -> Option<&EnvMap> {
        self.env.as_ref()
    }

    pub fn output_sink(&self) -> &OutputSink {
        &self.sink
    }

    /// Command line rendered for log messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

/// Bytes drained from a pipe sink by the background reader.
#[derive(Debug)]
struct PipeCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
    reader: Option<thread::JoinHandle<()>>,
    eof: mpsc::Receiver<()>,
}

impl PipeCapture {
    fn start<R: Read + Send + 'static>(mut source: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let (eof_tx, eof) = mpsc::channel();
        let reader = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = eof_tx.send(());
        });
        Self {
            buffer,
            reader: Some(reader),
            eof,
        }
    }

    /// Wait for the reader to hit EOF, at most `grace` when given.
    ///
    /// Returns false when the write end is still open at the deadline, e.g.
    /// held by a backgrounded grandchild. The reader then keeps running
    /// detached and later calls may wait again.
    fn finish(&mut self, grace: Option<Duration>) -> bool {
        let Some(reader) = self.reader.take() else {
            return true;
        };
        if let Some(grace) = grace
            && let Err(RecvTimeoutError::Timeout) = self.eof.recv_timeout(grace)
        {
            self.reader = Some(reader);
            return false;
        }
        let _ = reader.join();
        true
    }

    fn snapshot(&self) -> Vec<u8> {
        match self.buffer.lock() {
            Ok(buf) => buf.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Live reference to a spawned process.
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    program: PathBuf,
    pid: u32,
    started_at: Instant,
    child: Child,
    sink: OutputSink,
    capture: Option<PipeCapture>,
    status: Option<ExitStatus>,
    terminated: bool,
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Exit code recorded once termination was observed.
    ///
    /// `None` while running, and for processes killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    /// Exit status recorded once termination was observed.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// True once the process has been observed to exit.
    pub fn has_exited(&self) -> bool {
        self.status.is_some()
    }

    /// True when this handle killed the process.
    pub fn was_terminated(&self) -> bool {
        self.terminated
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        if self.status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.record_exit(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(name = %self.name, pid = self.pid, "try_wait failed: {e}");
                false
            }
        }
    }

    /// Block until the process exits and record its status.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        self.record_exit(status);
        Ok(status)
    }

    /// Wait at most `timeout` for the process to exit.
    ///
    /// Returns `Ok(None)` if the process is still running at the deadline.
    pub fn wait_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        let start = Instant::now();
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.record_exit(status);
                return Ok(Some(status));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Kill the process and reap it.
    ///
    /// Terminating an exited or already terminated process is a no-op.
    pub fn terminate(&mut self) -> io::Result<()> {
        if self.status.is_some() {
            debug!(name = %self.name, pid = self.pid, "terminate: process already exited");
            return Ok(());
        }
        if let Some(status) = self.child.try_wait()? {
            self.record_exit(status);
            return Ok(());
        }

        info!(name = %self.name, pid = self.pid, "Stopping process");
        match self.child.kill() {
            Ok(()) => {}
            // Lost the race with a natural exit.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.terminated = true;
        let status = self.child.wait()?;
        self.record_exit(status);
        Ok(())
    }

    /// Combined output drained from a pipe sink so far.
    ///
    /// Once exit was observed the reader is joined first, so the result is
    /// complete. Returns `None` for file sinks.
    pub fn pipe_output(&mut self) -> Option<Vec<u8>> {
        self.pipe_output_within(None)
    }

    /// Like [`pipe_output`](Self::pipe_output), but after exit waits at most
    /// `grace` for the pipe to close.
    ///
    /// A descendant that inherited the pipe can hold it open long after the
    /// process itself exited; at the deadline the output read so far is
    /// returned.
    pub fn pipe_output_within(&mut self, grace: Option<Duration>) -> Option<Vec<u8>> {
        let exited = self.status.is_some();
        let capture = self.capture.as_mut()?;
        if exited && !capture.finish(grace) {
            warn!(
                name = %self.name,
                pid = self.pid,
                "Output pipe still open after exit (inherited by a descendant?); using partial output"
            );
        }
        Some(capture.snapshot())
    }

    fn record_exit(&mut self, status: ExitStatus) {
        debug!(
            name = %self.name,
            pid = self.pid,
            exit_code = ?status.code(),
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "Process exited"
        );
        self.status = Some(status);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.status.is_none()
            && let Err(e) = self.terminate()
        {
            warn!(name = %self.name, pid = self.pid, "Failed to kill on drop: {e}");
        }
    }
}

/// Start the process described by `spec`.
///
/// The process runs concurrently with the caller; the returned handle is
/// usable immediately.
pub fn launch(spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
    let launch_err = |source: io::Error| LaunchError {
        program: spec.program.clone(),
        source,
    };

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).stdin(Stdio::null());
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }
    if let Some(env) = &spec.env {
        cmd.env_clear().envs(env);
    }

    let reader = match &spec.sink {
        OutputSink::Pipe => {
            let (reader, writer) = io::pipe().map_err(launch_err)?;
            cmd.stdout(writer.try_clone().map_err(launch_err)?)
                .stderr(writer);
            Some(reader)
        }
        OutputSink::File(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).map_err(launch_err)?;
            }
            let file = File::create(path).map_err(launch_err)?;
            cmd.stdout(file.try_clone().map_err(launch_err)?)
                .stderr(file);
            None
        }
    };

    debug!(name = %spec.name, "Executing: {}", spec.command_line());
    let child = cmd.spawn().map_err(launch_err)?;
    // Release the parent's write ends so the reader sees EOF when the child exits.
    drop(cmd);

    let pid = child.id();
    info!(name = %spec.name, pid, sink = ?spec.sink, "Process spawned");

    Ok(ProcessHandle {
        name: spec.name.clone(),
        program: spec.program.clone(),
        pid,
        started_at: Instant::now(),
        child,
        sink: spec.sink.clone(),
        capture: reader.map(PipeCapture::start),
        status: None,
        terminated: false,
    })
}
