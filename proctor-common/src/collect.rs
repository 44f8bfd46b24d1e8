//! Turning captured bytes into ordered text lines.

use std::io;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::launch::{OutputSink, ProcessHandle};

/// Ordered text lines produced by a process, as observed by the harness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    text: String,
    lines: Vec<String>,
}

impl CapturedOutput {
    /// Build a snapshot from raw output bytes (lossy UTF-8).
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_text(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let lines = split_lines(&text);
        Self { text, lines }
    }

    /// Lines in emission order. Blank lines are kept as empty strings.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Output exactly as captured.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn line(&self, index: usize) -> Option<&str> {
        self.lines.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// New snapshot without the lines matched by `filter`.
    pub fn without_noise(&self, filter: &NoiseFilter) -> Self {
        if filter.is_empty() {
            return self.clone();
        }
        let kept: Vec<&str> = self
            .text
            .split_inclusive('\n')
            .filter(|raw| !filter.matches(trim_line_ending(raw)))
            .collect();
        Self::from_text(kept.concat())
    }
}

fn trim_line_ending(raw: &str) -> &str {
    let line = raw.strip_suffix('\n').unwrap_or(raw);
    line.strip_suffix('\r').unwrap_or(line)
}

fn split_lines(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    body.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect()
}

/// Lines emitted by tooling around the process under test rather than the
/// process itself (coverage runtimes and the like).
#[derive(Debug, Clone, Default)]
pub struct NoiseFilter {
    patterns: Vec<Regex>,
}

impl NoiseFilter {
    pub fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// Compile every pattern, failing on the first invalid one.
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, line: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(line))
    }
}

/// Read a handle's captured output.
///
/// Pipe sinks return everything drained so far, which is complete once the
/// process has been observed to exit. File sinks are read fully and reflect
/// whatever the process has flushed.
pub fn collect(handle: &mut ProcessHandle) -> io::Result<CapturedOutput> {
    collect_within(handle, None)
}

/// [`collect`] with a bound on how long an exited process's pipe may stay
/// open before the output read so far is taken as final.
pub fn collect_within(
    handle: &mut ProcessHandle,
    grace: Option<Duration>,
) -> io::Result<CapturedOutput> {
    let output = match handle.sink().clone() {
        OutputSink::Pipe => {
            let bytes = handle.pipe_output_within(grace).unwrap_or_default();
            CapturedOutput::from_bytes(&bytes)
        }
        OutputSink::File(path) => CapturedOutput::from_bytes(&std::fs::read(path)?),
    };
    debug!(
        name = handle.name(),
        lines = output.len(),
        exited = handle.has_exited(),
        "Collected output"
    );
    Ok(output)
}
