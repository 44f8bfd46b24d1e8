//! Declarative expectations over captured output and side-effect artifacts.
//!
//! Every check is pure: it reads its inputs and never mutates them. Failures
//! name the missing fragment, the mismatched text, or the difference set.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::collect::CapturedOutput;

/// An expectation that did not hold.
#[derive(Debug, thiserror::Error)]
pub enum ExpectationFailure {
    #[error("output mismatch:\n--- expected ---\n{expected}\n--- actual ---\n{actual}")]
    TextMismatch { expected: String, actual: String },

    #[error("fragment '{fragment}' not found in any of {searched} captured lines")]
    MissingFragment { fragment: String, searched: usize },

    #[error("message '{message}' not found in structured output ({searched} lines)")]
    MissingMessage { message: String, searched: usize },

    #[error("no line contains '{needle}'. Caught output: {lines:?}")]
    MissingLine { needle: String, lines: Vec<String> },

    #[error("line {index} should contain '{fragment}' but was {actual:?}")]
    LineMismatch {
        index: usize,
        fragment: String,
        actual: Option<String>,
    },

    #[error("artifact {} is not empty: {content:?}", .path.display())]
    ArtifactNotEmpty { path: PathBuf, content: String },

    #[error("artifact {} could not be read: {source}", .path.display())]
    ArtifactUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "record set mismatch in {}: difference {difference:?} (missing {missing:?}, unexpected {unexpected:?})",
        .path.display()
    )]
    RecordSetMismatch {
        path: PathBuf,
        difference: BTreeSet<String>,
        missing: BTreeSet<String>,
        unexpected: BTreeSet<String>,
    },

    #[error("exit code {} not in accepted set {accepted}", describe_exit(.actual))]
    ExitCode { actual: Option<i32>, accepted: ExitCodes },
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "<none: not exited or killed by signal>".to_string(),
    }
}

/// Declarative description of required output or artifact content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    /// Whole output, trimmed at both ends, equals `text` trimmed the same way.
    ExactMatch { text: String },
    /// Every fragment is a substring of some line.
    AllFragmentsPresent { fragments: Vec<String> },
    /// Every message appears as `"message":"<text>"` in some line.
    AllMessagesPresent { messages: Vec<String> },
    /// Some line equals or contains `needle`.
    ContainsLine { needle: String },
    /// Line `index` exists and contains `fragment`.
    LineAt { index: usize, fragment: String },
    /// The artifact holds nothing but whitespace.
    EmptyArtifact { path: PathBuf },
    /// Identifiers before the first comma of each non-empty artifact line
    /// form exactly `expected`.
    RecordSetEquals {
        path: PathBuf,
        expected: BTreeSet<String>,
    },
}

impl Expectation {
    pub fn exact(text: impl Into<String>) -> Self {
        Self::ExactMatch { text: text.into() }
    }

    pub fn fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllFragmentsPresent {
            fragments: fragments.into_iter().map(Into::into).collect(),
        }
    }

    pub fn messages<I, S>(messages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllMessagesPresent {
            messages: messages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains_line(needle: impl Into<String>) -> Self {
        Self::ContainsLine {
            needle: needle.into(),
        }
    }

    pub fn line_at(index: usize, fragment: impl Into<String>) -> Self {
        Self::LineAt {
            index,
            fragment: fragment.into(),
        }
    }

    pub fn empty_artifact(path: impl Into<PathBuf>) -> Self {
        Self::EmptyArtifact { path: path.into() }
    }

    pub fn record_set<I, S>(path: impl Into<PathBuf>, expected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::RecordSetEquals {
            path: path.into(),
            expected: expected.into_iter().map(Into::into).collect(),
        }
    }

    /// True for variants that read an artifact file instead of output.
    pub fn reads_artifact(&self) -> bool {
        matches!(
            self,
            Self::EmptyArtifact { .. } | Self::RecordSetEquals { .. }
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ExactMatch { .. } => "exact_match",
            Self::AllFragmentsPresent { .. } => "all_fragments_present",
            Self::AllMessagesPresent { .. } => "all_messages_present",
            Self::ContainsLine { .. } => "contains_line",
            Self::LineAt { .. } => "line_at",
            Self::EmptyArtifact { .. } => "empty_artifact",
            Self::RecordSetEquals { .. } => "record_set_equals",
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Check one expectation against a captured output snapshot.
///
/// Artifact variants ignore `output` and read their file instead.
pub fn check(expectation: &Expectation, output: &CapturedOutput) -> Result<(), ExpectationFailure> {
    let result = match expectation {
        Expectation::ExactMatch { text } => check_exact(output, text),
        Expectation::AllFragmentsPresent { fragments } => check_fragments(output, fragments),
        Expectation::AllMessagesPresent { messages } => check_messages(output, messages),
        Expectation::ContainsLine { needle } => check_contains_line(output, needle),
        Expectation::LineAt { index, fragment } => check_line_at(output, *index, fragment),
        Expectation::EmptyArtifact { path } => check_empty_artifact(path),
        Expectation::RecordSetEquals { path, expected } => check_record_set(path, expected),
    };
    match &result {
        Ok(()) => debug!(kind = expectation.kind(), "Assertion passed"),
        Err(e) => warn!(kind = expectation.kind(), "Assertion failed: {e}"),
    }
    result
}

fn normalize(text: &str) -> String {
    text.replace('\t', "    ").trim().to_string()
}

fn check_exact(output: &CapturedOutput, expected: &str) -> Result<(), ExpectationFailure> {
    let actual = normalize(output.text());
    let expected = normalize(expected);
    if actual == expected {
        Ok(())
    } else {
        Err(ExpectationFailure::TextMismatch { expected, actual })
    }
}

fn check_fragments(output: &CapturedOutput, fragments: &[String]) -> Result<(), ExpectationFailure> {
    for fragment in fragments {
        if !output.lines().iter().any(|line| line.contains(fragment.as_str())) {
            return Err(ExpectationFailure::MissingFragment {
                fragment: fragment.clone(),
                searched: output.len(),
            });
        }
    }
    Ok(())
}

fn check_messages(output: &CapturedOutput, messages: &[String]) -> Result<(), ExpectationFailure> {
    for message in messages {
        let field = format!("\"message\":\"{message}\"");
        if !output.lines().iter().any(|line| line.contains(&field)) {
            return Err(ExpectationFailure::MissingMessage {
                message: message.clone(),
                searched: output.len(),
            });
        }
    }
    Ok(())
}

fn check_contains_line(output: &CapturedOutput, needle: &str) -> Result<(), ExpectationFailure> {
    if output.lines().iter().any(|line| line.contains(needle)) {
        Ok(())
    } else {
        Err(ExpectationFailure::MissingLine {
            needle: needle.to_string(),
            lines: output.lines().to_vec(),
        })
    }
}

fn check_line_at(
    output: &CapturedOutput,
    index: usize,
    fragment: &str,
) -> Result<(), ExpectationFailure> {
    match output.line(index) {
        Some(line) if line.contains(fragment) => Ok(()),
        actual => Err(ExpectationFailure::LineMismatch {
            index,
            fragment: fragment.to_string(),
            actual: actual.map(str::to_string),
        }),
    }
}

fn read_artifact(path: &Path) -> Result<String, ExpectationFailure> {
    std::fs::read_to_string(path).map_err(|source| ExpectationFailure::ArtifactUnreadable {
        path: path.to_path_buf(),
        source,
    })
}

fn check_empty_artifact(path: &Path) -> Result<(), ExpectationFailure> {
    let content = read_artifact(path)?;
    if content.trim().is_empty() {
        Ok(())
    } else {
        Err(ExpectationFailure::ArtifactNotEmpty {
            path: path.to_path_buf(),
            content,
        })
    }
}

/// Record identifiers of a listing artifact: the text before the first comma
/// of every non-empty line, duplicates collapsed.
pub fn record_ids(content: &str) -> BTreeSet<String> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.split(',').next().unwrap_or(line).to_string())
        .collect()
}

fn check_record_set(path: &Path, expected: &BTreeSet<String>) -> Result<(), ExpectationFailure> {
    let found = record_ids(&read_artifact(path)?);
    if &found == expected {
        return Ok(());
    }
    let missing: BTreeSet<String> = expected.difference(&found).cloned().collect();
    let unexpected: BTreeSet<String> = found.difference(expected).cloned().collect();
    Err(ExpectationFailure::RecordSetMismatch {
        path: path.to_path_buf(),
        difference: missing.union(&unexpected).cloned().collect(),
        missing,
        unexpected,
    })
}

/// Exit codes a step accepts.
///
/// Serialized as `"any"` or a list of codes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ExitCodesRepr", into = "ExitCodesRepr")]
pub enum ExitCodes {
    /// Any exit, including death by signal.
    Any,
    OneOf(BTreeSet<i32>),
}

impl ExitCodes {
    pub fn success() -> Self {
        Self::OneOf(BTreeSet::from([0]))
    }

    /// `{0}` plus `code` (flag-only invocations that may exit with 2).
    pub fn success_or(code: i32) -> Self {
        Self::OneOf(BTreeSet::from([0, code]))
    }

    pub fn one_of(codes: impl IntoIterator<Item = i32>) -> Self {
        Self::OneOf(codes.into_iter().collect())
    }

    pub fn accepts(&self, code: Option<i32>) -> bool {
        match (self, code) {
            (Self::Any, _) => true,
            (Self::OneOf(codes), Some(code)) => codes.contains(&code),
            (Self::OneOf(_), None) => false,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ExitCodesRepr {
    Keyword(String),
    Codes(Vec<i32>),
}

impl TryFrom<ExitCodesRepr> for ExitCodes {
    type Error = String;

    fn try_from(repr: ExitCodesRepr) -> Result<Self, Self::Error> {
        match repr {
            ExitCodesRepr::Keyword(word) if word == "any" => Ok(Self::Any),
            ExitCodesRepr::Keyword(word) => {
                Err(format!("expected \"any\" or a list of exit codes, got '{word}'"))
            }
            ExitCodesRepr::Codes(codes) => Ok(Self::one_of(codes)),
        }
    }
}

impl From<ExitCodes> for ExitCodesRepr {
    fn from(codes: ExitCodes) -> Self {
        match codes {
            ExitCodes::Any => Self::Keyword("any".to_string()),
            ExitCodes::OneOf(codes) => Self::Codes(codes.into_iter().collect()),
        }
    }
}

impl Default for ExitCodes {
    fn default() -> Self {
        Self::success()
    }
}

impl fmt::Display for ExitCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("<any>"),
            Self::OneOf(codes) => {
                let rendered: Vec<String> = codes.iter().map(ToString::to_string).collect();
                write!(f, "{{{}}}", rendered.join(", "))
            }
        }
    }
}

/// Check a recorded exit code against the accepted set.
pub fn check_exit_code(actual: Option<i32>, accepted: &ExitCodes) -> Result<(), ExpectationFailure> {
    if accepted.accepts(actual) {
        Ok(())
    } else {
        warn!("Exit code {} not in {accepted}", describe_exit(&actual));
        Err(ExpectationFailure::ExitCode {
            actual,
            accepted: accepted.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn output(text: &str) -> CapturedOutput {
        CapturedOutput::from_text(text)
    }

    fn artifact(content: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();
        file
    }

    #[test]
    fn test_exact_match_trims_and_expands_tabs() {
        let out = output("\nUsage of cleaner:\n  -authors\n\tshow authors\n\n");
        check(
            &Expectation::exact("Usage of cleaner:\n  -authors\n    show authors"),
            &out,
        )
        .unwrap();
    }

    #[test]
    fn test_exact_mismatch_reports_both_values() {
        let err = check(&Expectation::exact("expected text"), &output("actual text\n")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("expected text"));
        assert!(msg.contains("actual text"));
    }

    #[test]
    fn test_fragments_in_any_order() {
        let out = output("Vacuuming finished\nDB connection configuration driverName=postgres\nVacuuming started\n");
        check(
            &Expectation::fragments(["Vacuuming started", "postgres", "Vacuuming finished"]),
            &out,
        )
        .unwrap();
    }

    #[test]
    fn test_first_missing_fragment_is_named() {
        let out = output("Vacuuming started\n");
        let err = check(
            &Expectation::fragments(["Vacuuming started", "driverName", "Vacuuming finished"]),
            &out,
        )
        .unwrap_err();
        match err {
            ExpectationFailure::MissingFragment { fragment, searched } => {
                assert_eq!(fragment, "driverName");
                assert_eq!(searched, 1);
            }
            other => panic!("unexpected failure: {other}"),
        }
    }

    #[test]
    fn test_messages_require_structured_field() {
        let out = output(
            "{\"level\":\"info\",\"message\":\"Cleaner configuration\"}\nStorage configuration\n",
        );
        check(&Expectation::messages(["Cleaner configuration"]), &out).unwrap();
        let err = check(&Expectation::messages(["Storage configuration"]), &out).unwrap_err();
        assert!(err.to_string().contains("'Storage configuration'"));
    }

    #[test]
    fn test_contains_line() {
        let out = output("Insights Results Aggregator Cleaner version 1.0\n");
        check(&Expectation::contains_line("version 1.0"), &out).unwrap();
        let err = check(&Expectation::contains_line("version 2.0"), &out).unwrap_err();
        assert!(err.to_string().contains("version 2.0"));
    }

    #[test]
    fn test_line_at() {
        let out = output("a\nb\nc\nBroker:\n  Address: localhost:9092\n");
        check(&Expectation::line_at(3, "Broker"), &out).unwrap();
        check(&Expectation::line_at(4, "Address"), &out).unwrap();
        let err = check(&Expectation::line_at(9, "CertPath"), &out).unwrap_err();
        assert!(matches!(err, ExpectationFailure::LineMismatch { actual: None, .. }));
    }

    #[test]
    fn test_empty_artifact() {
        check(&Expectation::empty_artifact(artifact("").path()), &output("")).unwrap();
        check(&Expectation::empty_artifact(artifact("\n").path()), &output("")).unwrap();
        let err = check(&Expectation::empty_artifact(artifact("c1,x\n").path()), &output(""))
            .unwrap_err();
        assert!(matches!(err, ExpectationFailure::ArtifactNotEmpty { .. }));
    }

    #[test]
    fn test_missing_artifact_is_reported() {
        let err = check(
            &Expectation::empty_artifact("/nonexistent/proctor/listing"),
            &output(""),
        )
        .unwrap_err();
        assert!(matches!(err, ExpectationFailure::ArtifactUnreadable { .. }));
    }

    #[test]
    fn test_record_set_round_trip() {
        let file = artifact("c1,x\nc1,y\nc2,z\n");
        check(&Expectation::record_set(file.path(), ["c1", "c2"]), &output("")).unwrap();

        let err = check(&Expectation::record_set(file.path(), ["c1"]), &output("")).unwrap_err();
        match err {
            ExpectationFailure::RecordSetMismatch {
                difference,
                missing,
                unexpected,
                ..
            } => {
                assert_eq!(difference, BTreeSet::from(["c2".to_string()]));
                assert!(missing.is_empty());
                assert_eq!(unexpected, BTreeSet::from(["c2".to_string()]));
            }
            other => panic!("unexpected failure: {other}"),
        }
    }

    #[test]
    fn test_record_ids_skip_blank_lines() {
        let ids = record_ids("\nc1,2021-01-01\n\nc3\n");
        assert_eq!(ids, BTreeSet::from(["c1".to_string(), "c3".to_string()]));
    }

    #[test]
    fn test_exit_code_gating() {
        check_exit_code(Some(2), &ExitCodes::success_or(2)).unwrap();
        let err = check_exit_code(Some(2), &ExitCodes::success()).unwrap_err();
        assert!(err.to_string().contains("exit code 2"));
        assert!(check_exit_code(None, &ExitCodes::success()).is_err());
        check_exit_code(None, &ExitCodes::Any).unwrap();
    }

    #[test]
    fn test_exit_codes_serde() {
        let any: ExitCodes = serde_json::from_str("\"any\"").unwrap();
        assert_eq!(any, ExitCodes::Any);
        let codes: ExitCodes = serde_json::from_str("[2, 0]").unwrap();
        assert_eq!(codes, ExitCodes::success_or(2));
        assert_eq!(codes.to_string(), "{0, 2}");
        assert!(serde_json::from_str::<ExitCodes>("\"some\"").is_err());
    }

    #[test]
    fn test_expectation_serde_shape() {
        let exp: Expectation = serde_json::from_str(
            r#"{"kind":"record_set_equals","path":"test","expected":["c1","c2"]}"#,
        )
        .unwrap();
        assert_eq!(exp, Expectation::record_set("test", ["c1", "c2"]));
        assert!(exp.reads_artifact());
    }

    #[test]
    fn test_check_does_not_mutate_output() {
        let out = output("x\ny\n");
        let before = out.clone();
        let _ = check(&Expectation::fragments(["z"]), &out);
        assert_eq!(out, before);
    }

    proptest! {
        #[test]
        fn prop_record_set_difference_is_symmetric(
            found in proptest::collection::btree_set("[a-e]", 0..5),
            expected in proptest::collection::btree_set("[a-e]", 0..5),
        ) {
            let content: String = found.iter().map(|id| format!("{id},row\n")).collect();
            let file = artifact(&content);
            let result = check_record_set(file.path(), &expected);
            if found == expected {
                prop_assert!(result.is_ok());
            } else {
                match result {
                    Err(ExpectationFailure::RecordSetMismatch { difference, .. }) => {
                        let symmetric: BTreeSet<String> =
                            found.symmetric_difference(&expected).cloned().collect();
                        prop_assert_eq!(difference, symmetric);
                    }
                    other => prop_assert!(false, "unexpected: {:?}", other),
                }
            }
        }
    }
}
