//! Structured tracing setup for harness runs inside `cargo test`.
//!
//! ```ignore
//! #[test]
//! fn test_example() {
//!     proctor_common::logging::init_test_logging(); // safe to call repeatedly
//!     tracing::info!("captured in JSONL and shown on failure");
//! }
//! ```

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static TEST_LOGGING_INIT: Once = Once::new();

/// Install a global subscriber writing JSON lines to
/// `target/test-logs/proctor.jsonl` and compact lines to the test writer.
///
/// # Environment Variables
///
/// - `PROCTOR_TEST_LOG_FILE`: override the JSONL path
/// - `PROCTOR_LOG_LEVEL`: level filter for the harness (default: `info`)
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let file_layer = create_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_level(true)
            .compact();

        let level = std::env::var("PROCTOR_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!("proctor_common={level},proctor={level}"))
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_log_file() -> Option<std::fs::File> {
    if let Ok(custom_path) = std::env::var("PROCTOR_TEST_LOG_FILE") {
        if let Some(parent) = PathBuf::from(&custom_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(&custom_path).ok();
    }

    let log_dir = find_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("proctor.jsonl")).ok()
}

fn find_target_dir() -> PathBuf {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return PathBuf::from(target_dir);
    }

    let mut cwd = std::env::current_dir().unwrap_or_default();
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return target;
        }
        if !cwd.pop() {
            return PathBuf::from("target");
        }
    }
}
