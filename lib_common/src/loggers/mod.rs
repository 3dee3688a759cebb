//! # Logging
//!
//! Process-wide `tracing` setup shared by every binary in the workspace.
//!
//! ## Core Components:
//!
//! - **`init_tracing`**: installs an `EnvFilter`, a stdout layer and, when a
//!   log directory is configured, a daily-rotating non-blocking file layer.
//!   Either output can be plain text or JSON.
//! - **`cleanup_old_logs`**: start-up housekeeping that keeps only the newest
//!   rotated files of one prefix.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to prepare log directory: {0}")]
    Io(#[from] io::Error),
    #[error("invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },
    #[error("a global subscriber is already installed: {0}")]
    Init(String),
}

/// How to set up logging.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Filter directive such as `info` or `lib_common=debug,info`. `None`
    /// falls back to `RUST_LOG`, then to `info`.
    pub level: Option<String>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Directory for rotating log files. `None` logs to stdout only.
    pub log_dir: Option<PathBuf>,
    /// File name prefix, e.g. `server_orders` → `server_orders.log.2026-01-31`.
    pub file_prefix: String,
    /// How many rotated files to keep on start-up.
    pub retain: usize,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: None,
            json: false,
            log_dir: None,
            file_prefix: "app".to_string(),
            retain: 7,
        }
    }
}

type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Builds the filter from an explicit directive, `RUST_LOG`, or `info`.
pub fn build_filter(level: Option<&str>) -> Result<EnvFilter, LogError> {
    match level {
        Some(directive) => EnvFilter::try_new(directive).map_err(|e| LogError::Filter {
            filter: directive.to_string(),
            reason: e.to_string(),
        }),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}

/// # Initialize Tracing
///
/// Installs the global subscriber. Call once, early in `main`.
///
/// # Returns
/// The file writer's `WorkerGuard` when file output is enabled. Keep it alive
/// for the life of the process; dropping it flushes and stops the writer.
pub fn init_tracing(options: &LogOptions) -> Result<Option<WorkerGuard>, LogError> {
    let filter = build_filter(options.level.as_deref())?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(if options.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    });

    let mut guard = None;
    let mut removed = 0;
    if let Some(dir) = &options.log_dir {
        fs::create_dir_all(dir)?;
        removed = cleanup_old_logs(dir, &options.file_prefix, options.retain)?;

        let appender = tracing_appender::rolling::daily(dir, format!("{}.log", options.file_prefix));
        let (writer, worker_guard) = tracing_appender::non_blocking(appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer().with_writer(writer).with_ansi(false).with_target(true);
        layers.push(if options.json {
            file_layer.json().boxed()
        } else {
            file_layer.boxed()
        });
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()
        .map_err(|e| LogError::Init(e.to_string()))?;

    if removed > 0 {
        tracing::info!(removed, "old log files removed");
    }
    tracing::debug!(json = options.json, file = options.log_dir.is_some(), "tracing initialized");
    Ok(guard)
}

/// # Cleanup Old Logs
///
/// Deletes files in `log_dir` whose name starts with `prefix`, keeping the
/// `retain` most recently modified. Other files are never touched. Files that
/// cannot be removed are reported on stderr and skipped.
///
/// # Returns
/// How many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, prefix: &str, retain: usize) -> io::Result<usize> {
    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
        .map(|e| {
            let modified = e
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, e.path())
        })
        .collect();

    // Newest first.
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(retain) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn touch(dir: &Path, name: &str, age_secs: u64) {
        let file = File::create(dir.join(name)).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs)).unwrap();
    }

    #[test]
    fn keeps_newest_files_of_prefix() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "server_orders.log.2026-01-01", 300);
        touch(dir.path(), "server_orders.log.2026-01-02", 200);
        touch(dir.path(), "server_orders.log.2026-01-03", 100);
        touch(dir.path(), "unrelated.txt", 900);

        let removed = cleanup_old_logs(dir.path(), "server_orders", 2).unwrap();
        assert_eq!(removed, 1);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec![
                "server_orders.log.2026-01-02".to_string(),
                "server_orders.log.2026-01-03".to_string(),
                "unrelated.txt".to_string(),
            ]
        );
    }

    #[test]
    fn retain_zero_clears_prefix() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "app.log.a", 10);
        touch(dir.path(), "app.log.b", 20);

        assert_eq!(cleanup_old_logs(dir.path(), "app", 0).unwrap(), 2);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn explicit_filter_is_validated() {
        assert!(build_filter(Some("info")).is_ok());
        assert!(build_filter(Some("lib_common=debug,warn")).is_ok());
        assert!(matches!(build_filter(Some("lib_common=verbose")), Err(LogError::Filter { .. })));
    }
}
