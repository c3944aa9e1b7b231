//! Logging bootstrap
//!
//! Console output goes to stderr; a worker's stdout carries IPC lines and must
//! stay clean. With `log.to_file` set, a daily rolling file
//! `<root>/log/<node id>.log.<date>` receives the same events through a
//! non-blocking writer.
//!
//! Well-known targets:
//!
//! - `app` for lines written by application code through `console`
//! - `access` for the per-request access log
//! - `slow` for requests slower than the application's `slow_time`

use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogSection;
use crate::error::Result;

/// Owner of the file writer; dropping it flushes pending lines.
#[derive(Default)]
pub struct LogGuard {
    guard: Option<WorkerGuard>,
}

impl LogGuard {
    /// Flushes and closes the file writer. Later events only reach stderr.
    pub fn flush(&mut self) {
        if let Some(guard) = self.guard.take() {
            drop(guard);
        }
    }

    pub fn is_open(&self) -> bool {
        self.guard.is_some()
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber for this process.
///
/// # Arguments
///
/// * `root` - Server root; files are written to `<root>/log`
/// * `node_id` - Node id used as the file prefix
/// * `config` - The `log` section
///
/// Installing twice is harmless: the second subscriber is discarded.
pub fn init(root: &Path, node_id: &str, config: &LogSection) -> Result<LogGuard> {
    let console = config.to_stdout.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(filter(&config.level))
    });

    let mut guard = LogGuard::default();
    let file = if config.to_file {
        let dir = root.join("log");
        std::fs::create_dir_all(&dir)?;
        let removed = prune(&dir, config.keep_days);
        let writer = tracing_appender::rolling::daily(&dir, format!("{}.log", node_id));
        let (nb, worker_guard) = tracing_appender::non_blocking(writer);
        guard.guard = Some(worker_guard);
        if removed > 0 {
            tracing::debug!(removed, "pruned old log files");
        }
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(nb)
                .with_filter(filter(&config.level)),
        )
    } else {
        None
    };

    let _ = tracing_subscriber::registry().with(console).with(file).try_init();
    Ok(guard)
}

/// Removes files in `dir` last modified more than `keep_days` days ago.
///
/// Returns the number of removed files. `keep_days == 0` keeps everything.
pub fn prune(dir: &Path, keep_days: u32) -> usize {
    if keep_days == 0 {
        return 0;
    }
    let max_age = Duration::from_secs(u64::from(keep_days) * 24 * 60 * 60);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let expired = meta
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .is_some_and(|age| age > max_age);
        if expired && std::fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prune_keeps_fresh_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("S1N1.log.2026-10-16"), "line").unwrap();
        assert_eq!(prune(dir.path(), 10), 0);
        assert!(dir.path().join("S1N1.log.2026-10-16").exists());
    }

    #[test]
    fn test_prune_zero_days_is_disabled() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.log"), "line").unwrap();
        assert_eq!(prune(dir.path(), 0), 0);
    }

    #[test]
    fn test_init_creates_log_dir_and_flush_closes() {
        let root = TempDir::new().unwrap();
        let config = LogSection {
            to_stdout: false,
            ..LogSection::default()
        };
        let mut guard = init(root.path(), "S1N0", &config).unwrap();
        assert!(root.path().join("log").is_dir());
        assert!(guard.is_open());
        guard.flush();
        assert!(!guard.is_open());
        guard.flush();
    }

    #[test]
    fn test_init_without_file_has_no_writer() {
        let root = TempDir::new().unwrap();
        let config = LogSection {
            to_file: false,
            ..LogSection::default()
        };
        let guard = init(root.path(), "S1N0", &config).unwrap();
        assert!(!guard.is_open());
        assert!(!root.path().join("log").exists());
    }
}
