//! Done-markers for setup scripts
//!
//! `setup/<name>.js` runs again only when `setup/<name>.done` is missing or
//! holds a timestamp older than the script's modification time. Timestamps
//! are compared at millisecond precision, the precision they are written with.
//! A marker that can't be parsed is never older than anything, so the script
//! is skipped until the marker is removed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

/// `setup/migrate.js` -> `setup/migrate.done`
pub fn done_marker_path(script: &Path) -> PathBuf {
    script.with_extension("done")
}

/// Whether `script` has to run. A missing marker means it does; an
/// unparseable one means it does not.
pub async fn setup_script_changed(script: &Path) -> bool {
    let marker = match tokio::fs::read_to_string(done_marker_path(script)).await {
        Ok(marker) => marker,
        Err(_) => return true,
    };
    let done = match DateTime::parse_from_rfc3339(marker.trim()) {
        Ok(done) => done.with_timezone(&Utc),
        Err(e) => {
            tracing::warn!("Invalid done marker for {}, skipping: {}", script.display(), e);
            return false;
        }
    };
    let modified = match tokio::fs::metadata(script).await.and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified),
        Err(_) => return false,
    };
    done.timestamp_millis() < modified.timestamp_millis()
}

/// Records a successful run of `script` now.
pub async fn write_done_marker(script: &Path) -> std::io::Result<()> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    tokio::fs::write(done_marker_path(script), now).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_path() {
        assert_eq!(
            done_marker_path(Path::new("/app/setup/migrate.js")),
            PathBuf::from("/app/setup/migrate.done")
        );
    }

    #[tokio::test]
    async fn test_missing_marker_runs() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("migrate.js");
        std::fs::write(&script, "1").unwrap();
        assert!(setup_script_changed(&script).await);
    }

    #[tokio::test]
    async fn test_fresh_marker_skips() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("migrate.js");
        std::fs::write(&script, "1").unwrap();
        write_done_marker(&script).await.unwrap();
        assert!(!setup_script_changed(&script).await);
    }

    #[tokio::test]
    async fn test_old_marker_runs() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("migrate.js");
        std::fs::write(&script, "1").unwrap();
        std::fs::write(dir.path().join("migrate.done"), "2001-01-01T00:00:00.000Z").unwrap();
        assert!(setup_script_changed(&script).await);
    }

    #[tokio::test]
    async fn test_garbage_marker_skips() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("migrate.js");
        std::fs::write(&script, "1").unwrap();
        std::fs::write(dir.path().join("migrate.done"), "yesterday").unwrap();
        assert!(!setup_script_changed(&script).await);
    }
}
