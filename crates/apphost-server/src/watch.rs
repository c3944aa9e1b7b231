//! Directory watches feeding cache invalidation
//!
//! Applications register every directory they load from. Change events come
//! back as the directory that changed; the worker maps it to the owning
//! application and invalidates that directory's cache scope.

use std::cell::RefCell;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// Receiver of watch registrations.
pub trait CacheWatch {
    /// Starts watching `dir` (absolute). Failures are logged, not returned.
    fn watch(&self, dir: &Path);
}

/// Ignores every registration. Used by long workers and tests.
#[derive(Debug, Default)]
pub struct NullWatch;

impl CacheWatch for NullWatch {
    fn watch(&self, _dir: &Path) {}
}

/// Watches directories with the platform notifier.
pub struct NotifyWatch {
    watcher: RefCell<RecommendedWatcher>,
}

impl NotifyWatch {
    /// Creates the watcher and the stream of changed directories.
    pub fn new() -> notify::Result<(Self, UnboundedReceiver<PathBuf>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                for path in event.paths {
                    if let Some(dir) = path.parent() {
                        let _ = tx.send(dir.to_path_buf());
                    }
                }
            }
            Err(e) => tracing::warn!("Watch error: {}", e),
        })?;
        Ok((
            Self {
                watcher: RefCell::new(watcher),
            },
            rx,
        ))
    }
}

impl CacheWatch for NotifyWatch {
    fn watch(&self, dir: &Path) {
        if let Err(e) = self
            .watcher
            .borrow_mut()
            .watch(dir, RecursiveMode::NonRecursive)
        {
            tracing::debug!("Can't watch {}: {}", dir.display(), e);
        }
    }
}

/// Application-relative form of `dir` when it lies under `root`:
/// `/srv/apps/shop/lib/util` under `/srv/apps/shop` is `/lib/util`.
pub fn relative_dir(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    let mut out = String::new();
    for part in rel.components() {
        out.push('/');
        out.push_str(&part.as_os_str().to_string_lossy());
    }
    if out.is_empty() {
        out.push('/');
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_dir() {
        let root = Path::new("/srv/apps/shop");
        assert_eq!(
            relative_dir(root, Path::new("/srv/apps/shop/lib/util")).as_deref(),
            Some("/lib/util")
        );
        assert_eq!(relative_dir(root, root).as_deref(), Some("/"));
        assert_eq!(relative_dir(root, Path::new("/srv/apps/billing/lib")), None);
    }
}
