//! File watcher for module invalidation.
//!
//! Every module a worker loads can be watched (one registration per path).
//! Change notifications arrive on notify's own thread and are forwarded over
//! a tokio channel to [`run_invalidation`], which evicts the matching cache
//! entry on the worker's event loop. Registrations stay active after an
//! eviction, so later edits are still noticed.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use jscgi_common::{CgiError, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::module_cache::ModuleCache;

/// Receiving end of the change notifications.
pub type ChangeReceiver = mpsc::UnboundedReceiver<PathBuf>;

pub struct FileWatcher {
    watcher: RefCell<RecommendedWatcher>,
    watched: RefCell<HashSet<PathBuf>>,
}

impl FileWatcher {
    /// Creates a watcher and the channel its notifications are delivered on.
    pub fn new() -> Result<(Self, ChangeReceiver)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                    for path in event.paths {
                        let _ = tx.send(path);
                    }
                }
                Err(err) => tracing::warn!("watch error: {}", err),
            }
        })
        .map_err(|e| CgiError::Watch(e.to_string()))?;

        Ok((
            Self {
                watcher: RefCell::new(watcher),
                watched: RefCell::new(HashSet::new()),
            },
            rx,
        ))
    }

    /// Registers a watch on `path` unless one already exists.
    ///
    /// Returns true if a new registration was made.
    pub fn watch(&self, path: &Path) -> Result<bool> {
        if self.watched.borrow().contains(path) {
            return Ok(false);
        }

        self.watcher
            .borrow_mut()
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| CgiError::Watch(format!("{}: {}", path.display(), e)))?;
        self.watched.borrow_mut().insert(path.to_path_buf());

        tracing::info!("Watching {}", path.display());
        Ok(true)
    }

    pub fn is_watching(&self, path: &Path) -> bool {
        self.watched.borrow().contains(path)
    }

    pub fn watch_count(&self) -> usize {
        self.watched.borrow().len()
    }
}

/// Evicts cache entries as change notifications arrive.
///
/// Runs until every sender is gone, i.e. until the watcher is dropped.
pub async fn run_invalidation<A: Clone>(cache: Rc<ModuleCache<A>>, mut changes: ChangeReceiver) {
    while let Some(path) = changes.recv().await {
        tracing::debug!("{} changed", path.display());
        cache.invalidate(&path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_watch_registers_once() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().canonicalize().unwrap();
        let (watcher, _rx) = FileWatcher::new().unwrap();

        assert!(watcher.watch(&path).unwrap());
        assert!(!watcher.watch(&path).unwrap());
        assert!(watcher.is_watching(&path));
        assert_eq!(watcher.watch_count(), 1);
    }

    #[tokio::test]
    async fn test_watch_missing_file_fails() {
        let (watcher, _rx) = FileWatcher::new().unwrap();
        let err = watcher.watch(Path::new("/nonexistent/jscgi/file.js")).unwrap_err();
        assert!(matches!(err, CgiError::Watch(_)));
        assert_eq!(watcher.watch_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidation_loop_evicts_entries() {
        let cache: Rc<ModuleCache<u32>> = Rc::new(ModuleCache::new());
        let path = PathBuf::from("/srv/www/lib.js");
        cache.load(&path, |_| Ok(1)).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(path.clone()).unwrap();
        drop(tx);

        run_invalidation(cache.clone(), rx).await;
        assert!(!cache.contains(&path));
    }

    #[tokio::test]
    async fn test_file_edit_produces_notification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helper.js");
        std::fs::write(&path, "module.exports = 1;").unwrap();
        let path = path.canonicalize().unwrap();

        let (watcher, mut rx) = FileWatcher::new().unwrap();
        watcher.watch(&path).unwrap();

        std::fs::write(&path, "module.exports = 2;").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no change notification within 5s")
            .expect("watcher channel closed");
        assert_eq!(changed, path);
        assert!(watcher.is_watching(&path));
    }
}
