//! Dependency Cache
//!
//! Caches compiled module artifacts by absolute path for the lifetime of a
//! worker process. Each worker owns its own cache; nothing here is shared
//! across processes or threads, so interior mutability is plain `RefCell`.
//!
//! The cache knows nothing about how artifacts are produced or when files
//! change. Callers hand [`ModuleCache::load`] a compile closure, and the
//! watcher calls [`ModuleCache::invalidate`] when a file is edited.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use jscgi_common::{CgiError, Result};

/// A cache entry: the compiled artifact plus when it was produced.
#[derive(Debug, Clone)]
pub struct CachedModule<A> {
    pub artifact: A,
    pub loaded_at: Instant,
}

/// Per-worker module cache keyed by absolute path.
#[derive(Debug)]
pub struct ModuleCache<A> {
    entries: RefCell<HashMap<PathBuf, CachedModule<A>>>,
    loading: RefCell<HashSet<PathBuf>>,
}

impl<A: Clone> ModuleCache<A> {
    pub fn new() -> Self {
        Self {
            entries: RefCell::new(HashMap::new()),
            loading: RefCell::new(HashSet::new()),
        }
    }

    /// Returns the cached artifact for `path`, compiling it on first use.
    ///
    /// No borrow is held while `compile` runs, so the compile step may load
    /// other modules. Loading a module that is still being compiled (an
    /// import cycle) is an error.
    pub fn load<F>(&self, path: &Path, compile: F) -> Result<A>
    where
        F: FnOnce(&Path) -> Result<A>,
    {
        if let Some(entry) = self.entries.borrow().get(path) {
            return Ok(entry.artifact.clone());
        }

        if !self.loading.borrow_mut().insert(path.to_path_buf()) {
            return Err(CgiError::Module(format!(
                "circular import of {}",
                path.display()
            )));
        }

        tracing::debug!("Compiling module {}", path.display());
        let compiled = compile(path);
        self.loading.borrow_mut().remove(path);

        let artifact = compiled?;
        self.entries.borrow_mut().insert(
            path.to_path_buf(),
            CachedModule {
                artifact: artifact.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(artifact)
    }

    /// Evicts the entry for `path`. Returns true if an entry was removed.
    pub fn invalidate(&self, path: &Path) -> bool {
        let removed = self.entries.borrow_mut().remove(path).is_some();
        if removed {
            tracing::info!("Expiring {}", path.display());
        }
        removed
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.borrow().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// When the entry for `path` was compiled, if cached.
    pub fn loaded_at(&self, path: &Path) -> Option<Instant> {
        self.entries.borrow().get(path).map(|entry| entry.loaded_at)
    }
}

impl<A: Clone> Default for ModuleCache<A> {
    fn default() -> Self {
        Self::new()
    }
}
