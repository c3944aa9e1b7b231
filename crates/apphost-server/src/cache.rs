//! Per-application memoizing script cache
//!
//! Keys are paths relative to the application root with a leading slash
//! (`/lib/math.js`, `/www/cart/get.js`). Entries are never tracked by
//! dependency; they are dropped in bulk by directory prefix when a watched
//! directory changes, or all at once under memory pressure and on stop.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::SystemTime;

use bytes::Bytes;

/// A compiled export together with the order in which it was compiled.
#[derive(Debug)]
pub struct CachedScript<E> {
    pub export: E,
    /// Monotonic per-cache compile counter
    pub seq: u64,
}

/// Existence marker for routes, so lookups can skip the disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Exists,
    Missing,
}

/// Static file bytes ready to be sent.
#[derive(Debug, Clone)]
pub struct StaticEntry {
    pub data: Bytes,
    /// `data` holds a gzip stream
    pub compressed: bool,
    /// Size of the file on disk
    pub size: u64,
    pub modified: Option<SystemTime>,
}

pub struct ScriptCache<E> {
    scripts: RefCell<HashMap<String, Rc<CachedScript<E>>>>,
    files: RefCell<HashMap<String, FileState>>,
    folders: RefCell<HashMap<String, FileState>>,
    statics: RefCell<HashMap<String, Rc<StaticEntry>>>,
    watched: RefCell<BTreeSet<String>>,
    next_seq: Cell<u64>,
}

impl<E> Default for ScriptCache<E> {
    fn default() -> Self {
        Self {
            scripts: RefCell::new(HashMap::new()),
            files: RefCell::new(HashMap::new()),
            folders: RefCell::new(HashMap::new()),
            statics: RefCell::new(HashMap::new()),
            watched: RefCell::new(BTreeSet::new()),
            next_seq: Cell::new(0),
        }
    }
}

impl<E> ScriptCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Rc<CachedScript<E>>> {
        self.scripts.borrow().get(key).cloned()
    }

    /// Stores `export` under `key`, replacing any previous entry.
    pub fn insert(&self, key: &str, export: E) -> Rc<CachedScript<E>> {
        let seq = self.next_seq.get() + 1;
        self.next_seq.set(seq);
        let entry = Rc::new(CachedScript { export, seq });
        self.scripts
            .borrow_mut()
            .insert(key.to_string(), Rc::clone(&entry));
        entry
    }

    pub fn contains(&self, key: &str) -> bool {
        self.scripts.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.scripts.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.borrow().is_empty()
    }

    /// Keys in compile order.
    pub fn keys_by_seq(&self) -> Vec<(String, u64)> {
        let mut keys: Vec<_> = self
            .scripts
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.seq))
            .collect();
        keys.sort_by_key(|(_, seq)| *seq);
        keys
    }

    pub fn set_file(&self, key: &str, state: FileState) {
        self.files.borrow_mut().insert(key.to_string(), state);
    }

    pub fn file(&self, key: &str) -> Option<FileState> {
        self.files.borrow().get(key).copied()
    }

    pub fn set_folder(&self, key: &str, state: FileState) {
        self.folders.borrow_mut().insert(key.to_string(), state);
    }

    pub fn folder(&self, key: &str) -> Option<FileState> {
        self.folders.borrow().get(key).copied()
    }

    pub fn add_static(&self, key: &str, entry: StaticEntry) -> Rc<StaticEntry> {
        let entry = Rc::new(entry);
        self.statics
            .borrow_mut()
            .insert(key.to_string(), Rc::clone(&entry));
        entry
    }

    pub fn get_static(&self, key: &str) -> Option<Rc<StaticEntry>> {
        self.statics.borrow().get(key).cloned()
    }

    /// Registers a watch on `dir`. Returns `true` the first time a directory
    /// is seen, which is when the caller should subscribe to notifications.
    pub fn watch(&self, dir: &str) -> bool {
        self.watched.borrow_mut().insert(normalize_dir(dir))
    }

    pub fn watched(&self) -> Vec<String> {
        self.watched.borrow().iter().cloned().collect()
    }

    /// Drops every entry whose key is `dir` or lies below it. An empty or
    /// root directory clears everything. Returns the number of scripts dropped.
    pub fn invalidate(&self, dir: &str) -> usize {
        let dir = normalize_dir(dir);
        if dir.is_empty() {
            let count = self.len();
            self.clear();
            return count;
        }
        let prefix = format!("{}/", dir);
        let inside = |key: &str| key == dir || key.starts_with(&prefix);

        let before = self.len();
        self.scripts.borrow_mut().retain(|k, _| !inside(k));
        self.files.borrow_mut().retain(|k, _| !inside(k));
        self.folders.borrow_mut().retain(|k, _| !inside(k));
        self.statics.borrow_mut().retain(|k, _| !inside(k));
        before - self.len()
    }

    /// Drops every cached script, marker and static entry. Watches stay registered.
    pub fn clear(&self) {
        self.scripts.borrow_mut().clear();
        self.files.borrow_mut().clear();
        self.folders.borrow_mut().clear();
        self.statics.borrow_mut().clear();
    }
}

/// `/www/cart/`, `www/cart` and `/www/cart` are the same directory; `/` is the root.
fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}
