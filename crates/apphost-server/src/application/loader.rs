//! Staged loading
//!
//! Phases run strictly one after another:
//!
//! 1. databases
//! 2. places, in fixed order (`tasks`, `init`, `resources`, `setup`,
//!    `schemas`, plus `www` and `static` on HTTP services)
//! 3. the `lib` tree, depth first
//! 4. the `api` tree, one directory per interface and one file per method
//!
//! Inside a phase every entry of a directory is started at once and the
//! phase ends when all of them have finished, failed ones included. A
//! directory that can't be read logs an error and contributes nothing.

use std::path::{Path, PathBuf};

use boa_engine::JsValue;
use futures::future::{join_all, FutureExt, LocalBoxFuture};

use super::{setup, Application, LifecycleEvent, TestCase};

const PLACES: &[&str] = &["tasks", "init", "resources", "setup", "schemas"];
const HTTP_PLACES: &[&str] = &["www", "static"];

enum Entry {
    File(PathBuf),
    Dir(PathBuf),
}

/// Entries of `dir`, or `None` when it can't be read.
async fn read_dir(dir: &Path) -> Option<Vec<Entry>> {
    let mut reader = match tokio::fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(_) => {
            tracing::error!("Can't read directory: {}", dir.display());
            return None;
        }
    };
    let mut entries = Vec::new();
    loop {
        match reader.next_entry().await {
            Ok(Some(entry)) => {
                let path = entry.path();
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_dir() => entries.push(Entry::Dir(path)),
                    Ok(_) => entries.push(Entry::File(path)),
                    Err(_) => tracing::error!("Can't read file: {}", path.display()),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::error!("Can't read directory {}: {}", dir.display(), e);
                break;
            }
        }
    }
    entries.sort_by(|a, b| entry_path(a).cmp(entry_path(b)));
    Some(entries)
}

fn entry_path(entry: &Entry) -> &Path {
    match entry {
        Entry::File(p) | Entry::Dir(p) => p,
    }
}

fn is_script(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "js")
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Application {
    /// Runs the whole pipeline and flips the ready flag.
    pub async fn start(&self) {
        self.emit(LifecycleEvent::Start);
        self.open_databases();
        self.load_places().await;
        self.load_lib(self.dir.join("lib")).await;
        self.load_api().await;
        if self.options.test_mode {
            self.load_integration_tests(self.dir.join("test")).await;
        }
        self.apply_script_requests();
        self.mark_ready();
        tracing::info!(app = %self.name, scripts = self.cache.len(), "Application started");
    }

    /// Loads `path` through the cache: a hit skips both the read and the
    /// compile. Failures are logged and yield `None`.
    pub async fn load_script(&self, path: &Path) -> Option<JsValue> {
        let key = self.relative(path);
        if let Some(entry) = self.cache.get(&key) {
            return Some(entry.export.clone());
        }
        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(_) => {
                tracing::error!(app = %self.name, "Can't read file: {}", path.display());
                return None;
            }
        };
        // another load of the same key may have finished while reading
        if let Some(entry) = self.cache.get(&key) {
            return Some(entry.export.clone());
        }
        let loaded = self.sandbox.borrow_mut().load_unit(&key, &source);
        self.apply_script_requests();
        match loaded {
            Ok(export) => {
                self.cache.insert(&key, export.clone());
                Some(export)
            }
            Err(e) => {
                self.log_exception(&e);
                None
            }
        }
    }

    fn open_databases(&self) {
        if let Err(e) = self
            .collaborators
            .databases
            .open(&self.name, &self.config.databases)
        {
            tracing::error!(app = %self.name, "Can't open databases: {}", e);
        }
    }

    fn places(&self) -> Vec<&'static str> {
        let mut places = PLACES.to_vec();
        if self.options.serves_http {
            places.extend_from_slice(HTTP_PLACES);
        }
        places
    }

    async fn load_places(&self) {
        for place in self.places() {
            match place {
                // static files are read on demand
                "static" => {}
                "schemas" => {
                    self.load_schemas().await;
                    self.emit(LifecycleEvent::Schema);
                }
                _ => self.load_place_scripts(place).await,
            }
        }
    }

    /// Hands the `schemas` place to the schema loader and merges what it
    /// creates into the schema document.
    async fn load_schemas(&self) {
        let dir = self.dir.join("schemas");
        if tokio::fs::metadata(&dir).await.is_err() {
            return;
        }
        self.watch_dir("/schemas");
        let schemas = self.collaborators.schemas.load_and_create(&dir, self).await;
        self.schemas.borrow_mut().extend(schemas);
    }

    async fn load_place_scripts(&self, place: &str) {
        let dir = self.dir.join(place);
        if tokio::fs::metadata(&dir).await.is_err() {
            return;
        }
        let Some(entries) = read_dir(&dir).await else {
            return;
        };
        if place != "setup" {
            self.watch_dir(&format!("/{}", place));
        }
        let loads = entries.into_iter().filter_map(|entry| match entry {
            Entry::File(path) if is_script(&path) => Some(self.process_place_file(place, path)),
            _ => None,
        });
        join_all(loads).await;
    }

    async fn process_place_file(&self, place: &str, path: PathBuf) {
        if place == "setup" {
            if self.options.worker_id != 1 {
                return;
            }
            if !setup::setup_script_changed(&path).await {
                return;
            }
        }
        self.load_place_file(place, &path).await;
    }

    async fn load_place_file(&self, place: &str, path: &Path) {
        let section = stem(path);
        let Some(export) = self.load_script(path).await else {
            return;
        };
        match place {
            "tasks" => self.collaborators.scheduler.set_task(&self.name, &section, &export),
            "setup" => {
                if let Err(e) = setup::write_done_marker(path).await {
                    tracing::error!(app = %self.name, "Can't write done marker for {}: {}", path.display(), e);
                }
            }
            _ => {}
        }
    }

    fn load_lib(&self, dir: PathBuf) -> LocalBoxFuture<'_, ()> {
        async move {
            let Some(entries) = read_dir(&dir).await else {
                return;
            };
            let loads = entries.into_iter().map(|entry| match entry {
                Entry::Dir(path) => self.load_lib(path),
                Entry::File(path) => self.load_lib_file(path).boxed_local(),
            });
            join_all(loads).await;
            self.watch_dir(&self.relative(&dir));
        }
        .boxed_local()
    }

    async fn load_lib_file(&self, path: PathBuf) {
        if !is_script(&path) {
            return;
        }
        let is_test = path.to_string_lossy().ends_with(".test.js");
        if is_test && !self.options.test_mode {
            return;
        }
        if let Some(test) = self.load_script(&path).await {
            if is_test {
                let path = self.relative(&path);
                self.tests.borrow_mut().unit.push(TestCase { path, test });
            }
        }
    }

    fn load_integration_tests(&self, dir: PathBuf) -> LocalBoxFuture<'_, ()> {
        async move {
            let Some(entries) = read_dir(&dir).await else {
                return;
            };
            let loads = entries.into_iter().map(|entry| match entry {
                Entry::Dir(path) => self.load_integration_tests(path),
                Entry::File(path) => async move {
                    if !is_script(&path) {
                        return;
                    }
                    if let Some(test) = self.load_script(&path).await {
                        let path = self.relative(&path);
                        self.tests.borrow_mut().integration.push(TestCase { path, test });
                    }
                }
                .boxed_local(),
            });
            join_all(loads).await;
        }
        .boxed_local()
    }

    async fn load_api(&self) {
        let dir = self.dir.join("api");
        let Some(entries) = read_dir(&dir).await else {
            return;
        };
        let loads = entries.into_iter().filter_map(|entry| match entry {
            Entry::Dir(path) => Some(self.load_api_interface(path)),
            Entry::File(_) => None,
        });
        join_all(loads).await;
        self.watch_dir("/api");
    }

    async fn load_api_interface(&self, dir: PathBuf) {
        let name = stem(&dir);
        self.api.borrow_mut().entry(name.clone()).or_default();
        let interface = &name;
        let Some(entries) = read_dir(&dir).await else {
            return;
        };
        let loads = entries.into_iter().filter_map(|entry| match entry {
            Entry::File(path) if is_script(&path) => Some(async move {
                let method = stem(&path);
                if let Some(export) = self.load_script(&path).await {
                    if let Some(methods) = self.api.borrow_mut().get_mut(interface) {
                        methods.insert(method, export);
                    }
                }
            }),
            _ => None,
        });
        join_all(loads).await;
        self.watch_dir(&format!("/api/{}", name));
    }
}
