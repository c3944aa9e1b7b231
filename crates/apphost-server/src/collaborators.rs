//! Services an application uses but does not implement
//!
//! The scheduler, database layer, schema loader and long-worker launcher live
//! outside this crate. Applications reach them through the traits below so a worker can
//! plug in real implementations and tests can record calls.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use boa_engine::JsValue;
use futures::future::{join_all, FutureExt, LocalBoxFuture};
use serde_json::{Map, Value as JsonValue};

use crate::application::Application;

/// Task registration interface of the scheduler.
pub trait Scheduler {
    /// Registers the export of `tasks/<name>.js`.
    fn set_task(&self, app: &str, name: &str, task: &JsValue);
    fn stop_tasks(&self, app: &str);
}

/// Keeps registered task names; execution semantics belong to a real scheduler.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RefCell<Vec<(String, String)>>,
}

impl TaskRegistry {
    /// `(app, task)` pairs in registration order.
    pub fn tasks(&self) -> Vec<(String, String)> {
        self.tasks.borrow().clone()
    }
}

impl Scheduler for TaskRegistry {
    fn set_task(&self, app: &str, name: &str, _task: &JsValue) {
        tracing::debug!(app = %app, task = %name, "Task registered");
        self.tasks
            .borrow_mut()
            .push((app.to_string(), name.to_string()));
    }

    fn stop_tasks(&self, app: &str) {
        self.tasks.borrow_mut().retain(|(a, _)| a != app);
    }
}

/// Opens the databases configured for an application.
pub trait DatabaseOpener {
    /// `databases` is the application's `databases` section.
    fn open(&self, app: &str, databases: &toml::Table) -> Result<(), String>;
}

/// Accepts any configuration and opens nothing.
#[derive(Debug, Default)]
pub struct NoDatabases;

impl DatabaseOpener for NoDatabases {
    fn open(&self, app: &str, databases: &toml::Table) -> Result<(), String> {
        for name in databases.keys() {
            tracing::debug!(app = %app, database = %name, "No database driver, skipping");
        }
        Ok(())
    }
}

/// Turns the `schemas` place of an application into its schema document.
pub trait SchemaLoader {
    /// Loads the definitions in `dir` inside the sandbox of `app` and
    /// returns the schemas by name. Failures are logged by the loader and
    /// leave the failed schema out.
    fn load_and_create<'a>(
        &'a self,
        dir: &'a Path,
        app: &'a Application,
    ) -> LocalBoxFuture<'a, Map<String, JsonValue>>;
}

/// Evaluates every `schemas/<name>.js` and keeps its value under `name`.
#[derive(Debug, Default)]
pub struct ScriptSchemas;

impl SchemaLoader for ScriptSchemas {
    fn load_and_create<'a>(
        &'a self,
        dir: &'a Path,
        app: &'a Application,
    ) -> LocalBoxFuture<'a, Map<String, JsonValue>> {
        async move {
            let mut files: Vec<PathBuf> = Vec::new();
            match tokio::fs::read_dir(dir).await {
                Ok(mut reader) => {
                    while let Ok(Some(entry)) = reader.next_entry().await {
                        let path = entry.path();
                        if path.extension().is_some_and(|ext| ext == "js") {
                            files.push(path);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(app = %app.name(), "Can't read directory {}: {}", dir.display(), e);
                    return Map::new();
                }
            }
            files.sort();

            let loads = files
                .iter()
                .map(|path| async move { (path, app.load_script(path).await) });
            let mut schemas = Map::new();
            for (path, export) in join_all(loads).await {
                let Some(export) = export else {
                    continue;
                };
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                match app.export_json(&export) {
                    Ok(value) => {
                        schemas.insert(name, value);
                    }
                    Err(e) => tracing::error!(app = %app.name(), schema = %name, "Invalid schema: {}", e),
                }
            }
            schemas
        }
        .boxed_local()
    }
}

/// Starts and stops long workers on behalf of applications.
pub trait WorkerLauncher {
    /// `file` is the application-relative script the long worker runs and
    /// `client` the serialized request snapshot it runs against.
    fn start(&self, app: &str, file: &str, client: &JsonValue);
    fn stop(&self, app: &str, file: &str);
}

/// Launcher for processes that cannot offload (long workers themselves).
#[derive(Debug, Default)]
pub struct NoLauncher;

impl WorkerLauncher for NoLauncher {
    fn start(&self, app: &str, file: &str, _client: &JsonValue) {
        tracing::warn!(app = %app, file = %file, "Long workers are not available in this process");
    }

    fn stop(&self, _app: &str, _file: &str) {}
}

/// Everything an application is wired to.
#[derive(Clone)]
pub struct Collaborators {
    pub scheduler: Rc<dyn Scheduler>,
    pub databases: Rc<dyn DatabaseOpener>,
    pub schemas: Rc<dyn SchemaLoader>,
    pub launcher: Rc<dyn WorkerLauncher>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            scheduler: Rc::new(TaskRegistry::default()),
            databases: Rc::new(NoDatabases),
            schemas: Rc::new(ScriptSchemas),
            launcher: Rc::new(NoLauncher),
        }
    }
}
