//! Hosted applications
//!
//! An `Application` is one directory under `applications/` together with its
//! configuration, its own sandbox and its own script cache. It is created
//! once per worker process, loaded by the staged pipeline in [`loader`], and
//! becomes ready exactly once.

mod assets;
mod loader;
mod setup;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use apphost_common::config::{AppSections, SandboxSection};
use boa_engine::JsValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cache::{FileState, ScriptCache};
use crate::collaborators::Collaborators;
use crate::error::LoadError;
use crate::runtime::conversions::js_value_to_json;
use crate::runtime::{HandlerOutput, Sandbox};
use crate::watch::CacheWatch;

pub use assets::is_compressed_ext;
pub use setup::{done_marker_path, setup_script_changed, write_done_marker};

/// Default threshold for the slow-request log.
pub const DEFAULT_SLOW_TIME: Duration = Duration::from_secs(2);

/// Interval between two checks of a handler that has not answered yet.
const HANDLER_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Process facts an application needs while loading.
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// 0 for the master, 1.. for workers
    pub worker_id: u32,
    pub node_id: String,
    /// `scale.server`
    pub server_id: String,
    /// `scale.instance`
    pub instance: String,
    /// Enables the `www` and `static` places
    pub serves_http: bool,
    /// Collects unit and integration tests while loading
    pub test_mode: bool,
    /// Server-wide sandbox section, used when the application has none
    pub default_sandbox: Option<SandboxSection>,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            worker_id: 1,
            node_id: "S1N1".to_string(),
            server_id: "S1".to_string(),
            instance: "server".to_string(),
            serves_http: true,
            test_mode: false,
            default_sandbox: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Sandbox and configuration are in place; loading begins
    Start,
    /// Schemas have been loaded
    Schema,
    /// Every pipeline phase completed; the application is ready
    Started,
    Stop,
}

type Observer = Box<dyn Fn(&str, LifecycleEvent)>;

/// Session fields a long worker may see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub token: Option<String>,
    pub login: Option<String>,
    pub data: JsonValue,
    pub access: JsonValue,
}

/// The part of a request a long worker runs against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub url: String,
    pub query: JsonValue,
    pub context: JsonValue,
    pub fields: JsonValue,
    pub session: Option<SessionSnapshot>,
}

impl ClientSnapshot {
    /// Projects a request object as seen by script code. Only `token`,
    /// `login`, `data` and `access` are kept from the session.
    pub fn from_client(client: &JsonValue) -> Self {
        let field = |name: &str| client.get(name).cloned().unwrap_or(JsonValue::Null);
        let session = client
            .get("session")
            .filter(|s| s.is_object())
            .map(|s| SessionSnapshot {
                token: s.get("token").and_then(|v| v.as_str()).map(str::to_string),
                login: s.get("login").and_then(|v| v.as_str()).map(str::to_string),
                data: s.get("data").cloned().unwrap_or(JsonValue::Null),
                access: s.get("access").cloned().unwrap_or(JsonValue::Null),
            });
        Self {
            url: client
                .get("url")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            query: field("query"),
            context: field("context"),
            fields: field("fields"),
            session,
        }
    }
}

/// A loaded test: its key and the function taking the assertion object.
#[derive(Clone)]
pub struct TestCase {
    pub path: String,
    pub test: JsValue,
}

#[derive(Default)]
struct Tests {
    unit: Vec<TestCase>,
    integration: Vec<TestCase>,
}

pub struct Application {
    name: String,
    dir: PathBuf,
    options: AppOptions,
    config: AppSections,
    sandbox: RefCell<Sandbox>,
    cache: ScriptCache<JsValue>,
    ready: Cell<bool>,
    collaborators: Collaborators,
    watch: Rc<dyn CacheWatch>,
    observers: RefCell<Vec<Observer>>,
    /// interface name -> method name -> connection handler factory
    api: RefCell<BTreeMap<String, BTreeMap<String, JsValue>>>,
    schemas: RefCell<serde_json::Map<String, JsonValue>>,
    tests: RefCell<Tests>,
}

impl Application {
    /// Reads `<dir>/config` and builds the sandbox. Nothing is loaded yet;
    /// see [`Application::start`].
    pub fn new(
        name: &str,
        dir: &Path,
        options: AppOptions,
        collaborators: Collaborators,
        watch: Rc<dyn CacheWatch>,
    ) -> Result<Rc<Self>, LoadError> {
        let config = AppSections::load(dir)?;
        let sandbox_config = config.sandbox.as_ref().or(options.default_sandbox.as_ref());
        let sandbox = Sandbox::build(name, dir, sandbox_config)?;

        Ok(Rc::new(Self {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            options,
            config,
            sandbox: RefCell::new(sandbox),
            cache: ScriptCache::new(),
            ready: Cell::new(false),
            collaborators,
            watch,
            observers: RefCell::new(Vec::new()),
            api: RefCell::new(BTreeMap::new()),
            schemas: RefCell::new(serde_json::Map::new()),
            tests: RefCell::new(Tests::default()),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn options(&self) -> &AppOptions {
        &self.options
    }

    pub fn config(&self) -> &AppSections {
        &self.config
    }

    pub fn hosts(&self) -> &[String] {
        &self.config.hosts
    }

    pub fn cache(&self) -> &ScriptCache<JsValue> {
        &self.cache
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get()
    }

    /// Threshold above which a request also goes to the slow log.
    pub fn slow_time(&self) -> Duration {
        self.config.application.slow_time.unwrap_or(DEFAULT_SLOW_TIME)
    }

    /// Registers an observer for lifecycle events.
    pub fn subscribe(&self, observer: impl Fn(&str, LifecycleEvent) + 'static) {
        self.observers.borrow_mut().push(Box::new(observer));
    }

    fn emit(&self, event: LifecycleEvent) {
        tracing::debug!(app = %self.name, ?event, "Lifecycle event");
        for observer in self.observers.borrow().iter() {
            observer(&self.name, event);
        }
    }

    fn mark_ready(&self) {
        if !self.ready.replace(true) {
            self.emit(LifecycleEvent::Started);
        }
    }

    /// Application-relative key of an absolute path inside the application.
    pub fn relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.dir) {
            Ok(rel) => {
                let mut key = String::new();
                for part in rel.components() {
                    key.push('/');
                    key.push_str(&part.as_os_str().to_string_lossy());
                }
                key
            }
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    /// Registers a watch on the application-relative directory `dir`.
    pub fn watch_dir(&self, dir: &str) {
        if self.cache.watch(dir) {
            let abs = self.dir.join(dir.trim_start_matches('/'));
            self.watch.watch(&abs);
        }
    }

    /// Drops cached entries under `dir` after a change on disk.
    pub fn invalidate(&self, dir: &str) {
        let dropped = self.cache.invalidate(dir);
        tracing::debug!(app = %self.name, dir = %dir, dropped, "Cache invalidated");
    }

    /// Logs a script failure with its stack shortened to the application.
    pub fn log_exception(&self, err: &LoadError) {
        let root = self.dir.to_string_lossy();
        let message = err.to_string().replace(root.as_ref(), "");
        tracing::error!(target: "app", app = %self.name, "{}", message);
    }

    /// Registers `handler` for `method path` exactly as if it had been loaded
    /// from `www/<path>/<method>.js`.
    pub fn handler(&self, method: &str, path: &str, handler: JsValue) {
        let Some(dir_key) = route_dir_key(path) else {
            tracing::warn!(app = %self.name, "Invalid route path: {}", path);
            return;
        };
        let file_key = format!("{}{}.js", dir_key, method.to_ascii_lowercase());
        self.cache.insert(&file_key, handler);
        self.cache.set_file(&file_key, FileState::Exists);
        self.cache.set_folder(&dir_key, FileState::Exists);
    }

    pub fn get(&self, path: &str, handler: JsValue) {
        self.handler("get", path, handler);
    }

    pub fn post(&self, path: &str, handler: JsValue) {
        self.handler("post", path, handler);
    }

    pub fn put(&self, path: &str, handler: JsValue) {
        self.handler("put", path, handler);
    }

    pub fn delete(&self, path: &str, handler: JsValue) {
        self.handler("delete", path, handler);
    }

    /// Hands `client` to a long worker running `<pathDir><file>.js`.
    pub fn start_worker(&self, client: &JsonValue, file: &str) {
        let file_name = format!("{}{}.js", path_dir(client), file);
        let snapshot = ClientSnapshot::from_client(client);
        match serde_json::to_value(&snapshot) {
            Ok(snapshot) => self.collaborators.launcher.start(&self.name, &file_name, &snapshot),
            Err(e) => tracing::error!(app = %self.name, "Can't serialize client: {}", e),
        }
    }

    /// Stops the long worker started for the same `pathDir` and `file`.
    pub fn stop_worker(&self, client: &JsonValue, file: &str) {
        let file_name = format!("{}/{}.js", path_dir(client).trim_end_matches('/'), file);
        self.collaborators.launcher.stop(&self.name, &file_name);
    }

    /// Applies route registrations and long-worker requests made by scripts.
    pub fn apply_script_requests(&self) {
        let drained = match self.sandbox.borrow_mut().drain() {
            Ok(drained) => drained,
            Err(e) => {
                self.log_exception(&e);
                return;
            }
        };
        for route in drained.routes {
            self.handler(&route.method, &route.path, route.handler);
        }
        for offload in drained.offloads {
            if offload.start {
                self.start_worker(&offload.client, &offload.file);
            } else {
                self.stop_worker(&offload.client, &offload.file);
            }
        }
    }

    /// Fires due timers. Returns the number of timers still pending.
    pub fn tick(&self) -> usize {
        let result = self.sandbox.borrow_mut().run_timers();
        self.apply_script_requests();
        match result {
            Ok(left) => left,
            Err(e) => {
                self.log_exception(&e);
                0
            }
        }
    }

    /// Calls `handler(client, callback)` and waits until it answers.
    pub async fn invoke(
        &self,
        key: &str,
        handler: &JsValue,
        client: &JsonValue,
    ) -> Result<HandlerOutput, LoadError> {
        let call = self
            .sandbox
            .borrow_mut()
            .invoke_handler(key, handler, client);
        self.apply_script_requests();
        let call = call?;
        loop {
            let polled = self.sandbox.borrow_mut().poll_handler(&call);
            if let Some(output) = polled? {
                self.apply_script_requests();
                return Ok(output);
            }
            self.tick();
            tokio::time::sleep(HANDLER_POLL_INTERVAL).await;
        }
    }

    /// Resolves `METHOD /a/b` to the handler at `/www/a/b/<method>.js`,
    /// loading it from disk on a cache miss.
    ///
    /// # Arguments
    ///
    /// * `method` - HTTP method, matched case-insensitively
    /// * `path` - URL path without query; `.` and `..` segments never resolve
    ///
    /// # Returns
    ///
    /// The cache key and the handler export, or `None` when no handler file
    /// exists for the path
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn example(app: &apphost_server::Application) {
    /// if let Some((key, _handler)) = app.route("GET", "/cart/items").await {
    ///     assert_eq!(key, "/www/cart/items/get.js");
    /// }
    /// # }
    /// ```
    pub async fn route(&self, method: &str, path: &str) -> Option<(String, JsValue)> {
        let key = format!("{}{}.js", route_dir_key(path)?, method.to_ascii_lowercase());
        if let Some(entry) = self.cache.get(&key) {
            return Some((key, entry.export.clone()));
        }
        if self.cache.file(&key) == Some(FileState::Missing) {
            return None;
        }
        let file = self.dir.join(key.trim_start_matches('/'));
        match tokio::fs::metadata(&file).await {
            Ok(meta) if meta.is_file() => {
                self.cache.set_file(&key, FileState::Exists);
                let parent = key.rsplit_once('/').map_or("/", |(dir, _)| dir);
                self.watch_dir(parent);
                let export = self.load_script(&file).await?;
                Some((key, export))
            }
            _ => {
                self.cache.set_file(&key, FileState::Missing);
                None
            }
        }
    }

    /// Loads one application file and runs it once as a request handler.
    /// Used by long workers, whose whole job is this one script.
    pub async fn run_script(&self, file: &str, client: &JsonValue) -> Result<HandlerOutput, LoadError> {
        let path = self.dir.join(file.trim_start_matches('/'));
        let key = self.relative(&path);
        let export = self
            .load_script(&path)
            .await
            .ok_or_else(|| LoadError::Execution {
                key: key.clone(),
                message: "script has no export".to_string(),
            })?;
        self.invoke(&key, &export, client).await
    }

    /// Method names of an API interface, `None` for unknown interfaces.
    pub fn methods(&self, interface: &str) -> Option<Vec<String>> {
        self.api
            .borrow()
            .get(interface)
            .map(|methods| methods.keys().cloned().collect())
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.api.borrow().keys().cloned().collect()
    }

    /// Schema document merged from the `schemas` place.
    pub fn schemas(&self) -> serde_json::Map<String, JsonValue> {
        self.schemas.borrow().clone()
    }

    /// Runs collected unit and integration tests. Returns `(key, failures)`
    /// for every test, in load order.
    pub fn run_tests(&self) -> Vec<(String, Vec<String>)> {
        let cases: Vec<TestCase> = {
            let tests = self.tests.borrow();
            tests.unit.iter().chain(tests.integration.iter()).cloned().collect()
        };
        let mut results = Vec::with_capacity(cases.len());
        for case in cases {
            let failures = match self.sandbox.borrow_mut().run_test(&case.path, &case.test) {
                Ok(failures) => failures,
                Err(e) => vec![e.to_string()],
            };
            results.push((case.path, failures));
        }
        results
    }

    /// Exported global `name` as a value, if this application exports it.
    pub fn export_value(&self, name: &str) -> Option<JsonValue> {
        let exported = self
            .config
            .sandbox
            .as_ref()
            .is_some_and(|s| s.export.iter().any(|e| e == name));
        if !exported {
            return None;
        }
        match self.sandbox.borrow_mut().global_to_json(name) {
            Ok(value) => value,
            Err(e) => {
                self.log_exception(&e);
                None
            }
        }
    }

    /// JSON form of a value produced in this application's sandbox.
    pub fn export_json(&self, value: &JsValue) -> Result<JsonValue, String> {
        let mut sandbox = self.sandbox.borrow_mut();
        js_value_to_json(value, sandbox.context()).map_err(|e| e.to_string())
    }

    /// Stores an imported value at a dotted path of the global object.
    pub fn import_value(&self, path: &str, value: &JsonValue) {
        if let Err(e) = self.sandbox.borrow_mut().set_by_path(path, value) {
            self.log_exception(&e);
        }
    }

    /// Stops tasks and drops cached scripts. The application stays ready;
    /// a restart creates a new instance.
    pub fn stop(&self) {
        self.emit(LifecycleEvent::Stop);
        self.collaborators.scheduler.stop_tasks(&self.name);
        self.cache.clear();
    }
}

/// `/www/<path>/` with exactly one slash between segments.
///
/// `None` for paths with a `.` or `..` segment, percent-encoded or not, or a
/// backslash. Such paths never resolve to a handler.
pub fn route_dir_key(path: &str) -> Option<String> {
    let mut key = String::from("/www/");
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if is_dot_segment(segment) || segment.contains('\\') {
            return None;
        }
        key.push_str(segment);
        key.push('/');
    }
    Some(key)
}

/// `.` or `..`, also when written with `%2e`.
pub(crate) fn is_dot_segment(segment: &str) -> bool {
    let decoded = segment.replace("%2e", ".").replace("%2E", ".");
    decoded == "." || decoded == ".."
}

fn path_dir(client: &JsonValue) -> String {
    client
        .get("pathDir")
        .and_then(|v| v.as_str())
        .unwrap_or("/")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_dir_key() {
        assert_eq!(route_dir_key("/").as_deref(), Some("/www/"));
        assert_eq!(route_dir_key("").as_deref(), Some("/www/"));
        assert_eq!(route_dir_key("/cart").as_deref(), Some("/www/cart/"));
        assert_eq!(route_dir_key("cart/items/").as_deref(), Some("/www/cart/items/"));
        assert_eq!(route_dir_key("/cart//items").as_deref(), Some("/www/cart/items/"));
    }

    #[test]
    fn test_route_dir_key_rejects_dot_segments() {
        assert_eq!(route_dir_key("/../../billing/www"), None);
        assert_eq!(route_dir_key("/../lib"), None);
        assert_eq!(route_dir_key("/cart/./items"), None);
        assert_eq!(route_dir_key("/%2e%2e/lib"), None);
        assert_eq!(route_dir_key("/.%2E/lib"), None);
        assert_eq!(route_dir_key("/cart\\..\\lib"), None);
        assert_eq!(route_dir_key("/cart/..items").as_deref(), Some("/www/cart/..items/"));
    }

    #[test]
    fn test_snapshot_keeps_only_session_projection() {
        let client = json!({
            "url": "/cart?id=3",
            "query": {"id": "3"},
            "context": {"path": "/cart"},
            "fields": {"count": 2},
            "headers": {"cookie": "secret"},
            "session": {
                "token": "abc",
                "login": "marcus",
                "data": {"cart": [1]},
                "access": {"admin": false},
                "password": "hunter2"
            }
        });
        let snapshot = ClientSnapshot::from_client(&client);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["url"], "/cart?id=3");
        assert_eq!(json["fields"]["count"], 2);
        assert_eq!(json["session"]["login"], "marcus");
        assert!(json["session"].get("password").is_none());
        assert!(json.get("headers").is_none());
    }

    #[test]
    fn test_snapshot_without_session() {
        let snapshot = ClientSnapshot::from_client(&json!({"url": "/"}));
        assert_eq!(snapshot.session, None);
        assert_eq!(snapshot.fields, JsonValue::Null);
    }
}
