// Loader pipeline tests
//
// Each test lays out an application tree in a temporary directory, runs the
// full pipeline and inspects the application's script cache.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use apphost_server::application::{AppOptions, Application, LifecycleEvent};
use apphost_server::collaborators::{Collaborators, SchemaLoader, TaskRegistry};
use apphost_server::watch::NullWatch;
use futures::future::{FutureExt, LocalBoxFuture};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn create_app(dir: &Path, options: AppOptions, collaborators: Collaborators) -> Rc<Application> {
    Application::new("shop", dir, options, collaborators, Rc::new(NullWatch)).unwrap()
}

fn sample_tree(root: &Path) {
    write(root, "tasks/cleanup.js", "{ interval: '1h', run: () => {} }");
    write(root, "init/boot.js", "global.booted = true;");
    write(root, "resources/texts.js", "{ hello: 'world' }");
    write(root, "setup/migrate.js", "global.migrated = true;");
    write(root, "schemas/user.js", "{ name: 'string', age: 'number' }");
    write(root, "lib/math.js", "global.math = { add: (a, b) => a + b };");
    write(root, "lib/util/strings.js", "global.strings = { upper: s => s.toUpperCase() };");
    write(root, "lib/util/strings.test.js", "test.strictEqual(strings.upper('a'), 'A');");
    write(root, "lib/readme.txt", "not a script");
    write(root, "api/math/add.js", "(a, b) => math.add(a, b);");
    write(root, "api/math/sub.js", "(a, b) => a - b;");
    write(root, "api/auth/signIn.js", "(login, password) => login;");
}

/// Records every call and creates one fixed schema.
#[derive(Default)]
struct RecordingSchemas {
    calls: RefCell<Vec<(String, PathBuf)>>,
}

impl SchemaLoader for RecordingSchemas {
    fn load_and_create<'a>(
        &'a self,
        dir: &'a Path,
        app: &'a Application,
    ) -> LocalBoxFuture<'a, Map<String, Value>> {
        self.calls
            .borrow_mut()
            .push((app.name().to_string(), dir.to_path_buf()));
        async move {
            let mut schemas = Map::new();
            schemas.insert("account".to_string(), json!({ "balance": "number" }));
            schemas
        }
        .boxed_local()
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_phases_load_in_order() {
    let dir = TempDir::new().unwrap();
    sample_tree(dir.path());
    let app = create_app(dir.path(), AppOptions::default(), Collaborators::default());

    let events = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&events);
    app.subscribe(move |_, event| seen.borrow_mut().push(event));

    assert!(!app.is_ready());
    app.start().await;
    assert!(app.is_ready());

    let order = app.cache().keys_by_seq();
    let max_seq = |prefixes: &[&str]| {
        order
            .iter()
            .filter(|(k, _)| prefixes.iter().any(|p| k.starts_with(p)))
            .map(|(_, s)| *s)
            .max()
            .unwrap()
    };
    let min_seq = |prefix: &str| {
        order
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, s)| *s)
            .min()
            .unwrap()
    };

    let places_done = max_seq(&["/tasks/", "/init/", "/resources/", "/setup/", "/schemas/"]);
    assert!(places_done < min_seq("/lib/"));
    assert!(max_seq(&["/lib/"]) < min_seq("/api/"));

    assert_eq!(
        *events.borrow(),
        vec![LifecycleEvent::Start, LifecycleEvent::Schema, LifecycleEvent::Started]
    );
}

#[tokio::test]
async fn test_pipeline_results() {
    let dir = TempDir::new().unwrap();
    sample_tree(dir.path());
    let tasks = Rc::new(TaskRegistry::default());
    let collaborators = Collaborators {
        scheduler: tasks.clone(),
        ..Collaborators::default()
    };
    let app = create_app(dir.path(), AppOptions::default(), collaborators);
    app.start().await;

    assert_eq!(tasks.tasks(), vec![("shop".to_string(), "cleanup".to_string())]);
    assert_eq!(app.schemas()["user"]["age"], "number");
    assert_eq!(app.interfaces(), vec!["auth".to_string(), "math".to_string()]);
    assert_eq!(app.methods("math"), Some(vec!["add".to_string(), "sub".to_string()]));
    assert_eq!(app.methods("billing"), None);

    // test files are skipped outside test mode
    assert!(!app.cache().contains("/lib/util/strings.test.js"));
    assert!(app.cache().contains("/lib/util/strings.js"));
    assert!(!app.cache().contains("/lib/readme.txt"));
}

#[tokio::test]
async fn test_schemas_go_through_schema_loader() {
    let dir = TempDir::new().unwrap();
    sample_tree(dir.path());
    let loader = Rc::new(RecordingSchemas::default());
    let collaborators = Collaborators {
        schemas: loader.clone(),
        ..Collaborators::default()
    };
    let app = create_app(dir.path(), AppOptions::default(), collaborators);
    let events = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&events);
    app.subscribe(move |_, event| seen.borrow_mut().push(event));
    app.start().await;

    assert_eq!(
        *loader.calls.borrow(),
        vec![("shop".to_string(), dir.path().join("schemas"))]
    );
    let schemas = app.schemas();
    assert_eq!(schemas["account"]["balance"], "number");
    // the loader owns the place, nothing else evaluates it
    assert!(!schemas.contains_key("user"));
    assert!(!app.cache().contains("/schemas/user.js"));
    assert!(events.borrow().contains(&LifecycleEvent::Schema));
}

#[tokio::test]
async fn test_schema_loader_not_called_without_schemas() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "lib/only.js", "1");
    let loader = Rc::new(RecordingSchemas::default());
    let collaborators = Collaborators {
        schemas: loader.clone(),
        ..Collaborators::default()
    };
    let app = create_app(dir.path(), AppOptions::default(), collaborators);
    app.start().await;
    assert!(loader.calls.borrow().is_empty());
    assert!(app.schemas().is_empty());
}

#[tokio::test]
async fn test_missing_directories_are_skipped() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "lib/only.js", "1");
    let app = create_app(dir.path(), AppOptions::default(), Collaborators::default());
    app.start().await;
    assert!(app.is_ready());
    assert_eq!(app.cache().len(), 1);
}

#[tokio::test]
async fn test_broken_script_does_not_stop_siblings() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "lib/a.js", "global.a = 1;");
    write(dir.path(), "lib/b.js", "this is not javascript (");
    write(dir.path(), "lib/c.js", "global.c = 3;");
    let app = create_app(dir.path(), AppOptions::default(), Collaborators::default());
    app.start().await;
    assert!(app.is_ready());
    assert!(app.cache().contains("/lib/a.js"));
    assert!(!app.cache().contains("/lib/b.js"));
    assert!(app.cache().contains("/lib/c.js"));
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_cached_script_skips_disk() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "lib/a.js", "({ n: 1 })");
    let app = create_app(dir.path(), AppOptions::default(), Collaborators::default());
    app.start().await;

    let path = dir.path().join("lib/a.js");
    let first = app.cache().get("/lib/a.js").unwrap();
    fs::remove_file(&path).unwrap();
    assert!(app.load_script(&path).await.is_some());
    let second = app.cache().get("/lib/a.js").unwrap();
    assert!(Rc::ptr_eq(&first, &second));

    app.invalidate("/lib");
    assert!(app.load_script(&path).await.is_none());
}

// ============================================================================
// Setup scripts
// ============================================================================

#[tokio::test]
async fn test_setup_runs_once_per_change() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "setup/migrate.js", "global.migrated = true;");
    let marker = dir.path().join("setup/migrate.done");

    let app = create_app(dir.path(), AppOptions::default(), Collaborators::default());
    app.start().await;
    assert!(app.cache().contains("/setup/migrate.js"));
    assert!(marker.exists());

    // marker newer than the script
    let app = create_app(dir.path(), AppOptions::default(), Collaborators::default());
    app.start().await;
    assert!(!app.cache().contains("/setup/migrate.js"));

    // script changed after the marker
    fs::write(&marker, "2001-01-01T00:00:00.000Z").unwrap();
    let app = create_app(dir.path(), AppOptions::default(), Collaborators::default());
    app.start().await;
    assert!(app.cache().contains("/setup/migrate.js"));
    let rewritten = fs::read_to_string(&marker).unwrap();
    assert!(!rewritten.starts_with("2001"));

    let app = create_app(dir.path(), AppOptions::default(), Collaborators::default());
    app.start().await;
    assert!(!app.cache().contains("/setup/migrate.js"));
}

#[tokio::test]
async fn test_setup_only_on_first_worker() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "setup/migrate.js", "global.migrated = true;");
    let options = AppOptions {
        worker_id: 2,
        ..AppOptions::default()
    };
    let app = create_app(dir.path(), options, Collaborators::default());
    app.start().await;
    assert!(!app.cache().contains("/setup/migrate.js"));
    assert!(!dir.path().join("setup/migrate.done").exists());
}

// ============================================================================
// Test mode
// ============================================================================

#[tokio::test]
async fn test_tests_collected_and_run_in_test_mode() {
    let dir = TempDir::new().unwrap();
    sample_tree(dir.path());
    write(dir.path(), "test/api/math.js", "test.strictEqual(math.add(1, 2), 4, 'add');");
    let options = AppOptions {
        test_mode: true,
        ..AppOptions::default()
    };
    let app = create_app(dir.path(), options, Collaborators::default());
    app.start().await;

    let results = app.run_tests();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, "/lib/util/strings.test.js");
    assert!(results[0].1.is_empty());
    assert_eq!(results[1].0, "/test/api/math.js");
    assert_eq!(results[1].1, vec!["add".to_string()]);
}
