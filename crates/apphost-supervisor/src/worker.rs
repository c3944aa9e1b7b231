//! Worker runner
//!
//! A worker hosts every configured application behind one listening
//! service. Startup order:
//!
//! 1. construct applications (config + sandbox, nothing loaded)
//! 2. bind the listener; a bind failure is reported to the master
//! 3. run every application's loader pipeline concurrently
//! 4. warn about overlapping host patterns, link namespaces
//! 5. acknowledge the start to the master
//!
//! After that the worker ticks application timers, turns watch events into
//! cache invalidations and applies relayed long-worker announcements.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use apphost_common::{IpcMessage, Service};
use apphost_server::dispatcher::overlapping_hosts;
use apphost_server::watch::{relative_dir, CacheWatch, NotifyWatch, NullWatch};
use apphost_server::{Application, Collaborators, Dispatcher, HttpServer, ListenerOptions};
use futures::future::join_all;
use tokio::io::BufReader;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{read_messages, MessageSink};
use crate::context::ServerContext;
use crate::error::{Result, SupervisorError};
use crate::long_worker::{LongWorkerPool, ProcessSpawner};

/// Interval of the timer loop.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Applications and long-worker pool of one hosted service.
pub struct HostedService {
    pub applications: Vec<Rc<Application>>,
    pub pool: Rc<LongWorkerPool>,
    pub dispatcher: Rc<Dispatcher>,
}

/// Discards messages. The master has no parent channel.
struct NoParent;

impl MessageSink for NoParent {
    fn send(&self, _message: &IpcMessage) {}
}

/// Names of the applications a service hosts: its configured list, or every
/// directory under `applications/` in name order.
pub fn application_names(service: &Service, applications_dir: &Path) -> Result<Vec<String>> {
    if let Some(names) = &service.config.applications {
        return Ok(names.clone());
    }
    let entries = std::fs::read_dir(applications_dir).map_err(|source| SupervisorError::ReadDir {
        path: applications_dir.display().to_string(),
        source,
    })?;
    let mut names: Vec<String> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

/// Logs a warning for every pair of host patterns that can match the same
/// host across applications.
pub fn compare_hosts(applications: &[Rc<Application>]) -> usize {
    let overlaps = overlapping_hosts(applications.iter().map(|app| app.hosts()));
    for (first, second) in &overlaps {
        tracing::warn!("Hosts mask overlapping: \"{}\" and \"{}\"", first, second);
    }
    overlaps.len()
}

/// Copies exported globals into importing applications.
///
/// `sandbox.import = { <app> = { <name> = "<local.path>" } }` takes global
/// `name` of `app` (which must list it in `sandbox.export`) and stores a copy
/// at `local.path` of the importer. Returns the number of copied values.
pub fn link_namespaces(applications: &[Rc<Application>]) -> usize {
    let mut linked = 0;
    for importer in applications {
        let Some(sandbox) = importer.config().sandbox.as_ref() else {
            continue;
        };
        for (source_name, names) in &sandbox.import {
            let Some(source) = applications.iter().find(|app| app.name() == source_name) else {
                tracing::warn!(app = %importer.name(), "Application {} is not found", source_name);
                continue;
            };
            for (name, path) in names {
                match source.export_value(name) {
                    Some(value) => {
                        importer.import_value(path, &value);
                        linked += 1;
                    }
                    None => tracing::warn!(
                        app = %importer.name(),
                        "Application {} does not export {}",
                        source_name,
                        name
                    ),
                }
            }
        }
    }
    linked
}

/// Constructs, binds and starts the applications of `service`.
///
/// # Arguments
///
/// * `ctx` - The process context; started applications are added to it
/// * `service` - The service to listen on and host applications for
///
/// # Returns
///
/// The started applications with their dispatcher and long-worker pool
///
/// # Errors
///
/// A listener that can't bind yields [`apphost_common::HostError::Bind`];
/// on a worker the master is told before the error is returned.
///
/// # Example
///
/// ```no_run
/// use std::rc::Rc;
///
/// use apphost_supervisor::worker::host_service;
/// use apphost_supervisor::ServerContext;
///
/// # async fn example(ctx: Rc<ServerContext>) -> apphost_supervisor::Result<()> {
/// if let Some(service) = ctx.own_service().cloned() {
///     let hosted = host_service(&ctx, &service).await?;
///     println!("{} applications", hosted.applications.len());
/// }
/// # Ok(())
/// # }
/// ```
pub async fn host_service(ctx: &Rc<ServerContext>, service: &Service) -> Result<HostedService> {
    let serves_http = service.config.protocol == "http";
    let parent: Rc<dyn MessageSink> = match ctx.parent() {
        Some(parent) => Rc::clone(parent),
        None => Rc::new(NoParent),
    };

    let (watch, changes): (Rc<dyn CacheWatch>, Option<UnboundedReceiver<PathBuf>>) = match NotifyWatch::new() {
        Ok((watch, changes)) => (Rc::new(watch), Some(changes)),
        Err(e) => {
            tracing::warn!("File watching is not available: {}", e);
            (Rc::new(NullWatch), None)
        }
    };

    let pool = LongWorkerPool::new(
        Rc::new(ProcessSpawner {
            root: ctx.root.clone(),
            worker_id: ctx.env.worker_id,
            server_name: ctx.env.server_name.clone(),
            mode: ctx.env.mode.clone(),
        }),
        Rc::clone(&parent),
        Rc::clone(&ctx.stats),
        &ctx.node_id,
    );
    let collaborators = Collaborators {
        launcher: pool.clone(),
        ..Collaborators::default()
    };

    let dispatcher = Rc::new(Dispatcher::new(Rc::clone(&ctx.stats)));
    let mut applications = Vec::new();
    let applications_dir = ctx.applications_dir();
    for name in application_names(service, &applications_dir)? {
        let dir = applications_dir.join(&name);
        match Application::new(
            &name,
            &dir,
            ctx.app_options(serves_http),
            collaborators.clone(),
            Rc::clone(&watch),
        ) {
            Ok(app) => {
                dispatcher.add(Rc::clone(&app));
                ctx.add_application(Rc::clone(&app));
                applications.push(app);
            }
            Err(e) => tracing::error!(app = %name, "Can't create application: {}", e),
        }
    }

    listen(ctx, service, &dispatcher, parent.as_ref()).await?;

    join_all(applications.iter().map(|app| app.start())).await;
    if serves_http {
        compare_hosts(&applications);
    }
    link_namespaces(&applications);

    tokio::task::spawn_local(tick_loop(applications.clone()));
    if let Some(changes) = changes {
        tokio::task::spawn_local(invalidation_loop(applications.clone(), changes));
    }
    if ctx.env.is_test_mode() && service.name.contains("test") {
        run_tests(&applications);
    }

    Ok(HostedService {
        applications,
        pool,
        dispatcher,
    })
}

async fn listen(
    ctx: &ServerContext,
    service: &Service,
    dispatcher: &Rc<Dispatcher>,
    parent: &dyn MessageSink,
) -> Result<()> {
    let marker = ctx.process_marker();
    let mut protocol = service.config.protocol.to_uppercase();
    match service.config.transport.as_deref() {
        Some("tls") => protocol.push('S'),
        Some(transport @ ("ws" | "wss")) => {
            protocol.push('/');
            protocol.push_str(&transport.to_uppercase());
        }
        _ => {}
    }
    let mut message = format!("{} listen on {} by {}", protocol, service.address(), marker);
    if service.is_master() {
        message.push_str(if ctx.config.scale.instance == "controller" {
            " Cloud Controller"
        } else {
            " Master Server"
        });
    }

    if service.config.protocol != "http" {
        tracing::info!("{} FAILED", message);
        return Ok(());
    }

    match HttpServer::bind(Rc::clone(dispatcher), ListenerOptions::from(service)).await {
        Ok(server) => {
            tracing::info!("{}", message);
            tokio::task::spawn_local(server.run());
            Ok(())
        }
        Err(e) => {
            if !ctx.env.role.is_master() {
                parent.send(&IpcMessage::Exit {
                    code: None,
                    error: Some(e.to_string()),
                });
            }
            Err(e.into())
        }
    }
}

async fn tick_loop(applications: Vec<Rc<Application>>) {
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        for app in &applications {
            app.tick();
        }
    }
}

async fn invalidation_loop(applications: Vec<Rc<Application>>, mut changes: UnboundedReceiver<PathBuf>) {
    while let Some(dir) = changes.recv().await {
        for app in &applications {
            if let Some(relative) = relative_dir(app.dir(), &dir) {
                tracing::debug!(app = %app.name(), dir = %relative, "Invalidating cache");
                app.invalidate(&relative);
            }
        }
    }
}

fn run_tests(applications: &[Rc<Application>]) {
    for app in applications {
        let results = app.run_tests();
        let failed = results.iter().filter(|(_, failures)| !failures.is_empty()).count();
        for (path, failures) in &results {
            for failure in failures {
                tracing::error!(app = %app.name(), test = %path, "Test failed: {}", failure);
            }
        }
        tracing::info!(app = %app.name(), total = results.len(), failed, "Tests finished");
    }
}

/// Body of a worker process. Returns when the master closes the channel.
pub async fn run(ctx: Rc<ServerContext>) -> Result<i32> {
    let service = ctx
        .own_service()
        .cloned()
        .ok_or_else(|| apphost_common::HostError::Environment(format!(
            "service {} is not configured",
            ctx.env.server_name.as_deref().unwrap_or("-")
        )))?;

    let hosted = host_service(&ctx, &service).await?;
    if let Some(parent) = ctx.parent() {
        parent.send(&IpcMessage::Start { id: ctx.env.worker_id });
    }
    tracing::info!(node = %ctx.node_id, apps = hosted.applications.len(), "Worker forked");

    let mut incoming = read_messages(BufReader::new(tokio::io::stdin()));
    while let Some(message) = incoming.recv().await {
        if message.is_retranslated() {
            hosted.pool.record(&message);
        } else {
            tracing::debug!("Unexpected message from master: {}", message.name());
        }
    }

    tracing::info!("Master channel closed");
    hosted.pool.kill_all();
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use apphost_common::config::ServiceConfig;
    use apphost_server::watch::NullWatch;
    use apphost_server::AppOptions;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn service(applications: Option<Vec<String>>) -> Service {
        let config: ServiceConfig = toml::from_str("protocol = \"http\"\nports = [8001]").unwrap();
        Service {
            name: "www8001".into(),
            port: 8001,
            config: ServiceConfig { applications, ..config },
        }
    }

    async fn started(dir: &Path, name: &str) -> Rc<Application> {
        let app = Application::new(
            name,
            dir,
            AppOptions::default(),
            Collaborators::default(),
            Rc::new(NullWatch),
        )
        .unwrap();
        app.start().await;
        app
    }

    #[test]
    fn test_application_names() {
        let root = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("shop")).unwrap();
        fs::create_dir_all(root.path().join("blog")).unwrap();
        fs::write(root.path().join("README"), "x").unwrap();

        assert_eq!(application_names(&service(None), root.path()).unwrap(), vec!["blog", "shop"]);
        assert_eq!(
            application_names(&service(Some(vec!["shop".into()])), root.path()).unwrap(),
            vec!["shop"]
        );
        assert!(application_names(&service(None), &root.path().join("missing")).is_err());
    }

    #[tokio::test]
    async fn test_link_namespaces_copies_exported_values() {
        let root = tempfile::TempDir::new().unwrap();
        let shop = root.path().join("shop");
        let blog = root.path().join("blog");
        write(&shop, "config/sandbox.toml", "export = [\"prices\"]");
        write(&shop, "lib/prices.js", "global.prices = { apple: 3 }; global.secret = 1;");
        write(
            &blog,
            "config/sandbox.toml",
            "export = [\"shared\"]\n[import.shop]\nprices = \"shared.prices\"\nsecret = \"shared.secret\"",
        );

        let apps = vec![started(&shop, "shop").await, started(&blog, "blog").await];
        assert_eq!(link_namespaces(&apps), 1);
        assert_eq!(
            apps[1].export_value("shared"),
            Some(serde_json::json!({"prices": {"apple": 3}}))
        );
    }

    #[tokio::test]
    async fn test_compare_hosts_counts_overlaps() {
        let root = tempfile::TempDir::new().unwrap();
        let a = root.path().join("a");
        let b = root.path().join("b");
        write(&a, "config/hosts.toml", "hosts = [\"a.example.com\"]");
        write(&b, "config/hosts.toml", "hosts = [\"*\"]");
        let apps = vec![started(&a, "a").await, started(&b, "b").await];
        assert_eq!(compare_hosts(&apps), 1);
        assert_eq!(compare_hosts(&apps[..1]), 0);
    }
}
