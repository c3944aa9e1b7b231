//! Long workers
//!
//! A long worker is a child process that runs one application script
//! against one request snapshot and exits. The worker that forks it owns a
//! [`LongWorkerPool`]: jobs are keyed by `(application, file)` so that
//! `stopWorker` with the same arguments terminates the same process.
//!
//! Fork and exit are announced to the master, which relays them to every
//! other worker; those keep the announcements in their remote registry.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

use apphost_common::env::{
    APPHOST_MODE, LONG_WORKER, WORKER_APPNAME, WORKER_CLIENT, WORKER_FILE, WORKER_ID, WORKER_SERVER_NAME,
    WORKER_TYPE,
};
use apphost_common::{IpcMessage, LongWorkerJob};
use apphost_server::collaborators::WorkerLauncher;
use apphost_server::runtime::HandlerBody;
use apphost_server::watch::NullWatch;
use apphost_server::{Application, Collaborators, Stats};
use futures::future::{FutureExt, LocalBoxFuture};
use serde_json::Value as JsonValue;

use crate::channel::MessageSink;
use crate::context::ServerContext;
use crate::error::Result;
use crate::process::{self, ChildSpec};

/// What to run in a long worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub app_name: String,
    pub file: String,
    /// Serialized client snapshot
    pub client: String,
}

/// A started job: its pid and a future resolving to its exit code.
pub struct SpawnedJob {
    pub pid: u32,
    pub exited: LocalBoxFuture<'static, Option<i32>>,
}

/// Starts and signals long-worker processes.
pub trait Spawner {
    fn spawn(&self, job: &JobSpec) -> std::io::Result<SpawnedJob>;
    fn terminate(&self, pid: u32) -> std::io::Result<()>;
}

/// Spawns long workers as child processes of this worker.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    pub root: PathBuf,
    pub worker_id: u32,
    pub server_name: Option<String>,
    pub mode: String,
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, job: &JobSpec) -> std::io::Result<SpawnedJob> {
        let mut env = vec![
            (WORKER_TYPE, LONG_WORKER.to_string()),
            (WORKER_ID, self.worker_id.to_string()),
            (WORKER_APPNAME, job.app_name.clone()),
            (WORKER_FILE, job.file.clone()),
            (WORKER_CLIENT, job.client.clone()),
            (APPHOST_MODE, self.mode.clone()),
        ];
        if let Some(server) = &self.server_name {
            env.push((WORKER_SERVER_NAME, server.clone()));
        }
        let spec = ChildSpec {
            what: format!("long worker {}", job.file),
            root: self.root.clone(),
            env,
            ipc: false,
        };
        let mut child = process::spawn_child(&spec).map_err(|e| std::io::Error::other(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("long worker exited before it started"))?;
        let exited = async move { child.wait().await.ok().and_then(|status| status.code()) }.boxed_local();
        Ok(SpawnedJob { pid, exited })
    }

    fn terminate(&self, pid: u32) -> std::io::Result<()> {
        process::terminate(pid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Job {
    node_id: String,
    pid: u32,
}

/// A long worker announced by another worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWorker {
    pub node_id: String,
    pub pid: u32,
    pub file: String,
}

pub struct LongWorkerPool {
    me: Weak<LongWorkerPool>,
    spawner: Rc<dyn Spawner>,
    parent: Rc<dyn MessageSink>,
    stats: Rc<Stats>,
    /// Node id of the owning worker
    node_id: String,
    jobs: RefCell<BTreeMap<(String, String), Job>>,
    /// application -> node id -> long worker
    remote: RefCell<BTreeMap<String, BTreeMap<String, RemoteWorker>>>,
}

impl LongWorkerPool {
    pub fn new(
        spawner: Rc<dyn Spawner>,
        parent: Rc<dyn MessageSink>,
        stats: Rc<Stats>,
        node_id: &str,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            spawner,
            parent,
            stats,
            node_id: node_id.to_string(),
            jobs: RefCell::new(BTreeMap::new()),
            remote: RefCell::new(BTreeMap::new()),
        })
    }

    /// Pids of running jobs, by `(application, file)`.
    pub fn running(&self) -> Vec<((String, String), u32)> {
        self.jobs
            .borrow()
            .iter()
            .map(|(key, job)| (key.clone(), job.pid))
            .collect()
    }

    /// Terminates every job of this worker.
    pub fn kill_all(&self) {
        for (_, job) in std::mem::take(&mut *self.jobs.borrow_mut()) {
            if let Err(e) = self.spawner.terminate(job.pid) {
                tracing::debug!(node = %job.node_id, "Can't terminate long worker: {}", e);
            }
        }
    }

    /// Applies a relayed fork or exit announcement.
    pub fn record(&self, message: &IpcMessage) {
        match message {
            IpcMessage::ForkLongWorker {
                app_name,
                node_id,
                pid,
                file,
            } => {
                self.remote.borrow_mut().entry(app_name.clone()).or_default().insert(
                    node_id.clone(),
                    RemoteWorker {
                        node_id: node_id.clone(),
                        pid: *pid,
                        file: file.clone(),
                    },
                );
            }
            IpcMessage::ExitLongWorker { app_name, node_id } => {
                let mut remote = self.remote.borrow_mut();
                if let Some(workers) = remote.get_mut(app_name) {
                    workers.remove(node_id);
                    if workers.is_empty() {
                        remote.remove(app_name);
                    }
                }
            }
            _ => {}
        }
    }

    /// Long workers other workers started for `app`.
    pub fn remote_workers(&self, app: &str) -> Vec<RemoteWorker> {
        self.remote
            .borrow()
            .get(app)
            .map(|workers| workers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn exited(&self, app: &str, file: &str, node_id: &str, code: Option<i32>) {
        let key = (app.to_string(), file.to_string());
        {
            let mut jobs = self.jobs.borrow_mut();
            if jobs.get(&key).is_some_and(|job| job.node_id == node_id) {
                jobs.remove(&key);
            }
        }
        tracing::info!(app = %app, node = %node_id, code = ?code, "Long worker exited");
        self.parent.send(&IpcMessage::ExitLongWorker {
            app_name: app.to_string(),
            node_id: node_id.to_string(),
        });
    }
}

impl WorkerLauncher for LongWorkerPool {
    /// Forks a long worker for `file` of `app` and announces it to the
    /// master.
    ///
    /// # Arguments
    ///
    /// * `app` - Application the script belongs to
    /// * `file` - Application-relative script; with `app` it identifies the job
    /// * `client` - Request snapshot the script runs against
    ///
    /// A job for the same `(app, file)` that is still running is left alone
    /// and the call only logs a warning.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use apphost_server::collaborators::WorkerLauncher;
    /// use apphost_supervisor::long_worker::LongWorkerPool;
    /// use serde_json::json;
    ///
    /// # fn example(pool: &LongWorkerPool) {
    /// pool.start("shop", "/www/report/build.js", &json!({ "url": "/report" }));
    /// pool.stop("shop", "/www/report/build.js");
    /// # }
    /// ```
    fn start(&self, app: &str, file: &str, client: &JsonValue) {
        let key = (app.to_string(), file.to_string());
        if self.jobs.borrow().contains_key(&key) {
            tracing::warn!(app = %app, file = %file, "Long worker is already running");
            return;
        }
        let spec = JobSpec {
            app_name: app.to_string(),
            file: file.to_string(),
            client: client.to_string(),
        };
        let spawned = match self.spawner.spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(app = %app, file = %file, "Can't fork long worker: {}", e);
                return;
            }
        };

        let node_id = format!("{}L{}", self.node_id, spawned.pid);
        self.jobs.borrow_mut().insert(
            key,
            Job {
                node_id: node_id.clone(),
                pid: spawned.pid,
            },
        );
        self.stats.forked();
        tracing::info!(app = %app, node = %node_id, file = %file, "Long worker forked");
        self.parent.send(&IpcMessage::ForkLongWorker {
            app_name: app.to_string(),
            node_id: node_id.clone(),
            pid: spawned.pid,
            file: file.to_string(),
        });

        let pool = self.me.clone();
        let (app, file) = (app.to_string(), file.to_string());
        let exited = spawned.exited;
        tokio::task::spawn_local(async move {
            let code = exited.await;
            if let Some(pool) = pool.upgrade() {
                pool.exited(&app, &file, &node_id, code);
            }
        });
    }

    fn stop(&self, app: &str, file: &str) {
        let key = (app.to_string(), file.to_string());
        let Some(job) = self.jobs.borrow().get(&key).cloned() else {
            return;
        };
        if let Err(e) = self.spawner.terminate(job.pid) {
            tracing::warn!(app = %app, node = %job.node_id, "Can't stop long worker: {}", e);
        }
    }
}

/// Body of a long-worker process: start the job's application, run its one
/// script against the client snapshot and report the exit code.
pub async fn run_job(ctx: &ServerContext, job: &LongWorkerJob) -> Result<i32> {
    let dir = ctx.applications_dir().join(&job.app_name);
    let app = Application::new(
        &job.app_name,
        &dir,
        ctx.app_options(true),
        Collaborators::default(),
        Rc::new(NullWatch),
    )?;
    app.start().await;
    ctx.add_application(Rc::clone(&app));

    let client: JsonValue = serde_json::from_str(&job.client).map_err(apphost_common::HostError::from)?;
    match app.run_script(&job.file, &client).await {
        Ok(output) => {
            let summary = match &output.body {
                HandlerBody::Empty => String::new(),
                HandlerBody::Text(text) => text.clone(),
                HandlerBody::Json(value) => value.to_string(),
            };
            tracing::info!(app = %job.app_name, file = %job.file, status = output.status, "Long worker finished {}", summary);
            Ok(0)
        }
        Err(e) => {
            app.log_exception(&e);
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RecordingSink;
    use std::cell::Cell;
    use tokio::sync::oneshot;
    use tokio::task::LocalSet;

    /// Hands out pids from 100 and keeps each job alive until terminated.
    #[derive(Default)]
    struct FakeSpawner {
        next_pid: Cell<u32>,
        exits: RefCell<BTreeMap<u32, oneshot::Sender<Option<i32>>>>,
        terminated: RefCell<Vec<u32>>,
    }

    impl Spawner for FakeSpawner {
        fn spawn(&self, _job: &JobSpec) -> std::io::Result<SpawnedJob> {
            let pid = 100 + self.next_pid.get();
            self.next_pid.set(self.next_pid.get() + 1);
            let (tx, rx) = oneshot::channel();
            self.exits.borrow_mut().insert(pid, tx);
            Ok(SpawnedJob {
                pid,
                exited: async move { rx.await.ok().flatten() }.boxed_local(),
            })
        }

        fn terminate(&self, pid: u32) -> std::io::Result<()> {
            self.terminated.borrow_mut().push(pid);
            if let Some(tx) = self.exits.borrow_mut().remove(&pid) {
                let _ = tx.send(Some(143));
            }
            Ok(())
        }
    }

    fn pool(spawner: Rc<FakeSpawner>, sink: Rc<RecordingSink>) -> Rc<LongWorkerPool> {
        LongWorkerPool::new(spawner, sink, Rc::new(Stats::default()), "S1N1")
    }

    #[tokio::test]
    async fn test_stop_terminates_only_matching_job() {
        LocalSet::new()
            .run_until(async {
                let spawner = Rc::new(FakeSpawner::default());
                let sink = Rc::new(RecordingSink::default());
                let pool = pool(spawner.clone(), sink.clone());
                let client = serde_json::json!({"url": "/cart"});

                pool.start("shop", "/cart/long.js", &client);
                pool.start("shop", "/cart/other.js", &client);
                assert_eq!(pool.running().len(), 2);

                pool.stop("shop", "/cart/long.js");
                assert_eq!(*spawner.terminated.borrow(), vec![100]);

                for _ in 0..10 {
                    tokio::task::yield_now().await;
                }
                let running = pool.running();
                assert_eq!(running.len(), 1);
                assert_eq!(running[0].0 .1, "/cart/other.js");

                let sent = sink.sent();
                assert!(matches!(&sent[0], IpcMessage::ForkLongWorker { node_id, pid: 100, .. } if node_id == "S1N1L100"));
                assert!(matches!(sent.last(), Some(IpcMessage::ExitLongWorker { node_id, .. }) if node_id == "S1N1L100"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_unknown_key_is_noop() {
        LocalSet::new()
            .run_until(async {
                let spawner = Rc::new(FakeSpawner::default());
                let sink = Rc::new(RecordingSink::default());
                let pool = pool(spawner.clone(), sink.clone());
                pool.start("shop", "/cart/long.js", &serde_json::json!({}));

                pool.stop("shop", "/cart/missing.js");
                pool.stop("blog", "/cart/long.js");
                assert!(spawner.terminated.borrow().is_empty());
                assert_eq!(pool.running().len(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn test_duplicate_start_is_refused() {
        LocalSet::new()
            .run_until(async {
                let spawner = Rc::new(FakeSpawner::default());
                let sink = Rc::new(RecordingSink::default());
                let pool = pool(spawner.clone(), sink.clone());
                pool.start("shop", "/cart/long.js", &serde_json::json!({}));
                pool.start("shop", "/cart/long.js", &serde_json::json!({}));
                assert_eq!(spawner.next_pid.get(), 1);
                assert_eq!(sink.sent().len(), 1);
            })
            .await;
    }

    #[test]
    fn test_remote_registry() {
        let pool = pool(Rc::new(FakeSpawner::default()), Rc::new(RecordingSink::default()));
        pool.record(&IpcMessage::ForkLongWorker {
            app_name: "shop".into(),
            node_id: "S1N2L77".into(),
            pid: 77,
            file: "/www/cart/long.js".into(),
        });
        assert_eq!(pool.remote_workers("shop")[0].pid, 77);
        assert!(pool.remote_workers("blog").is_empty());

        pool.record(&IpcMessage::ExitLongWorker {
            app_name: "shop".into(),
            node_id: "S1N2L77".into(),
        });
        assert!(pool.remote_workers("shop").is_empty());
    }
}
