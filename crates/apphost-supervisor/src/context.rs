//! Process context
//!
//! Everything a process knows about itself lives in one [`ServerContext`],
//! built in a fixed order by [`ServerContext::init`]:
//!
//! 1. role markers from the environment
//! 2. server configuration and the expanded service list
//! 3. the node id (`<scale.server>N<worker id>`)
//! 4. logging, which needs the node id for its file name
//!
//! and torn down by [`ServerContext::stop`] plus the shutdown sequence.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use apphost_common::config::ServerSections;
use apphost_common::{logging, IpcMessage, LogGuard, ProcessEnv, ProcessRole, Service};
use apphost_server::{AppOptions, Application, Stats};

use crate::channel::MessageSink;
use crate::error::Result;
use crate::process;
use crate::shutdown::{self, ShutdownLatch, Terminate};

pub struct ServerContext {
    pub env: ProcessEnv,
    pub root: PathBuf,
    pub config: ServerSections,
    pub services: Vec<Service>,
    pub node_id: String,
    pub stats: Rc<Stats>,
    log: RefCell<LogGuard>,
    latch: ShutdownLatch,
    /// Channel to the master, for workers
    parent: Option<Rc<dyn MessageSink>>,
    /// Forked processes by node id (master: workers and relayed long workers)
    children: RefCell<BTreeMap<String, u32>>,
    applications: RefCell<Vec<Rc<Application>>>,
}

/// Number of CPUs used to expand per-core port sequences.
pub fn cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl ServerContext {
    /// Builds the context of this process and installs logging.
    pub fn init(root: &Path, env: ProcessEnv, parent: Option<Rc<dyn MessageSink>>) -> Result<Rc<Self>> {
        let config = ServerSections::load(root)?;
        let mut ctx = Self::new(root, env, config, parent)?;
        let guard = logging::init(root, &ctx.node_id, &ctx.config.log)?;
        ctx.log = RefCell::new(guard);
        Ok(Rc::new(ctx))
    }

    /// Builds a context from already loaded configuration, without logging.
    pub fn new(
        root: &Path,
        env: ProcessEnv,
        config: ServerSections,
        parent: Option<Rc<dyn MessageSink>>,
    ) -> Result<Self> {
        let services = config.services(cpus())?;
        let mut node_id = env.node_id(&config.scale.server);
        if env.role == ProcessRole::LongWorker {
            node_id = format!("{}L{}", node_id, std::process::id());
        }
        Ok(Self {
            env,
            root: root.to_path_buf(),
            config,
            services,
            node_id,
            stats: Rc::new(Stats::default()),
            log: RefCell::new(LogGuard::default()),
            latch: ShutdownLatch::default(),
            parent,
            children: RefCell::new(BTreeMap::new()),
            applications: RefCell::new(Vec::new()),
        })
    }

    /// `Master(<pid>/<node id>)` or `Worker(<pid>/<node id>)`.
    pub fn process_marker(&self) -> String {
        let kind = if self.env.role.is_master() { "Master" } else { "Worker" };
        format!("{}({}/{})", kind, std::process::id(), self.node_id)
    }

    pub fn applications_dir(&self) -> PathBuf {
        self.root.join("applications")
    }

    /// Service this worker was forked for.
    pub fn own_service(&self) -> Option<&Service> {
        let name = self.env.server_name.as_deref()?;
        self.services.iter().find(|s| s.name == name)
    }

    pub fn app_options(&self, serves_http: bool) -> AppOptions {
        AppOptions {
            worker_id: self.env.worker_id,
            node_id: self.node_id.clone(),
            server_id: self.config.scale.server.clone(),
            instance: self.config.scale.instance.clone(),
            serves_http,
            test_mode: self.env.is_test_mode(),
            default_sandbox: self.config.sandbox.clone(),
        }
    }

    pub fn parent(&self) -> Option<&Rc<dyn MessageSink>> {
        self.parent.as_ref()
    }

    pub fn add_child(&self, node_id: &str, pid: u32) {
        self.children.borrow_mut().insert(node_id.to_string(), pid);
    }

    pub fn remove_child(&self, node_id: &str) -> Option<u32> {
        self.children.borrow_mut().remove(node_id)
    }

    pub fn children(&self) -> Vec<(String, u32)> {
        self.children
            .borrow()
            .iter()
            .map(|(name, pid)| (name.clone(), *pid))
            .collect()
    }

    pub fn add_application(&self, app: Rc<Application>) {
        self.applications.borrow_mut().push(app);
    }

    pub fn applications(&self) -> Vec<Rc<Application>> {
        self.applications.borrow().clone()
    }

    /// Drops every cached script and static file of every application.
    pub fn clear_caches(&self) {
        for app in self.applications.borrow().iter() {
            app.cache().clear();
        }
    }

    /// Emits `Stop` on every application, stopping its tasks and clearing
    /// its cache.
    pub fn stop(&self) {
        for app in self.applications.borrow().iter() {
            app.stop();
        }
    }

    /// Runs the termination sequence once; see [`shutdown::shutdown`].
    pub fn shutdown(&self, code: i32) -> bool {
        shutdown::shutdown(&self.latch, self.env.role, code, self)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.latch.is_finalized()
    }
}

impl Terminate for ServerContext {
    fn kill_workers(&self) {
        for (node_id, pid) in std::mem::take(&mut *self.children.borrow_mut()) {
            if let Err(e) = process::terminate(pid) {
                tracing::debug!(node = %node_id, "Can't terminate {}: {}", pid, e);
            }
        }
    }

    fn flush_logs(&self) {
        let (fork, event, req, res) = self.stats.snapshot();
        tracing::debug!(fork, event, req, res, "Process stats");
        self.log.borrow_mut().flush();
    }

    fn exit(&self, code: i32) {
        self.stop();
        if let Some(parent) = &self.parent {
            parent.send(&IpcMessage::Exit {
                code: Some(code),
                error: None,
            });
        }
        std::process::exit(code);
    }
}
