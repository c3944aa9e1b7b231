//! Process role selection
//!
//! Every apphost process runs the same binary; its role comes from the
//! environment the parent set when forking it:
//!
//! - a long worker carries `WORKER_TYPE=long` plus the application, file and
//!   client snapshot of its single job
//! - a worker carries `WORKER_SERVER_NAME` (and its protocol and id)
//! - anything else is the master

use std::collections::HashMap;

use crate::error::{HostError, Result};

pub const WORKER_TYPE: &str = "WORKER_TYPE";
pub const WORKER_APPNAME: &str = "WORKER_APPNAME";
pub const WORKER_FILE: &str = "WORKER_FILE";
pub const WORKER_ID: &str = "WORKER_ID";
pub const WORKER_SERVER_NAME: &str = "WORKER_SERVER_NAME";
pub const WORKER_SERVER_PROTO: &str = "WORKER_SERVER_PROTO";
pub const WORKER_CLIENT: &str = "WORKER_CLIENT";
pub const APPHOST_MODE: &str = "APPHOST_MODE";

/// Value of [`WORKER_TYPE`] that marks a long worker.
pub const LONG_WORKER: &str = "long";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Master,
    Worker,
    LongWorker,
}

impl ProcessRole {
    pub fn is_master(self) -> bool {
        self == ProcessRole::Master
    }
}

/// Job of a long worker: run `file` of `app_name` against `client`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongWorkerJob {
    pub app_name: String,
    pub file: String,
    /// Serialized client snapshot (JSON)
    pub client: String,
}

/// Everything a process learns from its environment at startup.
#[derive(Debug, Clone)]
pub struct ProcessEnv {
    pub role: ProcessRole,
    /// 0 for the master, 1.. for workers in fork order
    pub worker_id: u32,
    pub server_name: Option<String>,
    pub server_proto: Option<String>,
    pub job: Option<LongWorkerJob>,
    /// Value of `APPHOST_MODE` (`test` enables test discovery)
    pub mode: String,
}

impl ProcessEnv {
    /// Reads the role markers from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars().collect())
    }

    /// Derives the role from an explicit variable map.
    ///
    /// # Errors
    ///
    /// Returns `HostError::Environment` when a worker id is not a number or
    /// a long worker misses its application, file or client marker.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self> {
        let is_long = vars.get(WORKER_TYPE).map(String::as_str) == Some(LONG_WORKER);
        let role = if is_long {
            ProcessRole::LongWorker
        } else if vars.contains_key(WORKER_SERVER_NAME) {
            ProcessRole::Worker
        } else {
            ProcessRole::Master
        };

        let worker_id = if role.is_master() {
            0
        } else {
            let raw = vars
                .get(WORKER_ID)
                .ok_or_else(|| HostError::Environment(format!("{} is not set", WORKER_ID)))?;
            raw.parse().map_err(|_| {
                HostError::Environment(format!("{} is not a number: {}", WORKER_ID, raw))
            })?
        };

        let job = if is_long {
            let required = |name: &str| {
                vars.get(name)
                    .cloned()
                    .ok_or_else(|| HostError::Environment(format!("{} is not set", name)))
            };
            Some(LongWorkerJob {
                app_name: required(WORKER_APPNAME)?,
                file: required(WORKER_FILE)?,
                client: required(WORKER_CLIENT)?,
            })
        } else {
            None
        };

        Ok(Self {
            role,
            worker_id,
            server_name: vars.get(WORKER_SERVER_NAME).cloned(),
            server_proto: vars.get(WORKER_SERVER_PROTO).cloned(),
            job,
            mode: vars.get(APPHOST_MODE).cloned().unwrap_or_default(),
        })
    }

    pub fn is_test_mode(&self) -> bool {
        self.mode == "test"
    }

    /// Whether this process serves HTTP (enables the `www` place).
    pub fn serves_http(&self) -> bool {
        self.server_proto.as_deref() == Some("http")
    }

    /// `<server>N<worker id>`, e.g. `S1N0` for the master.
    pub fn node_id(&self, server: &str) -> String {
        node_id(server, self.worker_id)
    }
}

pub fn node_id(server: &str, worker_id: u32) -> String {
    format!("{}N{}", server, worker_id)
}
