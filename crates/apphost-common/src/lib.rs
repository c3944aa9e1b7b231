//! apphost common types
//!
//! This crate provides the pieces shared by every apphost process:
//!
//! - [`error`] - the `HostError` type and `Result` alias
//! - [`ipc`] - control messages exchanged between the master and its children
//! - [`config`] - TOML configuration sections for the server and applications
//! - [`env`] - process role selection from environment markers
//! - [`logging`] - tracing subscriber bootstrap and log flushing
//!
//! # Process Model
//!
//! One master process forks one worker per configured listening service.
//! Workers host applications and may fork short-lived long workers that run a
//! single script against a serialized request snapshot. All of them speak the
//! newline-delimited JSON protocol defined in [`ipc`].

pub mod config;
pub mod env;
pub mod error;
pub mod ipc;
pub mod logging;

pub use config::{AppSections, ServerSections, Service, ServiceConfig};
pub use env::{LongWorkerJob, ProcessEnv, ProcessRole};
pub use error::{HostError, Result};
pub use ipc::IpcMessage;
pub use logging::LogGuard;
