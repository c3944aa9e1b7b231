//! Fatal-error handling
//!
//! Uncaught failures of a process all pass through [`FatalHandler::handle`].
//! A failure raised while application script code was executing is logged
//! and the worker keeps running; anything else crashes the process through
//! the shutdown channel with exit code 1.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::path::{Path, PathBuf};

use apphost_server::runtime::current_script_app;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::SupervisorError;

/// Frames from these locations are runtime internals and never useful in a
/// log line.
const INTERNAL_FRAMES: &[&str] = &["/rustc/", "/.cargo/registry/", "std::panicking", "core::panicking"];

/// Exit code requested on a crash.
pub const CRASH_EXIT_CODE: i32 = 1;

/// An uncaught failure.
#[derive(Debug, Clone)]
pub struct Fatal {
    pub message: String,
    pub stack: Option<String>,
    /// Application whose script was executing, when the failure happened
    /// inside script execution
    pub script_app: Option<String>,
}

impl Fatal {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            script_app: None,
        }
    }

    /// Bind errors are logged by their message alone.
    pub fn from_error(err: &SupervisorError) -> Self {
        Self::message(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Keep the worker alive
    Recover { app: Option<String> },
    Crash,
}

/// Recoverable only when raised from script execution.
pub fn classify(fatal: &Fatal) -> Outcome {
    match &fatal.script_app {
        Some(app) => Outcome::Recover {
            app: Some(app.clone()),
        },
        None => Outcome::Crash,
    }
}

/// Strips the server root from paths and drops runtime-internal frames.
pub fn shorten_stack(stack: &str, root: &Path) -> String {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches('/');
    stack
        .lines()
        .filter(|line| !INTERNAL_FRAMES.iter().any(|frame| line.contains(frame)))
        .map(|line| {
            if root.is_empty() {
                line.trim_end().to_string()
            } else {
                line.replace(root, "").trim_end().to_string()
            }
        })
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Name of the application a stack points into, from the first
/// `/applications/<name>/` segment.
pub fn find_application_by_stack(stack: &str) -> Option<String> {
    const MARKER: &str = "/applications/";
    let start = stack.find(MARKER)? + MARKER.len();
    let rest = &stack[start..];
    let end = rest.find(['/', '\\'])?;
    let name = &rest[..end];
    (!name.is_empty()).then(|| name.to_string())
}

/// Logs failures and requests the shutdown of crashed processes.
#[derive(Debug, Clone)]
pub struct FatalHandler {
    root: PathBuf,
    shutdown: UnboundedSender<i32>,
}

impl FatalHandler {
    /// `shutdown` receives the exit code of a crashed process.
    pub fn new(root: &Path, shutdown: UnboundedSender<i32>) -> Self {
        Self {
            root: root.to_path_buf(),
            shutdown,
        }
    }

    pub fn handle(&self, fatal: Fatal) -> Outcome {
        let outcome = classify(&fatal);
        let app = fatal
            .script_app
            .clone()
            .or_else(|| fatal.stack.as_deref().and_then(find_application_by_stack));
        match &fatal.stack {
            Some(stack) => tracing::error!(
                "{}\n{}",
                fatal.message,
                shorten_stack(stack, &self.root)
            ),
            None => tracing::error!("{}", fatal.message),
        }
        match &outcome {
            Outcome::Recover { .. } => tracing::info!(
                "Recover worker after throw Error in application: {}",
                app.as_deref().unwrap_or("-")
            ),
            Outcome::Crash => {
                tracing::info!("Crashed");
                let _ = self.shutdown.send(CRASH_EXIT_CODE);
            }
        }
        outcome
    }

    /// Routes panics through [`FatalHandler::handle`]. A panic inside script
    /// execution is caught by the sandbox after the hook ran, so it only
    /// needs logging.
    pub fn install_panic_hook(&self) {
        let handler = self.clone();
        std::panic::set_hook(Box::new(move |info| {
            let payload = info
                .payload()
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| info.payload().downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            let backtrace = Backtrace::capture();
            let stack = match backtrace.status() {
                BacktraceStatus::Captured => format!("at {}\n{}", location, backtrace),
                _ => format!("at {}", location),
            };
            handler.handle(Fatal {
                message: payload,
                stack: Some(stack),
                script_app: current_script_app(),
            });
        }));
    }
}
