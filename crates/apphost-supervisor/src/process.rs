//! Child process spawning
//!
//! Workers and long workers are the same binary started again with role
//! markers in their environment.

use std::path::PathBuf;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::error::{Result, SupervisorError};

/// How to start one child.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Human-readable name for errors, e.g. `worker www8001`
    pub what: String,
    pub root: PathBuf,
    pub env: Vec<(&'static str, String)>,
    /// Pipe stdin and stdout for the IPC channel
    pub ipc: bool,
}

/// Starts the current executable as a child with `spec`'s markers.
pub fn spawn_child(spec: &ChildSpec) -> Result<Child> {
    let spawn_error = |source| SupervisorError::Spawn {
        what: spec.what.clone(),
        source,
    };
    let exe = std::env::current_exe().map_err(spawn_error)?;

    let mut cmd = Command::new(exe);
    cmd.arg("start")
        .arg("--dir")
        .arg(&spec.root)
        .stdin(if spec.ipc { Stdio::piped() } else { Stdio::null() })
        .stdout(if spec.ipc { Stdio::piped() } else { Stdio::null() })
        .stderr(Stdio::inherit())
        .kill_on_drop(false);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    cmd.spawn().map_err(spawn_error)
}

/// Sends SIGTERM to `pid`.
pub fn terminate(pid: u32) -> std::io::Result<()> {
    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminate_rejects_huge_pid() {
        assert!(terminate(u32::MAX).is_err());
    }

    #[tokio::test]
    async fn test_terminate_stops_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        terminate(child.id().unwrap()).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
