//! Idempotent shutdown
//!
//! Every way of stopping a process (signals, fatal errors, the memory
//! watchdog, a worker's own exit) ends in [`shutdown`]. The latch makes sure
//! the termination sequence runs once; later requests return immediately.

use std::cell::Cell;

use apphost_common::ProcessRole;

/// One-shot finalize flag.
#[derive(Debug, Default)]
pub struct ShutdownLatch {
    finalized: Cell<bool>,
}

impl ShutdownLatch {
    /// Latches the flag. Returns `true` only for the first caller.
    pub fn begin(&self) -> bool {
        !self.finalized.replace(true)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.get()
    }
}

/// The side effects of a termination sequence.
pub trait Terminate {
    /// Kills every forked worker and long worker.
    fn kill_workers(&self);
    /// Flushes and closes the log writer.
    fn flush_logs(&self);
    fn exit(&self, code: i32);
}

/// Runs the termination sequence for `role` unless one already ran.
///
/// The master kills its workers before flushing; workers and long workers
/// only flush. Returns whether this call performed the sequence.
pub fn shutdown(latch: &ShutdownLatch, role: ProcessRole, code: i32, target: &dyn Terminate) -> bool {
    if !latch.begin() {
        return false;
    }
    if role.is_master() {
        target.kill_workers();
        tracing::info!("Stopped server");
    } else {
        tracing::info!("Worker terminated");
    }
    target.flush_logs();
    target.exit(code);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        steps: RefCell<Vec<String>>,
    }

    impl Terminate for Recorder {
        fn kill_workers(&self) {
            self.steps.borrow_mut().push("kill".into());
        }

        fn flush_logs(&self) {
            self.steps.borrow_mut().push("flush".into());
        }

        fn exit(&self, code: i32) {
            self.steps.borrow_mut().push(format!("exit {}", code));
        }
    }

    #[test]
    fn test_master_sequence_runs_once() {
        let latch = ShutdownLatch::default();
        let recorder = Recorder::default();
        assert!(shutdown(&latch, ProcessRole::Master, 0, &recorder));
        assert!(!shutdown(&latch, ProcessRole::Master, 1, &recorder));
        assert_eq!(*recorder.steps.borrow(), vec!["kill", "flush", "exit 0"]);
    }

    #[test]
    fn test_worker_does_not_kill() {
        let latch = ShutdownLatch::default();
        let recorder = Recorder::default();
        assert!(shutdown(&latch, ProcessRole::Worker, 1, &recorder));
        assert_eq!(*recorder.steps.borrow(), vec!["flush", "exit 1"]);
        assert!(latch.is_finalized());
    }

    #[test]
    fn test_latch_begins_once() {
        let latch = ShutdownLatch::default();
        assert!(!latch.is_finalized());
        assert!(latch.begin());
        assert!(!latch.begin());
    }
}
