//! Resident memory watchdog
//!
//! With `scale.memory_limit` set, every process measures its resident set
//! each `memory_check_interval`. Above the limit it clears every cache and
//! measures again; still above, the process fails fatally and is restarted
//! by whatever supervises it.

use std::time::Duration;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Samples the resident set size of this process.
pub struct ResidentMemory {
    system: System,
    pid: Option<Pid>,
}

impl ResidentMemory {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!("Can't find own process for memory sampling: {}", e);
                None
            }
        };
        Self {
            system: System::new(),
            pid,
        }
    }

    /// Current resident memory in bytes, `None` when the platform can't
    /// report it.
    pub fn measure(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system.process(pid).map(|process| process.memory())
    }
}

impl Default for ResidentMemory {
    fn default() -> Self {
        Self::new()
    }
}

/// `1536000` -> `1.5 MB`
pub fn bytes_to_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCheck {
    Below,
    /// Over the limit until caches were cleared
    Recovered,
    /// Still over the limit after clearing, with the measured size
    Exceeded(u64),
}

/// One watchdog round.
pub fn check(limit: u64, mut measure: impl FnMut() -> Option<u64>, clear: impl FnOnce()) -> MemoryCheck {
    match measure() {
        Some(before) if before >= limit => {}
        _ => return MemoryCheck::Below,
    }
    clear();
    match measure() {
        Some(after) if after > limit => MemoryCheck::Exceeded(after),
        _ => MemoryCheck::Recovered,
    }
}

/// Checks every `interval` until the limit is exceeded, then returns the
/// fatal message. Must run inside a `LocalSet`.
pub async fn watchdog(limit: u64, interval: Duration, clear: impl Fn()) -> String {
    let mut memory = ResidentMemory::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match check(limit, || memory.measure(), &clear) {
            MemoryCheck::Below => {}
            MemoryCheck::Recovered => tracing::warn!("Memory limit reached, caches cleared"),
            MemoryCheck::Exceeded(size) => {
                return format!("Memory limit exceeded: {}, restarting", bytes_to_size(size))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_bytes_to_size() {
        assert_eq!(bytes_to_size(512), "512 B");
        assert_eq!(bytes_to_size(1_536_000), "1.5 MB");
        assert_eq!(bytes_to_size(2_000_000_000), "2.0 GB");
    }

    #[test]
    fn test_below_limit_does_not_clear() {
        let cleared = Cell::new(false);
        assert_eq!(check(100, || Some(50), || cleared.set(true)), MemoryCheck::Below);
        assert!(!cleared.get());
    }

    #[test]
    fn test_clearing_recovers() {
        let readings = Cell::new(0);
        let measure = || {
            readings.set(readings.get() + 1);
            Some(if readings.get() == 1 { 150 } else { 80 })
        };
        let cleared = Cell::new(false);
        assert_eq!(check(100, measure, || cleared.set(true)), MemoryCheck::Recovered);
        assert!(cleared.get());
    }

    #[test]
    fn test_still_over_limit_is_exceeded() {
        assert_eq!(check(100, || Some(150), || {}), MemoryCheck::Exceeded(150));
    }

    #[test]
    fn test_resident_memory_is_measured() {
        let mut memory = ResidentMemory::new();
        let first = memory.measure().unwrap();
        assert!(first > 0);
        // a second sample reuses the same system handle
        assert!(memory.measure().unwrap() > 0);
    }
}
