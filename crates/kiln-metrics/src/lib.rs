//! Process-wide object counters.
//!
//! The `stats` action reports how many engines, slaves and requests exist
//! in the process, both all-time and currently alive. Counters are plain
//! atomics bumped on construction and destruction; `total` is monotonic,
//! `alive` is a live gauge. Collection membership is only ever mutated on
//! the reactor thread, so reads need no locking.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters for one object class.
pub struct ObjectCounters {
    created: AtomicU64,
    alive: AtomicU64,
}

/// A point-in-time view of one object class.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total: u64,
    pub alive: u64,
}

impl ObjectCounters {
    pub const fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            alive: AtomicU64::new(0),
        }
    }

    /// Registers one new object, returning the guard that keeps it counted
    /// as alive.
    pub fn acquire(&'static self) -> CountGuard {
        self.created.fetch_add(1, Ordering::Relaxed);
        self.alive.fetch_add(1, Ordering::Relaxed);
        CountGuard { counters: self }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total: self.created.load(Ordering::Relaxed),
            alive: self.alive.load(Ordering::Relaxed),
        }
    }
}

impl Default for ObjectCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the alive gauge when the counted object is dropped.
pub struct CountGuard {
    counters: &'static ObjectCounters,
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.counters.alive.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for CountGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountGuard").finish()
    }
}

/// Engines, one per application.
pub static ENGINES: ObjectCounters = ObjectCounters::new();

/// Slave supervisors across all engines.
pub static SLAVES: ObjectCounters = ObjectCounters::new();

/// In-flight composite requests.
pub static REQUESTS: ObjectCounters = ObjectCounters::new();

#[cfg(test)]
mod tests {
    use super::*;

    // Tests use their own statics: the shared ones are process-global and
    // other tests may be holding guards on them.

    #[test]
    fn test_acquire_and_release() {
        static COUNTERS: ObjectCounters = ObjectCounters::new();

        let first = COUNTERS.acquire();
        let second = COUNTERS.acquire();
        assert_eq!(
            COUNTERS.snapshot(),
            CounterSnapshot { total: 2, alive: 2 }
        );

        drop(first);
        assert_eq!(
            COUNTERS.snapshot(),
            CounterSnapshot { total: 2, alive: 1 }
        );

        drop(second);
        assert_eq!(
            COUNTERS.snapshot(),
            CounterSnapshot { total: 2, alive: 0 }
        );
    }

    #[test]
    fn test_total_is_monotonic() {
        static COUNTERS: ObjectCounters = ObjectCounters::new();

        for _ in 0..5 {
            let guard = COUNTERS.acquire();
            drop(guard);
        }

        let snapshot = COUNTERS.snapshot();
        assert_eq!(snapshot.total, 5);
        assert_eq!(snapshot.alive, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        static COUNTERS: ObjectCounters = ObjectCounters::new();
        let _guard = COUNTERS.acquire();

        let json = serde_json::to_value(COUNTERS.snapshot()).unwrap();
        assert_eq!(json["total"], 1);
        assert_eq!(json["alive"], 1);
    }
}
