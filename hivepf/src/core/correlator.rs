//! Begin/end timestamp pairing keyed by execution context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::clock::Clock;
use super::table::{KeyedTable, SlotValue};

const NOT_BEGUN: u64 = u64::MAX;
const NO_DELTA: u64 = u64::MAX;

/// In-flight operation.
pub struct CorrelationEntry {
    start_ns: AtomicU64,
    last_delta_ns: AtomicU64,
}

impl Default for CorrelationEntry {
    fn default() -> Self {
        Self {
            start_ns: AtomicU64::new(NOT_BEGUN),
            last_delta_ns: AtomicU64::new(NO_DELTA),
        }
    }
}

impl SlotValue for CorrelationEntry {
    fn reset(&self) {
        self.start_ns.store(NOT_BEGUN, Ordering::Relaxed);
        self.last_delta_ns.store(NO_DELTA, Ordering::Relaxed);
    }
}

pub struct LatencyCorrelator<C: Clock> {
    table: KeyedTable<CorrelationEntry>,
    clock: C,
}

impl<C: Clock> LatencyCorrelator<C> {
    pub fn new(capacity: usize, clock: C) -> Self {
        Self {
            table: KeyedTable::with_capacity(capacity),
            clock,
        }
    }

    pub fn begin(&self, key: u64) {
        self.begin_at(key, self.clock.now_ns());
    }

    /// Starts (or restarts) the clock for `key` at `ts_ns`. A full table loses the
    /// sample silently.
    pub fn begin_at(&self, key: u64, ts_ns: u64) {
        if let Some(entry) = self.table.get_or_insert(key) {
            entry.last_delta_ns.store(NO_DELTA, Ordering::Relaxed);
            entry.start_ns.store(ts_ns, Ordering::Release);
        }
    }

    pub fn end(&self, key: u64) -> Option<Duration> {
        self.end_at(key, self.clock.now_ns())
    }

    /// Elapsed time since the last `begin` of `key`. The entry stays in place until
    /// [`destroy`](Self::destroy).
    pub fn end_at(&self, key: u64, ts_ns: u64) -> Option<Duration> {
        let entry = self.table.get(key)?;
        let start = entry.start_ns.load(Ordering::Acquire);
        if start == NOT_BEGUN {
            return None;
        }
        let delta = ts_ns.saturating_sub(start);
        entry.last_delta_ns.store(delta, Ordering::Relaxed);
        Some(Duration::from_nanos(delta))
    }

    /// Delta computed by the most recent `end` of `key`, if any.
    pub fn last_delta(&self, key: u64) -> Option<Duration> {
        let delta = self.table.get(key)?.last_delta_ns.load(Ordering::Relaxed);
        (delta != NO_DELTA).then(|| Duration::from_nanos(delta))
    }

    pub fn destroy(&self, key: u64) {
        self.table.remove(key);
    }

    pub fn contains(&self, key: u64) -> bool {
        self.table.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }
}
