//! Fixed-band latency histograms, per entity and global.
//!
//! Entity records live in a [`KeyedTable`] and come and go with their owner. The global
//! record is split into cache-padded shards indexed by CPU so concurrent observers do
//! not contend on one line; readers sum the shards.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use hivepf_common::{LATENCY_BANDS, LatencyStat, latency_band};

use super::table::{KeyedTable, SlotValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchKind {
    Voluntary,
    Involuntary,
}

/// Live histogram record. Counters only ever grow while the record exists.
#[derive(Default)]
pub struct HistogramRecord {
    nvcsw: AtomicU64,
    nivcsw: AtomicU64,
    nlat: [AtomicU64; LATENCY_BANDS],
}

impl HistogramRecord {
    #[inline]
    fn add_band(&self, band: usize) {
        self.nlat[band].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn add_switch(&self, kind: SwitchKind) {
        match kind {
            SwitchKind::Voluntary => self.nvcsw.fetch_add(1, Ordering::Relaxed),
            SwitchKind::Involuntary => self.nivcsw.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> LatencyStat {
        let mut nlat = [0u64; LATENCY_BANDS];
        for (out, counter) in nlat.iter_mut().zip(self.nlat.iter()) {
            *out = counter.load(Ordering::Relaxed);
        }
        LatencyStat {
            nvcsw: self.nvcsw.load(Ordering::Relaxed),
            nivcsw: self.nivcsw.load(Ordering::Relaxed),
            nlat,
        }
    }
}

impl SlotValue for HistogramRecord {
    fn reset(&self) {
        self.nvcsw.store(0, Ordering::Relaxed);
        self.nivcsw.store(0, Ordering::Relaxed);
        for counter in &self.nlat {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

pub struct HistogramAggregator {
    entities: KeyedTable<HistogramRecord>,
    global: Box<[CachePadded<HistogramRecord>]>,
}

impl HistogramAggregator {
    pub fn new(entity_capacity: usize, shards: usize) -> Self {
        let global = (0..shards.max(1))
            .map(|_| CachePadded::new(HistogramRecord::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            entities: KeyedTable::with_capacity(entity_capacity),
            global,
        }
    }

    /// Observe on the calling thread's shard.
    pub fn observe(&self, entity: u64, duration: Duration) -> bool {
        self.observe_on(thread_shard(), entity, duration)
    }

    /// Counts `duration` in its band for `entity` and the global record. Returns
    /// `false` (and counts nothing) when the entity record cannot be created.
    pub fn observe_on(&self, cpu: u32, entity: u64, duration: Duration) -> bool {
        let Some(record) = self.entities.get_or_insert(entity) else {
            return false;
        };
        let band = latency_band(duration_ns(duration));
        record.add_band(band);
        self.shard(cpu).add_band(band);
        true
    }

    /// Counts a context switch for `entity` and the global record.
    pub fn record_switch(&self, cpu: u32, entity: u64, kind: SwitchKind) -> bool {
        let Some(record) = self.entities.get_or_insert(entity) else {
            return false;
        };
        record.add_switch(kind);
        self.shard(cpu).add_switch(kind);
        true
    }

    pub fn get_or_create(&self, entity: u64) -> Option<&HistogramRecord> {
        self.entities.get_or_insert(entity)
    }

    /// Drops the record of a destroyed entity. No-op when absent.
    pub fn delete(&self, entity: u64) -> bool {
        self.entities.remove(entity)
    }

    pub fn get(&self, entity: u64) -> Option<LatencyStat> {
        self.entities.get(entity).map(HistogramRecord::snapshot)
    }

    pub fn global(&self) -> LatencyStat {
        self.global
            .iter()
            .fold(LatencyStat::default(), |mut acc, shard| {
                acc.merge(&shard.snapshot());
                acc
            })
    }

    pub fn entities(&self) -> Vec<(u64, LatencyStat)> {
        self.entities
            .iter()
            .map(|(key, record)| (key, record.snapshot()))
            .collect()
    }

    pub fn shard_count(&self) -> usize {
        self.global.len()
    }

    #[inline]
    fn shard(&self, cpu: u32) -> &HistogramRecord {
        &self.global[cpu as usize % self.global.len()]
    }
}

fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SHARD: Cell<Option<u32>> = const { Cell::new(None) };
}

fn thread_shard() -> u32 {
    SHARD.with(|shard| match shard.get() {
        Some(index) => index,
        None => {
            let index = NEXT_SHARD.fetch_add(1, Ordering::Relaxed) as u32;
            shard.set(Some(index));
            index
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hivepf_common::LATENCY_BOUNDS_NS;
    use proptest::prelude::*;
    use std::sync::Arc;

    const MS: u64 = 1_000_000;

    #[test]
    fn test_observe_buckets_entity_and_global() {
        let agg = HistogramAggregator::new(16, 4);
        agg.observe_on(0, 100, Duration::from_millis(3));
        agg.observe_on(1, 100, Duration::from_millis(12));
        agg.observe_on(2, 200, Duration::from_millis(25));
        agg.observe_on(3, 200, Duration::from_millis(80));

        assert_eq!(agg.get(100).unwrap().nlat, [1, 1, 0, 0]);
        assert_eq!(agg.get(200).unwrap().nlat, [0, 0, 1, 1]);
        assert_eq!(agg.global().nlat, [1, 1, 1, 1]);
    }

    #[test]
    fn test_global_equals_sum_of_entities() {
        let agg = HistogramAggregator::new(64, 8);
        for i in 0..500u64 {
            let entity = i % 7 + 1;
            agg.observe_on(i as u32, entity, Duration::from_nanos(i * 137 * MS / 10));
            let kind = if i % 3 == 0 {
                SwitchKind::Involuntary
            } else {
                SwitchKind::Voluntary
            };
            agg.record_switch(i as u32, entity, kind);
        }

        let mut sum = LatencyStat::default();
        for (_, stat) in agg.entities() {
            sum.merge(&stat);
        }
        assert_eq!(sum, agg.global());
        assert_eq!(agg.global().total_samples(), 500);
    }

    #[test]
    fn test_delete_then_recreate_is_zeroed() {
        let agg = HistogramAggregator::new(16, 1);
        agg.observe_on(0, 5, Duration::from_millis(1));
        agg.record_switch(0, 5, SwitchKind::Voluntary);
        assert!(agg.delete(5));
        assert!(agg.get(5).is_none());
        assert!(!agg.delete(5));

        let fresh = agg.get_or_create(5).unwrap().snapshot();
        assert_eq!(fresh, LatencyStat::default());
        // the global record keeps history
        assert_eq!(agg.global().nlat[0], 1);
        assert_eq!(agg.global().nvcsw, 1);
    }

    #[test]
    fn test_full_entity_table_skips_both_records() {
        let agg = HistogramAggregator::new(1, 1);
        assert!(agg.observe_on(0, 1, Duration::from_millis(1)));
        assert!(!agg.observe_on(0, 2, Duration::from_millis(1)));
        assert!(!agg.record_switch(0, 2, SwitchKind::Involuntary));
        assert_eq!(agg.global().total_samples(), 1);
        assert_eq!(agg.global().nivcsw, 0);
    }

    #[test]
    fn test_entity_zero_is_tracked() {
        let agg = HistogramAggregator::new(4, 1);
        assert!(agg.observe_on(0, 0, Duration::from_millis(1)));
        assert!(agg.record_switch(0, 0, SwitchKind::Involuntary));
        let stat = agg.get(0).unwrap();
        assert_eq!(stat.nlat, [1, 0, 0, 0]);
        assert_eq!(stat.nivcsw, 1);
        assert_eq!(agg.entities().len(), 1);
        assert!(agg.delete(0));
    }

    #[test]
    fn test_observe_uses_thread_shard() {
        let agg = Arc::new(HistogramAggregator::new(16, 4));
        agg.get_or_create(9);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        agg.observe(9, Duration::from_millis(15));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(agg.global().nlat[1], 1_000);
        assert_eq!(agg.get(9).unwrap().nlat[1], 1_000);
        assert_eq!(agg.shard_count(), 4);
    }

    proptest! {
        #[test]
        fn prop_band_matches_bounds(ns in 0u64..200 * MS) {
            let agg = HistogramAggregator::new(4, 1);
            agg.observe_on(0, 1, Duration::from_nanos(ns));
            let nlat = agg.get(1).unwrap().nlat;
            let band = nlat.iter().position(|&n| n == 1).unwrap();
            prop_assert_eq!(nlat.iter().sum::<u64>(), 1);
            if band > 0 {
                prop_assert!(ns >= LATENCY_BOUNDS_NS[band - 1]);
            }
            if band < LATENCY_BOUNDS_NS.len() {
                prop_assert!(ns < LATENCY_BOUNDS_NS[band]);
            }
        }
    }
}
