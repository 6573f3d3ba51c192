//! Fixed-capacity, lock-free keyed table.
//!
//! Open addressing over a pre-allocated slot array. Each slot owns a key word and an
//! inline value made of atomics, so values are never freed and readers never chase
//! pointers. Lookups and inserts touch at most `probe_limit` slots.
//!
//! Insertion claims a free slot with a single CAS on the key word and then zeroes the
//! value. A context that found the key between those two steps may see its increment
//! wiped by the zeroing; that loss is accepted in exchange for never blocking.
//!
//! The two key words that mark empty and deleted slots live in dedicated side slots,
//! so every `u64` is a valid key.

use std::hash::BuildHasher;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

const EMPTY: u64 = 0;
const TOMBSTONE: u64 = u64::MAX;

/// Longest probe sequence examined by any operation.
pub const MAX_PROBE: usize = 64;

/// Value stored inline in a table slot.
pub trait SlotValue: Default + Send + Sync {
    /// Return every field to its zero state.
    fn reset(&self);
}

struct Slot<V> {
    key: AtomicU64,
    value: V,
}

/// Home of a key equal to one of the marker words.
#[derive(Default)]
struct SideSlot<V> {
    live: AtomicBool,
    value: V,
}

pub struct KeyedTable<V> {
    slots: Box<[Slot<V>]>,
    /// Keys `EMPTY` and `TOMBSTONE`, in that order.
    side: [SideSlot<V>; 2],
    mask: usize,
    probe_limit: usize,
    max_entries: usize,
    live: AtomicUsize,
    hasher: ahash::RandomState,
}

impl<V: SlotValue> KeyedTable<V> {
    /// Table holding at most `max_entries` live keys. The slot array is sized to keep
    /// the load factor at or below one half.
    pub fn with_capacity(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        let slot_count = (max_entries * 2).next_power_of_two();
        let slots = (0..slot_count)
            .map(|_| Slot {
                key: AtomicU64::new(EMPTY),
                value: V::default(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            side: [SideSlot::default(), SideSlot::default()],
            mask: slot_count - 1,
            probe_limit: slot_count.min(MAX_PROBE),
            max_entries,
            live: AtomicUsize::new(0),
            hasher: ahash::RandomState::with_seeds(
                0x243f_6a88_85a3_08d3,
                0x1319_8a2e_0370_7344,
                0xa409_3822_299f_31d0,
                0x082e_fa98_ec4e_6c89,
            ),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Approximate number of live keys.
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: u64) -> Option<&V> {
        if let Some(side) = self.side_slot(key) {
            return side.live.load(Ordering::Acquire).then_some(&side.value);
        }
        self.find(key, usize::MAX).map(|slot| &slot.value)
    }

    /// Existing value for `key`, or a freshly zeroed one. `None` when no free slot is
    /// reachable; callers treat that as a lost sample.
    pub fn get_or_insert(&self, key: u64) -> Option<&V> {
        if let Some(value) = self.get(key) {
            return Some(value);
        }
        if self.len() >= self.max_entries {
            return None;
        }
        if let Some(side) = self.side_slot(key) {
            return Some(self.claim_side(side));
        }

        for (pos, slot) in self.probe(key).enumerate() {
            let mut current = slot.key.load(Ordering::Acquire);
            loop {
                if current == key {
                    return Some(&slot.value);
                }
                if current != EMPTY && current != TOMBSTONE {
                    break;
                }
                match slot.key.compare_exchange(
                    current,
                    key,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(self.settle_claim(key, pos, slot)),
                    Err(observed) => current = observed,
                }
            }
        }
        None
    }

    /// Removes every copy of `key` in its probe window. Returns whether anything was
    /// removed; removing an absent key is a no-op.
    pub fn remove(&self, key: u64) -> bool {
        if let Some(side) = self.side_slot(key) {
            if side
                .live
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            side.value.reset();
            self.live.fetch_sub(1, Ordering::Relaxed);
            return true;
        }

        let mut removed = false;
        for slot in self.probe(key) {
            match slot.key.load(Ordering::Acquire) {
                k if k == key => {
                    if slot
                        .key
                        .compare_exchange(key, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        slot.value.reset();
                        self.live.fetch_sub(1, Ordering::Relaxed);
                        removed = true;
                    }
                }
                EMPTY => break,
                _ => {}
            }
        }
        removed
    }

    /// Live `(key, value)` pairs at the time each slot is visited.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> + '_ {
        let side = [EMPTY, TOMBSTONE]
            .into_iter()
            .zip(self.side.iter())
            .filter(|(_, side)| side.live.load(Ordering::Acquire))
            .map(|(key, side)| (key, &side.value));
        let slots = self.slots.iter().filter_map(|slot| {
            let key = slot.key.load(Ordering::Acquire);
            is_slot_key(key).then_some((key, &slot.value))
        });
        side.chain(slots)
    }

    fn side_slot(&self, key: u64) -> Option<&SideSlot<V>> {
        match key {
            EMPTY => Some(&self.side[0]),
            TOMBSTONE => Some(&self.side[1]),
            _ => None,
        }
    }

    fn claim_side<'a>(&self, side: &'a SideSlot<V>) -> &'a V {
        if side
            .live
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            side.value.reset();
            self.live.fetch_add(1, Ordering::Relaxed);
        }
        &side.value
    }

    /// Finishes a claim of `slot` at probe position `pos`. A concurrent insert may
    /// have placed `key` elsewhere in the window meanwhile; the claim then steps back
    /// and the other copy wins, so a key never stays live in two slots.
    fn settle_claim<'a>(&'a self, key: u64, pos: usize, slot: &'a Slot<V>) -> &'a V {
        slot.value.reset();
        match self.find(key, pos) {
            Some(other) => {
                let _ = slot.key.compare_exchange(
                    key,
                    TOMBSTONE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                &other.value
            }
            None => {
                self.live.fetch_add(1, Ordering::Relaxed);
                &slot.value
            }
        }
    }

    /// First slot holding `key`, skipping probe position `skip`. Plain lookups stop
    /// at the first empty slot; `skip` is only set by a claim, which scans the whole
    /// window.
    fn find(&self, key: u64, skip: usize) -> Option<&Slot<V>> {
        let lookup = skip == usize::MAX;
        for (pos, slot) in self.probe(key).enumerate() {
            if pos == skip {
                continue;
            }
            match slot.key.load(Ordering::Acquire) {
                k if k == key => return Some(slot),
                EMPTY if lookup => return None,
                _ => {}
            }
        }
        None
    }

    fn probe(&self, key: u64) -> impl Iterator<Item = &Slot<V>> + '_ {
        let home = self.hasher.hash_one(key) as usize & self.mask;
        (0..self.probe_limit).map(move |i| &self.slots[(home + i) & self.mask])
    }
}

#[inline]
fn is_slot_key(key: u64) -> bool {
    key != EMPTY && key != TOMBSTONE
}
