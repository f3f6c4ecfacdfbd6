//! Lock-free open-addressed map from live allocation address to its
//! sampled metadata (spec §4.8). Sized at creation (no resizing — the
//! interposer must never allocate to grow its own bookkeeping) and
//! accessed from many allocating/freeing threads concurrently, with no
//! locks on the hot path.
//!
//! Each slot progresses `EMPTY -> RESERVED -> LIVE -> TOMBSTONE` and
//! never backwards; a `free()` that lands on a `RESERVED` slot (the
//! "death during birth" race: thread A's `malloc` is still publishing
//! metadata when thread B's `free` of that same address — from a
//! *prior* allocation cycle that got reused — arrives) spins briefly on
//! the slot's state rather than tearing anything down, since a
//! `RESERVED` slot is guaranteed to reach `LIVE` in a bounded number of
//! stores by its owning thread.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::packed::PackedMeta;

const STATE_EMPTY: u32 = 0;
const STATE_RESERVED: u32 = 1;
const STATE_LIVE: u32 = 2;
const STATE_TOMBSTONE: u32 = 3;

/// Linear-probe bound before giving up on an insert/lookup (spec §4.8:
/// "bounded probe sequence, default 128").
const PROBE_LIMIT: usize = 128;

#[repr(align(64))]
struct Slot {
    state: AtomicU32,
    /// Bumped on every `EMPTY -> RESERVED` transition; lets a racing
    /// `free()` that read a stale address recognize the slot has moved
    /// on to a new allocation and stop waiting on it.
    sequence: AtomicU32,
    address: AtomicU64,
    meta: AtomicU64,
    birth_ts_ns: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: AtomicU32::new(STATE_EMPTY),
            sequence: AtomicU32::new(0),
            address: AtomicU64::new(0),
            meta: AtomicU64::new(0),
            birth_ts_ns: AtomicU64::new(0),
        }
    }
}

pub struct HeapMap {
    slots: Box<[Slot]>,
    mask: u64,
    len: AtomicU64,
    capacity: usize,
    reserve_failures: AtomicU64,
}

/// A snapshot of one live entry, used for free-side lookup and for the
/// `snapshot()` walk used to build a heap profile.
#[derive(Debug, Clone, Copy)]
pub struct LiveEntry {
    pub address: u64,
    pub meta: PackedMeta,
    pub birth_ts_ns: u64,
}

fn mix64(mut x: u64) -> u64 {
    // SplitMix64 finalizer: cheap, good avalanche, no branching.
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x
}

impl HeapMap {
    /// `capacity` is rounded up to the next power of two; callers should
    /// size generously since this table never grows (spec §4.8 Non-goal:
    /// "resizing the live map").
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.next_power_of_two().max(1024);
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>().into_boxed_slice();
        Self {
            slots,
            mask: (capacity - 1) as u64,
            len: AtomicU64::new(0),
            capacity,
            reserve_failures: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Relaxed)
    }

    /// Phase one of the two-phase insert: claims a slot for `address`
    /// without yet publishing metadata, so a concurrent `free(address)`
    /// that arrives mid-insert has a slot to find and race against
    /// instead of an `EMPTY` one. Returns the slot's sequence number (to
    /// be replayed into [`HeapMap::finalize`]) or `None` (bumping
    /// `reserve_failures`) if the probe sequence is exhausted — the
    /// caller must treat the allocation as unsampled rather than block.
    pub fn reserve(&self, address: u64) -> Option<u32> {
        debug_assert_ne!(address, 0, "heap map never stores the null address");
        let start = (mix64(address) & self.mask) as usize;
        for probe in 0..PROBE_LIMIT {
            let idx = (start + probe) & self.mask as usize;
            let slot = &self.slots[idx];
            let state = slot.state.load(Ordering::Acquire);
            if state == STATE_EMPTY || state == STATE_TOMBSTONE {
                if slot
                    .state
                    .compare_exchange(state, STATE_RESERVED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.address.store(address, Ordering::Relaxed);
                    let seq = slot.sequence.fetch_add(1, Ordering::AcqRel) + 1;
                    return Some(seq);
                }
            }
        }
        self.reserve_failures.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Phase two: publishes metadata for a slot previously claimed by
    /// [`HeapMap::reserve`] (`seq` is the sequence number that call
    /// returned), transitioning it `RESERVED -> LIVE`. Must be called
    /// exactly once per successful `reserve`.
    ///
    /// Returns `false` if a concurrent `free` won the death-during-birth
    /// race first (spec §4.8): the slot was CAS'd `RESERVED -> TOMBSTONE`
    /// out from under this insert, which has abandoned it rather than
    /// resurrect a freed address as live. The caller must treat the
    /// allocation as unsampled in that case.
    pub fn finalize(&self, address: u64, seq: u32, meta: PackedMeta, birth_ts_ns: u64) -> bool {
        let start = (mix64(address) & self.mask) as usize;
        for probe in 0..PROBE_LIMIT {
            let idx = (start + probe) & self.mask as usize;
            let slot = &self.slots[idx];
            if slot.sequence.load(Ordering::Acquire) == seq
                && slot.address.load(Ordering::Relaxed) == address
            {
                slot.meta.store(meta.encode(), Ordering::Relaxed);
                slot.birth_ts_ns.store(birth_ts_ns, Ordering::Relaxed);
                if slot
                    .state
                    .compare_exchange(STATE_RESERVED, STATE_LIVE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                return false;
            }
        }
        debug_assert!(false, "finalize called without a matching reserve");
        false
    }

    /// Sum of every probed slot's sequence counter for `start`'s probe
    /// window. `remove` diffs two of these around a scan that found no
    /// match, to notice a reincarnation (a `reserve` landing in the
    /// window) that raced the scan (spec §4.8 "Sequence number").
    fn probe_sequence_snapshot(&self, start: usize) -> u64 {
        let mut sum = 0u64;
        for probe in 0..PROBE_LIMIT {
            let idx = (start + probe) & self.mask as usize;
            sum = sum.wrapping_add(self.slots[idx].sequence.load(Ordering::Acquire) as u64);
        }
        sum
    }

    /// One linear probe for `address`, CASing it to `TOMBSTONE` if found
    /// live or mid-birth. `Ok` distinguishes "found nothing" (caller may
    /// want to retry) from "found and handled" (whose payload is the
    /// removed entry, or `None` for a won death-during-birth race).
    fn remove_scan(&self, start: usize, address: u64) -> Result<Option<LiveEntry>, ()> {
        for probe in 0..PROBE_LIMIT {
            let idx = (start + probe) & self.mask as usize;
            let slot = &self.slots[idx];
            let state = slot.state.load(Ordering::Acquire);
            if state == STATE_EMPTY {
                continue;
            }
            if slot.address.load(Ordering::Acquire) != address {
                continue;
            }
            if state == STATE_RESERVED {
                if slot
                    .state
                    .compare_exchange(STATE_RESERVED, STATE_TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Won the death-during-birth race: the insert never
                    // published metadata, so there is nothing live to report.
                    return Ok(None);
                }
                // Lost the race — `finalize` beat us to LIVE. Fall through
                // and remove it the ordinary way below.
            }
            if slot.address.load(Ordering::Acquire) != address {
                continue;
            }
            if slot
                .state
                .compare_exchange(STATE_LIVE, STATE_TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let entry = LiveEntry {
                    address,
                    meta: PackedMeta::decode(slot.meta.load(Ordering::Relaxed)),
                    birth_ts_ns: slot.birth_ts_ns.load(Ordering::Relaxed),
                };
                self.len.fetch_sub(1, Ordering::Relaxed);
                return Ok(Some(entry));
            }
        }
        Err(())
    }

    /// Looks up and tombstones the slot for `address`, returning its
    /// metadata if it was live. A slot found in `RESERVED` state for the
    /// same address is the death-during-birth race (spec §4.8): the
    /// allocating thread is still between `reserve` and `finalize`, so
    /// this CASes the slot straight to `TOMBSTONE`, defeating the
    /// in-progress insert's own `RESERVED -> LIVE` CAS rather than
    /// waiting for it — `finalize` observes the lost race and reports
    /// the allocation as unsampled.
    ///
    /// Spec §4.8 "Sequence number": if the first scan finds no match at
    /// all, a reincarnation (some slot's `reserve` landing mid-scan) can
    /// be the reason the probe sequence missed `address`; this retries
    /// once if the probe window's sequence counters moved between the
    /// start and end of the failed scan, and otherwise accepts "not
    /// present" as genuine.
    pub fn remove(&self, address: u64) -> Option<LiveEntry> {
        let start = (mix64(address) & self.mask) as usize;
        let snapshot = self.probe_sequence_snapshot(start);
        if let Ok(result) = self.remove_scan(start, address) {
            return result;
        }
        if self.probe_sequence_snapshot(start) == snapshot {
            return None;
        }
        self.remove_scan(start, address).unwrap_or(None)
    }

    /// Returns every currently-live entry. Used for a heap snapshot
    /// (spec §6.1 `HeapSampler::snapshot`); not safe to call from a
    /// signal/allocator hot path — it walks the whole table.
    pub fn snapshot(&self) -> Vec<LiveEntry> {
        let mut out = Vec::with_capacity(self.len() as usize);
        for slot in self.slots.iter() {
            if slot.state.load(Ordering::Acquire) == STATE_LIVE {
                let address = slot.address.load(Ordering::Acquire);
                if address == 0 {
                    continue;
                }
                out.push(LiveEntry {
                    address,
                    meta: PackedMeta::decode(slot.meta.load(Ordering::Relaxed)),
                    birth_ts_ns: slot.birth_ts_ns.load(Ordering::Relaxed),
                });
            }
        }
        out
    }

    pub fn reserve_failures(&self) -> u64 {
        self.reserve_failures.load(Ordering::Relaxed)
    }

    /// Spec §4.7 "Heap estimation": Σ weight over every currently-live
    /// entry, the unbiased estimator for total sampled live heap bytes.
    /// Not for the hot path — walks the whole table, same as
    /// [`HeapMap::snapshot`].
    pub fn total_live_weight(&self) -> u64 {
        let mut total = 0u64;
        for slot in self.slots.iter() {
            if slot.state.load(Ordering::Acquire) == STATE_LIVE {
                total = total.saturating_add(PackedMeta::decode(slot.meta.load(Ordering::Relaxed)).weight);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(stack_id: u32, size: u64) -> PackedMeta {
        PackedMeta { stack_id, size, weight: size }
    }

    #[test]
    fn reserve_finalize_remove_round_trip() {
        let map = HeapMap::with_capacity(64);
        let seq = map.reserve(0x1000).expect("reserve should succeed");
        assert!(map.finalize(0x1000, seq, meta(1, 128), 42));
        assert_eq!(map.len(), 1);

        let entry = map.remove(0x1000).expect("entry should be live");
        assert_eq!(entry.meta.stack_id, 1);
        assert_eq!(entry.meta.size, 128);
        assert_eq!(entry.birth_ts_ns, 42);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn removing_unknown_address_returns_none() {
        let map = HeapMap::with_capacity(64);
        assert!(map.remove(0xdead).is_none());
    }

    #[test]
    fn tombstoned_slot_is_reusable() {
        let map = HeapMap::with_capacity(64);
        let seq = map.reserve(0x2000).unwrap();
        assert!(map.finalize(0x2000, seq, meta(2, 64), 1));
        map.remove(0x2000).unwrap();

        let seq = map.reserve(0x2000).unwrap();
        assert!(map.finalize(0x2000, seq, meta(3, 256), 2));
        let entry = map.remove(0x2000).unwrap();
        assert_eq!(entry.meta.stack_id, 3);
    }

    #[test]
    fn snapshot_reflects_only_live_entries() {
        let map = HeapMap::with_capacity(64);
        for i in 0..5u64 {
            let addr = 0x3000 + i * 16;
            let seq = map.reserve(addr).unwrap();
            map.finalize(addr, seq, meta(i as u32, 100), i);
        }
        map.remove(0x3000).unwrap();
        let snapshot = map.snapshot();
        assert_eq!(snapshot.len(), 4);
        assert!(snapshot.iter().all(|e| e.address != 0x3000));
    }

    #[test]
    fn total_live_weight_sums_only_live_entries() {
        let map = HeapMap::with_capacity(64);
        for i in 0..4u64 {
            let addr = 0x5000 + i * 16;
            let seq = map.reserve(addr).unwrap();
            // weight is constant per spec §4.7 (the sampling mean at the
            // moment of the sample), independent of this entry's size.
            map.finalize(addr, seq, meta(i as u32, 512 * 1024), i);
        }
        assert_eq!(map.total_live_weight(), 4 * 512 * 1024);
        map.remove(0x5000).unwrap();
        assert_eq!(map.total_live_weight(), 3 * 512 * 1024);
    }

    #[test]
    fn free_that_wins_death_during_birth_defeats_the_finalize() {
        // Simulates §4.8's race directly: reserve, then free before
        // finalize runs. The free must win, and finalize must then
        // report the loss rather than resurrecting the slot as live.
        let map = HeapMap::with_capacity(64);
        let seq = map.reserve(0x4000).unwrap();
        assert!(map.remove(0x4000).is_none(), "free should see no live entry yet");
        assert!(
            !map.finalize(0x4000, seq, meta(9, 32), 7),
            "finalize must lose the race after free tombstoned the slot"
        );
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn remove_finds_nothing_and_does_not_retry_when_sequence_is_unchanged() {
        let map = HeapMap::with_capacity(64);
        let start = (mix64(0x6000) & map.mask) as usize;
        let snapshot = map.probe_sequence_snapshot(start);
        assert!(map.remove_scan(start, 0x6000).is_err(), "nothing was ever reserved at this address");
        assert_eq!(
            map.probe_sequence_snapshot(start),
            snapshot,
            "no concurrent reserve landed in the probe window"
        );
        assert!(map.remove(0x6000).is_none());
    }

    #[test]
    fn remove_retries_and_finds_a_reincarnation_that_raced_the_first_scan() {
        // Spec §4.8 "Sequence number": models a `remove` whose first scan
        // completes with no match because the allocation it is looking
        // for hadn't been reserved yet, and only appears in the probe
        // window afterward. `remove` as a whole must retry once and find
        // it instead of reporting a stale "not present".
        let map = HeapMap::with_capacity(64);
        let address = 0x6000u64;
        let start = (mix64(address) & map.mask) as usize;

        let snapshot = map.probe_sequence_snapshot(start);
        assert!(map.remove_scan(start, address).is_err(), "address not reserved yet");

        let seq = map.reserve(address).unwrap();
        assert!(map.finalize(address, seq, meta(7, 64), 3));
        assert_ne!(
            map.probe_sequence_snapshot(start),
            snapshot,
            "the reserve above must have bumped the slot's sequence"
        );

        let retried = map.remove_scan(start, address).expect("retry must now find the entry");
        let entry = retried.expect("the entry is live, not a death-during-birth race");
        assert_eq!(entry.meta.stack_id, 7);
    }

    #[test]
    fn concurrent_reserve_finalize_remove_many_addresses() {
        use std::sync::Arc;
        let map = Arc::new(HeapMap::with_capacity(4096));
        let mut handles = Vec::new();
        for t in 0..8u64 {
            let map = Arc::clone(&map);
            handles.push(std::thread::spawn(move || {
                for i in 0..200u64 {
                    let addr = 0x10000 + t * 10_000 + i;
                    if let Some(seq) = map.reserve(addr) {
                        assert!(map.finalize(addr, seq, meta(i as u32, 64), i));
                        let entry = map.remove(addr);
                        assert!(entry.is_some());
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.len(), 0);
    }
}
