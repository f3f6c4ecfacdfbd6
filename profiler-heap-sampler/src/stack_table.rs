//! Lock-free stack interning table (spec §4.9): maps a captured frame
//! sequence to a small `stack_id` so the heap map can store 24 bits
//! instead of a full frame list per live allocation. Starts at a 4Ki
//! initial capacity and grows up to a 64Ki ceiling (spec §4.9); beyond
//! the ceiling, new distinct stacks collapse onto a shared overflow id
//! rather than failing the allocation.
//!
//! Each slot's occupancy lives entirely in one atomic hash field, CAS'd
//! `EMPTY(0) -> CLAIMED(sentinel) -> <published hash>` by whichever
//! thread wins it (spec §4.9: "state transitions EMPTY -> OCCUPIED via
//! CAS on the hash field"); the claiming thread writes the frame data
//! only while the slot is in the transient `CLAIMED` state, so no other
//! thread can observe it until the real hash is published with a
//! release store. Slot *index* never moves once assigned — that's the
//! `stack_id` callers embed in the heap map's packed metadata, so
//! growing the table only ever appends new slots, never relocates old
//! ones. Growth itself takes the table's one lock (a dedicated "write
//! latch", spec §4.9) and is never called from a signal or allocator
//! hot path directly — only from `intern`'s cold path when the current
//! generation is full.
//!
//! Hashing is FNV-1a over the raw frame pointer bytes — the same choice
//! `memscope-rs`'s allocation-path tracker makes for its compact
//! records, for the same reason: it's branch-light and needs no seed
//! material, which matters on a path that must never itself allocate
//! speculatively before deciding to keep the result.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

const INITIAL_CAPACITY: usize = 4096;
const MAX_CAPACITY: usize = 65536;

/// Hard cap on frames stored per interned stack. Matches the native
/// capture buffer `record_allocation` walks into before calling
/// [`StackTable::intern`] (`profiler-heap-sampler::lib`'s
/// `raw_frames: [usize; MAX_STACK_DEPTH]`), so a slot's frame storage can
/// be a fixed-size array rather than a heap-allocated `Vec` — this table
/// lives on the same allocator hot path the rest of this crate keeps
/// allocation-free.
pub const MAX_STACK_DEPTH: usize = 64;

/// Bound on probe length within one generation before giving up and
/// growing (or, at `MAX_CAPACITY`, overflowing). Kept well under a
/// generation's size so a nearly-full table fails fast into growth
/// rather than walking thousands of occupied slots.
const PROBE_LIMIT: usize = 256;

/// Sentinel claimed-but-not-yet-published hash value. A real FNV-1a
/// hash that happens to collide with it is remapped in [`stack_hash`].
const CLAIMED: u64 = u64::MAX;

/// Reserved id returned once the table has hit [`MAX_CAPACITY`] distinct
/// stacks and a brand new one needs interning (spec §4.9 edge case:
/// "stack table exhausted"). Samples recorded against it are still
/// counted in aggregate byte/count totals, just without per-stack
/// attribution.
pub const OVERFLOW_STACK_ID: u32 = u32::MAX;

fn fnv1a(frames: &[usize]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &frame in frames {
        for byte in frame.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hash
}

/// FNV-1a hash of `frames`, remapped away from the two sentinel values
/// (`0` = empty, [`CLAIMED`] = publishing-in-progress) so a real stack
/// can never be mistaken for slot state.
fn stack_hash(frames: &[usize]) -> u64 {
    match fnv1a(frames) {
        0 => 1,
        CLAIMED => CLAIMED - 1,
        other => other,
    }
}

/// One interning slot. `frame_count`/`frames` are written exactly once,
/// by the thread that wins the `EMPTY -> CLAIMED` CAS on `hash`, strictly
/// before that thread's `CLAIMED -> <hash>` release store — so any reader
/// that observes a non-zero, non-`CLAIMED` hash via an acquire load is
/// guaranteed to see fully-written frame data. `frames` is a fixed-size
/// array rather than a `Vec` so claiming a slot never allocates.
struct Slot {
    hash: AtomicU64,
    frame_count: UnsafeCell<u16>,
    frames: UnsafeCell<[usize; MAX_STACK_DEPTH]>,
}

// Safety: `frame_count`/`frames` are written once by the single thread
// that wins the slot's claim CAS, before any other thread can observe a
// hash that would make it read that slot's fields; after publication the
// slot is never mutated again (see module docs).
unsafe impl Sync for Slot {}

impl Slot {
    fn empty() -> Self {
        Self {
            hash: AtomicU64::new(0),
            frame_count: UnsafeCell::new(0),
            frames: UnsafeCell::new([0; MAX_STACK_DEPTH]),
        }
    }
}

struct Inner {
    /// `slots[i]` is the permanent home of `stack_id == i`; `Vec::push`
    /// during growth may move the backing allocation, but every
    /// existing slot's *index* — the only thing callers ever see as a
    /// `stack_id` — never changes. All growth happens under the write
    /// half of `StackTable::inner`'s `RwLock`, so no reader ever
    /// observes a half-grown vector.
    slots: Vec<Slot>,
}

pub struct StackTable {
    inner: RwLock<Inner>,
    overflow_count: AtomicUsize,
    occupied_count: AtomicUsize,
}

impl StackTable {
    pub fn new() -> Self {
        let slots = (0..INITIAL_CAPACITY).map(|_| Slot::empty()).collect();
        Self {
            inner: RwLock::new(Inner { slots }),
            overflow_count: AtomicUsize::new(0),
            occupied_count: AtomicUsize::new(0),
        }
    }

    /// Interns `frames`, returning its stable `stack_id`, or
    /// [`OVERFLOW_STACK_ID`] if the table has hit [`MAX_CAPACITY`] and
    /// `frames` is new. `frames` must be no longer than
    /// [`MAX_STACK_DEPTH`] — every caller in this crate captures into a
    /// buffer already bounded by it.
    pub fn intern(&self, frames: &[usize]) -> u32 {
        debug_assert!(frames.len() <= MAX_STACK_DEPTH, "frames exceeds MAX_STACK_DEPTH");
        let hash = stack_hash(frames);
        loop {
            {
                let inner = self.inner.read().unwrap();
                match self.probe(&inner.slots, hash, frames) {
                    ProbeResult::Found(id) => return id,
                    ProbeResult::Claimed(id) => {
                        self.occupied_count.fetch_add(1, Ordering::Relaxed);
                        return id;
                    }
                    ProbeResult::GenerationFull => {
                        if inner.slots.len() >= MAX_CAPACITY {
                            self.overflow_count.fetch_add(1, Ordering::Relaxed);
                            return OVERFLOW_STACK_ID;
                        }
                        // Fall through to grow below, after dropping the read guard.
                    }
                }
            }
            self.grow();
        }
    }

    /// Scans the probe sequence for `(hash, frames)` in `slots`, either
    /// finding an existing match, winning an empty slot and publishing
    /// into it, or reporting the generation exhausted (caller grows and
    /// retries against the larger table).
    fn probe(&self, slots: &[Slot], hash: u64, frames: &[usize]) -> ProbeResult {
        if slots.is_empty() {
            return ProbeResult::GenerationFull;
        }
        let start = (hash as usize) % slots.len();
        let steps = PROBE_LIMIT.min(slots.len());
        for step in 0..steps {
            let idx = (start + step) % slots.len();
            let slot = &slots[idx];
            let observed = slot.hash.load(Ordering::Acquire);
            if observed == hash {
                // Safety: `observed == hash` (a non-zero, non-`CLAIMED`
                // value) was read with Acquire ordering, which
                // happens-after the publishing thread's Release store —
                // so the frame_count/frames writes below that store are
                // visible here.
                let len = unsafe { *slot.frame_count.get() } as usize;
                let existing = unsafe { &(*slot.frames.get())[..len] };
                if existing == frames {
                    return ProbeResult::Found(idx as u32);
                }
                continue; // hash collision on a different stack
            }
            if observed == 0 {
                if slot.hash.compare_exchange(0, CLAIMED, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    // Safety: we just won the only CAS that can transition
                    // this slot out of EMPTY; no other thread will touch
                    // `frame_count`/`frames` until our release store below
                    // publishes it.
                    let len = frames.len().min(MAX_STACK_DEPTH);
                    unsafe {
                        (*slot.frames.get())[..len].copy_from_slice(&frames[..len]);
                        *slot.frame_count.get() = len as u16;
                    }
                    slot.hash.store(hash, Ordering::Release);
                    return ProbeResult::Claimed(idx as u32);
                }
                // Lost the claim race; the winner may not have published
                // yet. Keep probing rather than spin on this slot — a
                // transient duplicate entry elsewhere is an accepted race
                // outcome per spec §4.9.
                continue;
            }
            if observed == CLAIMED {
                // Another thread is mid-publish for some (possibly
                // different) stack; skip it.
                continue;
            }
            // Occupied by a different stack's hash.
        }
        ProbeResult::GenerationFull
    }

    /// Doubles the table's slot count (capped at [`MAX_CAPACITY`]) under
    /// the write half of the lock — spec §4.9's "dedicated write latch",
    /// taken only from `intern`'s cold path, never a signal handler.
    /// Existing slots are never moved or touched; only new, empty slots
    /// are appended.
    fn grow(&self) {
        let mut inner = self.inner.write().unwrap();
        if inner.slots.len() >= MAX_CAPACITY {
            return;
        }
        let new_len = (inner.slots.len() * 2).min(MAX_CAPACITY);
        inner.slots.extend((inner.slots.len()..new_len).map(|_| Slot::empty()));
    }

    pub fn frames_for(&self, stack_id: u32) -> Option<Vec<usize>> {
        if stack_id == OVERFLOW_STACK_ID {
            return None;
        }
        let inner = self.inner.read().unwrap();
        let slot = inner.slots.get(stack_id as usize)?;
        if slot.hash.load(Ordering::Acquire) == 0 {
            return None;
        }
        // Safety: a non-zero hash was already observed above with
        // Acquire ordering, so the one-time frame_count/frames writes are
        // visible. The returned `Vec` is built here, on this cold
        // resolver-facing path — the slot itself never allocates.
        let len = unsafe { *slot.frame_count.get() } as usize;
        Some(unsafe { (*slot.frames.get())[..len].to_vec() })
    }

    pub fn len(&self) -> usize {
        self.occupied_count.load(Ordering::Relaxed)
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

enum ProbeResult {
    Found(u32),
    Claimed(u32),
    GenerationFull,
}

impl Default for StackTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_stacks_intern_to_the_same_id() {
        let table = StackTable::new();
        let a = table.intern(&[1, 2, 3]);
        let b = table.intern(&[1, 2, 3]);
        assert_eq!(a, b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_stacks_get_distinct_ids() {
        let table = StackTable::new();
        let a = table.intern(&[1, 2, 3]);
        let b = table.intern(&[1, 2, 4]);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn frames_for_round_trips() {
        let table = StackTable::new();
        let id = table.intern(&[10, 20, 30]);
        assert_eq!(table.frames_for(id), Some(vec![10, 20, 30]));
    }

    #[test]
    fn unknown_stack_id_returns_none() {
        let table = StackTable::new();
        assert_eq!(table.frames_for(12345), None);
    }

    #[test]
    fn table_grows_past_initial_capacity() {
        let table = StackTable::new();
        for i in 0..(INITIAL_CAPACITY + 500) {
            let id = table.intern(&[i]);
            assert_ne!(id, OVERFLOW_STACK_ID);
        }
        assert_eq!(table.len(), INITIAL_CAPACITY + 500);
        // Stacks interned before growth are still found at their
        // original id, since growth only appends — it never relocates.
        assert_eq!(table.frames_for(0), Some(vec![0usize]));
    }

    #[test]
    fn overflow_past_max_capacity_returns_overflow_id() {
        let table = StackTable::new();
        for i in 0..MAX_CAPACITY {
            let id = table.intern(&[i]);
            assert_ne!(id, OVERFLOW_STACK_ID);
        }
        let overflowed = table.intern(&[usize::MAX]);
        assert_eq!(overflowed, OVERFLOW_STACK_ID);
        assert_eq!(table.overflow_count(), 1);
    }

    #[test]
    fn concurrent_interning_of_shared_and_distinct_stacks() {
        use std::sync::Arc;
        let table = Arc::new(StackTable::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                let shared_id = table.intern(&[1, 2, 3]);
                let unique_id = table.intern(&[100 + t, 200 + t]);
                (shared_id, unique_id)
            }));
        }
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let shared_ids: std::collections::HashSet<_> = results.iter().map(|(s, _)| *s).collect();
        assert_eq!(shared_ids.len(), 1, "shared stack should intern to one id");
    }

    #[test]
    fn concurrent_growth_preserves_earlier_ids() {
        use std::sync::Arc;
        let table = Arc::new(StackTable::new());
        let first_id = table.intern(&[999]);

        let mut handles = Vec::new();
        for t in 0..8u64 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for i in 0..(INITIAL_CAPACITY / 4) {
                    table.intern(&[t as usize, i]);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.frames_for(first_id), Some(vec![999usize]));
    }
}
