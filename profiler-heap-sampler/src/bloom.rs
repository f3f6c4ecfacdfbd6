//! Free-path fast-reject Bloom filter (spec §4.10): before `free()`
//! pays for a [`crate::heap_map::HeapMap`] probe, it checks this filter
//! — if the address definitely was never sampled, the free-path exits
//! immediately. False positives fall through to the real lookup (which
//! correctly reports "not found"); false negatives are impossible by
//! construction.
//!
//! Backed by a flat `~1 Mbit` array (128 KiB) of atomically-or'd bits
//! and `k = 4` double-hashed probe bits per insert/check, following the
//! classic Kirsch-Mitzenmacher double-hashing construction (derive bit
//! `i` from `h1 + i * h2` rather than `k` independent hash functions).
//! Rebuilt wholesale (new array swapped in behind an atomic pointer)
//! whenever the Heap Sampler session restarts, since the filter has no
//! way to un-set a bit on `free()` without risking a false negative for
//! some other still-live address that hashed to the same bit.

use std::sync::atomic::{AtomicU64, AtomicPtr, Ordering};

const BIT_COUNT: usize = 1 << 20; // ~1 Mbit, per spec §4.10.
const WORD_COUNT: usize = BIT_COUNT / 64;
const K: u32 = 4;

struct Filter {
    words: Vec<AtomicU64>,
}

impl Filter {
    fn new() -> Self {
        let mut words = Vec::with_capacity(WORD_COUNT);
        words.resize_with(WORD_COUNT, || AtomicU64::new(0));
        Self { words }
    }

    fn bit_positions(address: u64) -> [usize; K as usize] {
        let h1 = mix64(address);
        let h2 = mix64(address ^ 0x9E3779B97F4A7C15) | 1; // odd step, full coverage.
        let mut positions = [0usize; K as usize];
        for (i, slot) in positions.iter_mut().enumerate() {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            *slot = (combined as usize) & (BIT_COUNT - 1);
        }
        positions
    }

    fn insert(&self, address: u64) {
        for bit in Self::bit_positions(address) {
            let word_idx = bit / 64;
            let mask = 1u64 << (bit % 64);
            self.words[word_idx].fetch_or(mask, Ordering::Relaxed);
        }
    }

    fn might_contain(&self, address: u64) -> bool {
        Self::bit_positions(address)
            .iter()
            .all(|&bit| {
                let word_idx = bit / 64;
                let mask = 1u64 << (bit % 64);
                self.words[word_idx].load(Ordering::Relaxed) & mask != 0
            })
    }

    /// Fraction of bits currently set, `0.0..=1.0` — the saturation
    /// estimate spec §4.10's background rebuild policy triggers on.
    fn population(&self) -> f64 {
        let set: u32 = self.words.iter().map(|w| w.load(Ordering::Relaxed).count_ones()).sum();
        set as f64 / BIT_COUNT as f64
    }
}

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

/// Swappable-at-restart wrapper: `reset()` replaces the filter instance
/// wholesale behind an atomic pointer rather than clearing bits in
/// place, so a concurrent `might_contain` reader never observes a
/// filter that's half-cleared.
pub struct AddressBloom {
    current: AtomicPtr<Filter>,
}

impl AddressBloom {
    pub fn new() -> Self {
        Self {
            current: AtomicPtr::new(Box::into_raw(Box::new(Filter::new()))),
        }
    }

    pub fn insert(&self, address: u64) {
        let filter = unsafe { &*self.current.load(Ordering::Acquire) };
        filter.insert(address);
    }

    /// `false` is a proof the address was never sampled; `true` means
    /// "maybe — go check the real map."
    pub fn might_contain(&self, address: u64) -> bool {
        let filter = unsafe { &*self.current.load(Ordering::Acquire) };
        filter.might_contain(address)
    }

    /// Replaces the filter with a fresh, empty one. Intended for use
    /// between profiling sessions (spec §4.10: rebuilt per session
    /// rather than ever cleared bit-by-bit). The old filter is leaked
    /// deliberately rather than freed: a concurrent reader may still
    /// hold a reference to it, and resets are rare enough (once per
    /// session start) that this is not a practical leak.
    pub fn reset(&self) {
        let new_filter = Box::into_raw(Box::new(Filter::new()));
        self.current.store(new_filter, Ordering::Release);
    }

    /// Estimated fraction of bits set in the active filter (spec §4.13
    /// `bloom_saturation`).
    pub fn saturation(&self) -> f64 {
        let filter = unsafe { &*self.current.load(Ordering::Acquire) };
        filter.population()
    }

    /// Background rebuild (spec §4.10): builds a fresh filter containing
    /// exactly `live_addresses`, then atomically swaps it in. The old
    /// filter is intentionally leaked — the same reasoning as
    /// [`AddressBloom::reset`]: an in-flight `might_contain` reader may
    /// still hold the old pointer, and this runs rarely (only once
    /// saturation crosses the threshold), so reclaiming it isn't worth
    /// the synchronization to prove no reader is still in it.
    pub fn rebuild_from(&self, live_addresses: impl Iterator<Item = u64>) {
        let filter = Filter::new();
        for address in live_addresses {
            filter.insert(address);
        }
        let new_filter = Box::into_raw(Box::new(filter));
        self.current.store(new_filter, Ordering::Release);
    }
}

impl Default for AddressBloom {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddressBloom {
    fn drop(&mut self) {
        let ptr = self.current.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}
