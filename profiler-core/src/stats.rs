//! Statistics API (spec §4.13): a cheap, lock-light snapshot a host can
//! poll at any time, including while a session is running.

use serde_derive::{Deserialize, Serialize};

/// Estimated fixed per-sample handler overhead in nanoseconds, used only
/// to report an *estimated* total handler time alongside the real
/// counters below. Configuration- and hardware-dependent in reality
/// (spec §9 Open Question); kept as a documented constant rather than
/// measured at runtime, since measuring it accurately from inside the
/// handler would itself perturb the number being measured.
pub const K_HANDLER_NS: u64 = 25;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CpuStats {
    pub samples_captured: u64,
    pub validation_drops: u64,
    pub total_overruns: u64,
    pub create_failures: u64,
    pub registered_threads: usize,
    pub active_threads: usize,
    pub resolver_cache_entries: usize,
    pub ring_len: usize,
    pub ring_dropped_full: u64,
}

impl CpuStats {
    /// Spec §4.13: "estimated total time spent in the signal handler,
    /// `samples_captured * K_HANDLER_NS`".
    pub fn estimated_handler_ns(&self) -> u64 {
        self.samples_captured.saturating_mul(K_HANDLER_NS)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CombinedStats {
    pub cpu: CpuStats,
    pub heap: profiler_heap_sampler_stats::HeapStatsMirror,
}

/// `profiler_heap_sampler::HeapStats` doesn't derive `serde` (same
/// reasoning as `profiler-cpu-sampler`'s resolved types in
/// `crate::profile`), so this module holds the thin serializable mirror.
mod profiler_heap_sampler_stats {
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
    pub struct HeapStatsMirror {
        pub live_entries: u64,
        pub samples_recorded: u64,
        pub frees_observed: u64,
        pub bloom_rejects: u64,
        pub heap_map_reserve_failures: u64,
        pub distinct_stacks: u64,
        pub stack_table_overflows: u64,
        pub bloom_saturation: f64,
        pub bloom_rebuilds: u64,
        pub estimated_heap_bytes: u64,
        pub heap_map_load_percent: f64,
    }

    impl From<profiler_heap_sampler::HeapStats> for HeapStatsMirror {
        fn from(s: profiler_heap_sampler::HeapStats) -> Self {
            Self {
                live_entries: s.live_entries,
                samples_recorded: s.samples_recorded,
                frees_observed: s.frees_observed,
                bloom_rejects: s.bloom_rejects,
                heap_map_reserve_failures: s.heap_map_reserve_failures,
                distinct_stacks: s.distinct_stacks,
                stack_table_overflows: s.stack_table_overflows,
                bloom_saturation: s.bloom_saturation,
                bloom_rebuilds: s.bloom_rebuilds,
                estimated_heap_bytes: s.estimated_heap_bytes,
                heap_map_load_percent: s.heap_map_load_percent,
            }
        }
    }
}

pub use profiler_heap_sampler_stats::HeapStatsMirror;
