//! Host-facing CPU sampler surface (spec §6.1's `cpu.*` operation
//! table). A thin wrapper over [`crate::lifecycle::Lifecycle`]: this
//! module owns the public types and argument validation, `lifecycle`
//! owns the actual start/stop choreography.

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::LifecycleError;
use crate::lifecycle::{HostCollaborators, Lifecycle};
use crate::profile::Profile;
use crate::stats::CpuStats;

/// Minimum sampling interval the host may request (spec §6.1:
/// "interval ns (≥1 ms default 10 ms)").
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);

/// One `RawSample` slot's footprint, used only to translate a host's
/// memory cap into a ring capacity (spec §6.1 `cpu.start`'s "memory
/// cap" input; spec §4.2 fixes the ring's slot size at
/// `size_of::<RawSample>()`, so a byte budget translates directly into
/// a slot count).
const RAW_SAMPLE_BYTES: usize = std::mem::size_of::<profiler_ring::RawSample>();

/// Default ring capacity (spec §4.2: "power of two, default 2^16").
const DEFAULT_RING_CAPACITY: usize = 1 << 16;

/// `cpu.start`'s arguments (spec §6.1).
#[derive(Clone)]
pub struct CpuStartConfig {
    pub interval: Duration,
    /// Upper bound, in bytes, on the ring buffer's backing storage.
    /// Rounded down to the nearest power-of-two slot count; `None` uses
    /// the spec's documented default of 2^16 slots.
    pub memory_cap_bytes: Option<usize>,
    /// Where the host wrapper intends to write formatted output once
    /// [`CpuSampler::stop`] returns a [`Profile`] (spec §1: output
    /// formatters are an external collaborator). This crate never opens
    /// or writes the path itself — it is carried through unchanged so
    /// the host doesn't need a side channel to remember it.
    pub output_path: Option<PathBuf>,
}

impl Default for CpuStartConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            memory_cap_bytes: None,
            output_path: None,
        }
    }
}

fn ring_capacity_for(memory_cap_bytes: Option<usize>) -> usize {
    match memory_cap_bytes {
        None => DEFAULT_RING_CAPACITY,
        Some(bytes) => {
            let slots = (bytes / RAW_SAMPLE_BYTES).next_power_of_two();
            slots.clamp(16, DEFAULT_RING_CAPACITY)
        }
    }
}

/// The CPU sampler's host-facing handle (spec §6.1's `cpu.*` row).
/// Long-lived: construct once per host runtime with its
/// [`HostCollaborators`], then `start`/`stop`/`pause`/`resume` across
/// however many profiling sessions the host wants.
pub struct CpuSampler {
    lifecycle: Lifecycle,
    output_path: Mutex<Option<PathBuf>>,
}

impl CpuSampler {
    pub fn new(collaborators: HostCollaborators) -> Self {
        Self {
            lifecycle: Lifecycle::new(collaborators, DEFAULT_RING_CAPACITY),
            output_path: Mutex::new(None),
        }
    }

    /// `cpu.start` (spec §6.1): errors are "already-running,
    /// invalid-interval, permission" — invalid-interval is checked here
    /// before anything is allocated; the other two surface from
    /// [`Lifecycle::start`].
    pub fn start(&self, config: CpuStartConfig) -> Result<(), LifecycleError> {
        if config.interval < MIN_INTERVAL {
            return Err(LifecycleError::InvalidInterval);
        }
        let ring_capacity = ring_capacity_for(config.memory_cap_bytes);
        *self.output_path.lock() = config.output_path;
        self.lifecycle.start(config.interval, Some(ring_capacity))
    }

    /// `cpu.stop` (spec §6.1): "not-running" is the only error.
    pub fn stop(&self) -> Result<Profile, LifecycleError> {
        let mut profile = self.lifecycle.stop()?;
        profile.output_path = self.output_path.lock().take();
        Ok(profile)
    }

    pub fn pause(&self) -> Result<(), LifecycleError> {
        self.lifecycle.pause(DEFAULT_INTERVAL)
    }

    pub fn resume(&self) -> Result<(), LifecycleError> {
        // The interval the session is actually running at, not
        // `DEFAULT_INTERVAL` — resuming must re-arm at the same rate
        // pause froze, which `Lifecycle::resume` ignores in favor of
        // asking the registry to restore each timer's own saved
        // interval (spec §4.4 "Active flag tracks the last requested
        // state").
        let interval = self.lifecycle.current_interval().unwrap_or(DEFAULT_INTERVAL);
        self.lifecycle.resume(interval)
    }

    pub fn is_active(&self) -> bool {
        matches!(self.lifecycle.state(), crate::lifecycle::State::Running)
    }

    /// `cpu.register_thread` (spec §6.1, input: "TID"). On Linux, any
    /// thread's numeric TID can be armed via `SIGEV_THREAD_ID`, so `tid`
    /// may name any thread in the process. The non-Linux fallback timer
    /// (`profiler_cpu_sampler::timer::fallback`) signals a `pthread_t`,
    /// which cannot be derived from a bare TID — there only the calling
    /// thread can register itself, and a mismatched `tid` is rejected
    /// rather than silently registering the wrong thread.
    pub fn register_thread(&self, tid: u64) -> Result<(), LifecycleError> {
        let registry = self.lifecycle.registry().ok_or(LifecycleError::CpuNotRunning)?;
        let interval = self.lifecycle.current_interval().ok_or(LifecycleError::CpuNotRunning)?;
        let handle = platform_handle_for(tid)?;
        registry
            .register_thread(tid as libc::pid_t, handle, interval)
            .map_err(LifecycleError::from)
    }

    /// `cpu.stats` (spec §6.1): `None` while idle, matching "stats
    /// snapshot or none".
    pub fn stats(&self) -> Option<CpuStats> {
        let registry = self.lifecycle.registry()?;
        let ring = self.lifecycle.ring()?;
        Some(CpuStats {
            samples_captured: self.lifecycle.samples_captured(),
            validation_drops: self.lifecycle.validation_drops(),
            total_overruns: registry.total_overruns(),
            create_failures: registry.create_failures(),
            registered_threads: registry.registered_threads(),
            active_threads: registry.active_threads(),
            resolver_cache_entries: self.lifecycle.resolver_cache_len().unwrap_or(0),
            ring_len: ring.len(),
            ring_dropped_full: ring.dropped_count(),
        })
    }
}

#[cfg(target_os = "linux")]
fn platform_handle_for(tid: u64) -> Result<profiler_cpu_sampler::ThreadHandle, LifecycleError> {
    Ok(tid as libc::pid_t)
}

#[cfg(not(target_os = "linux"))]
fn platform_handle_for(tid: u64) -> Result<profiler_cpu_sampler::ThreadHandle, LifecycleError> {
    let current = std::process::id() as u64;
    if tid != current {
        return Err(LifecycleError::RegisterThreadRequiresSelf);
    }
    Ok(unsafe { libc::pthread_self() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_defaults_to_2_16_slots_when_no_cap_given() {
        assert_eq!(ring_capacity_for(None), DEFAULT_RING_CAPACITY);
    }

    #[test]
    fn ring_capacity_rounds_down_to_a_power_of_two_and_has_a_floor() {
        assert_eq!(ring_capacity_for(Some(1)), 16);
        assert!(ring_capacity_for(Some(RAW_SAMPLE_BYTES * 100)).is_power_of_two());
        assert!(ring_capacity_for(Some(usize::MAX)) <= DEFAULT_RING_CAPACITY);
    }
}
