//! The CPU sampler's IDLE → RUNNING → STOPPING → IDLE state machine
//! (spec §4.5). [`crate::cpu::CpuSampler`] is the public face of this;
//! this module holds the actual start/stop choreography since it's
//! intricate enough (signal block/disarm/drain ordering) to want its
//! own file, the same way `profiler-cpu-sampler`'s `handler` module is
//! split out from its `lib.rs`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use profiler_cpu_sampler::{
    disarm_and_restore_handler, install_handler, CodeResolver, Registry, Resolver, RuntimeLock,
    ThreadNameResolver, ThreadStateProvider, PROFILING_SIGNAL,
};
use profiler_frame_walker::{CachedCodeType, FrameWalker, UserSpaceWindow, WalkerConfig};
use profiler_ring::Ring;

use crate::error::LifecycleError;
use crate::profile::{Profile, SerializableSample};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Stopping,
}

/// Collaborators the host runtime must supply (spec §5's "host runtime
/// integration contract"). Bundled into one struct so `CpuSampler::new`
/// doesn't need a five-argument constructor.
pub struct HostCollaborators {
    pub thread_state_provider: Arc<dyn ThreadStateProvider>,
    pub runtime_lock: Arc<dyn RuntimeLock>,
    pub code_resolver: Arc<dyn CodeResolver>,
    pub thread_names: Option<Arc<dyn ThreadNameResolver>>,
    pub cached_frame_type: CachedCodeType,
    pub walker_config: WalkerConfig,
    pub window: UserSpaceWindow,
}

pub(crate) struct Session {
    pub registry: Arc<Registry>,
    pub ring: Arc<Ring>,
    resolver: Arc<Resolver>,
    started_at_ns: u64,
    interval: Duration,
}

pub(crate) struct Lifecycle {
    state: Mutex<State>,
    session: Mutex<Option<Session>>,
    validation_drops: Arc<AtomicU64>,
    samples_captured: Arc<AtomicU64>,
    collaborators: HostCollaborators,
    default_ring_capacity: usize,
}

impl Lifecycle {
    pub fn new(collaborators: HostCollaborators, default_ring_capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::Idle),
            session: Mutex::new(None),
            validation_drops: Arc::new(AtomicU64::new(0)),
            samples_captured: Arc::new(AtomicU64::new(0)),
            collaborators,
            default_ring_capacity,
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    pub fn registry(&self) -> Option<Arc<Registry>> {
        self.session.lock().as_ref().map(|s| Arc::clone(&s.registry))
    }

    pub fn ring(&self) -> Option<Arc<Ring>> {
        self.session.lock().as_ref().map(|s| Arc::clone(&s.ring))
    }

    pub fn validation_drops(&self) -> u64 {
        self.validation_drops.load(Ordering::Relaxed)
    }

    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    /// The interval the currently running session was started with, if
    /// any. Used by [`crate::cpu::CpuSampler::register_thread`], which
    /// needs to arm a new per-thread timer at the same interval every
    /// other registered thread is already sampling at.
    pub fn current_interval(&self) -> Option<Duration> {
        self.session.lock().as_ref().map(|s| s.interval)
    }

    /// Number of distinct `code*` pointers the resolver's symbol cache
    /// currently holds (spec §4.13 has no dedicated counter for this but
    /// it is useful diagnostic surface alongside the rest of
    /// [`crate::stats::CpuStats`]); `None` while idle.
    pub fn resolver_cache_len(&self) -> Option<usize> {
        self.session.lock().as_ref().map(|s| s.resolver.cache_len())
    }

    /// Spec §4.5 start sequence: allocate the ring, install the signal
    /// handler, spawn the resolver, transition to RUNNING. Per-thread
    /// timer registration is a separate step the host drives explicitly
    /// (`CpuSampler::register_thread`), since which threads to sample is
    /// host policy, not something this crate can infer.
    ///
    /// `ring_capacity` is `None` to fall back to the capacity this
    /// `Lifecycle` was constructed with (spec §4.2's default), or
    /// `Some` to honor a host-requested memory cap for this session
    /// (`CpuStartConfig::memory_cap_bytes`, translated by the caller).
    pub fn start(&self, interval: Duration, ring_capacity: Option<usize>) -> Result<(), LifecycleError> {
        let mut state = self.state.lock();
        if *state != State::Idle {
            return Err(LifecycleError::CpuAlreadyRunning);
        }

        self.validation_drops.store(0, Ordering::Relaxed);
        self.samples_captured.store(0, Ordering::Relaxed);

        let ring = Arc::new(Ring::new(ring_capacity.unwrap_or(self.default_ring_capacity)));
        let registry = Arc::new(Registry::new());

        let walker = FrameWalker::new(
            self.collaborators.walker_config,
            self.collaborators.window,
            self.collaborators.cached_frame_type,
        );
        install_handler(
            Arc::clone(&ring),
            walker,
            Arc::clone(&self.collaborators.thread_state_provider),
            Arc::clone(&self.validation_drops),
            Arc::clone(&self.samples_captured),
        )?;

        let resolver = Resolver::spawn(
            Arc::clone(&ring),
            Arc::clone(&registry),
            Arc::clone(&self.collaborators.runtime_lock),
            Arc::clone(&self.collaborators.code_resolver),
            self.collaborators.thread_names.clone(),
        );

        *self.session.lock() = Some(Session {
            registry,
            ring,
            resolver,
            started_at_ns: monotonic_now_ns(),
            interval,
        });

        *state = State::Running;
        log::debug!("cpu sampler started, interval={interval:?}");
        Ok(())
    }

    /// Spec §4.5 stop sequence: block the profiling signal on the
    /// calling thread, disarm and delete every per-thread timer, drain
    /// any signal that was already pending for the calling thread via a
    /// bounded `sigtimedwait` loop, restore the previous handler, unblock,
    /// join the resolver, drain whatever is left in the ring, and emit
    /// the finished [`Profile`].
    pub fn stop(&self) -> Result<Profile, LifecycleError> {
        {
            let mut state = self.state.lock();
            if *state != State::Running {
                return Err(LifecycleError::CpuNotRunning);
            }
            *state = State::Stopping;
        }

        let session = self.session.lock().take().expect("Running state implies a session exists");

        block_profiling_signal()?;
        session.registry.cleanup_all();
        drain_pending_signal();
        disarm_and_restore_handler()?;
        unblock_profiling_signal()?;

        session.resolver.stop_and_join();
        session.resolver.drain_remaining();
        let resolved = session.resolver.take_resolved();

        let profile = Profile {
            started_at_ns: session.started_at_ns,
            stopped_at_ns: monotonic_now_ns(),
            sample_interval_ns: session.interval.as_nanos() as u64,
            samples: resolved.iter().map(SerializableSample::from).collect(),
            total_overruns: session.registry.total_overruns(),
            validation_drops: self.validation_drops.load(Ordering::Relaxed),
            output_path: None,
        };

        *self.state.lock() = State::Idle;
        log::debug!(
            "cpu sampler stopped, samples={} overruns={} validation_drops={}",
            profile.samples.len(),
            profile.total_overruns,
            profile.validation_drops,
        );
        Ok(profile)
    }

    pub fn pause(&self, interval: Duration) -> Result<(), LifecycleError> {
        let _ = interval;
        let session = self.session.lock();
        match session.as_ref() {
            Some(s) => {
                s.registry.pause_all();
                Ok(())
            }
            None => Err(LifecycleError::CpuNotRunning),
        }
    }

    pub fn resume(&self, interval: Duration) -> Result<(), LifecycleError> {
        let session = self.session.lock();
        match session.as_ref() {
            Some(s) => {
                s.registry.resume_all(interval);
                Ok(())
            }
            None => Err(LifecycleError::CpuNotRunning),
        }
    }
}

#[cfg(unix)]
fn block_profiling_signal() -> Result<(), LifecycleError> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PROFILING_SIGNAL);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
            return Err(LifecycleError::SignalBlockFailed(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn unblock_profiling_signal() -> Result<(), LifecycleError> {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PROFILING_SIGNAL);
        if libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut()) != 0 {
            return Err(LifecycleError::SignalUnblockFailed(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Drains any instance of the profiling signal already pending for the
/// calling thread (spec §4.5 step 4: "sigtimedwait in a loop until
/// EAGAIN"). Uses a zero timeout so this never sleeps — a pending signal
/// is consumed on the first iteration, and the loop exits as soon as
/// `EAGAIN` shows there's nothing left.
#[cfg(target_os = "linux")]
fn drain_pending_signal() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PROFILING_SIGNAL);
        let timeout = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        loop {
            let rc = libc::sigtimedwait(&set, std::ptr::null_mut(), &timeout);
            if rc < 0 {
                break;
            }
        }
    }
}

/// macOS doesn't implement `sigtimedwait` (Darwin only has the
/// non-timed, always-blocking `sigwait`), so the zero-timeout drain loop
/// spec §4.5 step 4 describes is emulated instead: `sigpending` tells us
/// whether the profiling signal is actually pending for this thread
/// *without blocking*, and only when it is do we call the blocking
/// `sigwait` — which then returns immediately because the signal is
/// already there waiting to be consumed. Looping stops as soon as
/// `sigpending` reports nothing left, so this never sleeps, matching
/// spec §4.5's "sleeps are forbidden in the teardown path".
#[cfg(target_os = "macos")]
fn drain_pending_signal() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, PROFILING_SIGNAL);
        loop {
            let mut pending: libc::sigset_t = std::mem::zeroed();
            if libc::sigpending(&mut pending) != 0 {
                break;
            }
            if libc::sigismember(&pending, PROFILING_SIGNAL) != 1 {
                break;
            }
            let mut consumed: libc::c_int = 0;
            libc::sigwait(&set, &mut consumed);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn drain_pending_signal() {
    // `sigtimedwait`/`sigpending` pairing covers Linux and macOS, the two
    // platforms spec §4.5 names explicitly; other Unixes fall back to a
    // no-op here, matching `profiler-cpu-sampler`'s own Linux/fallback
    // split for the timer mechanism this is pairing with.
}

#[cfg(not(unix))]
fn block_profiling_signal() -> Result<(), LifecycleError> {
    Ok(())
}

#[cfg(not(unix))]
fn unblock_profiling_signal() -> Result<(), LifecycleError> {
    Ok(())
}

fn monotonic_now_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
