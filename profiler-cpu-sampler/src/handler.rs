//! The signal handler (spec §4.3): producer side of the CPU sampler.
//! ≤ ~10 µs per invocation, async-signal-safe only, never touches the
//! managed runtime's global lock or any mutex.
//!
//! State is reached through two globals rather than a parameter, since
//! `extern "C" fn(c_int)` has no room for one: [`ARMED`] gates every
//! invocation before anything else runs, and [`CONTEXT`] is a raw
//! pointer to the immutable [`HandlerContext`] the current session is
//! using. Both are written only by [`install`]/[`uninstall`], which run
//! with the profiling signal already accounted for by the surrounding
//! lifecycle state machine (spec §4.5) — never concurrently with a
//! handler invocation that has already observed `ARMED`.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use profiler_frame_walker::{FrameWalker, ThreadState};
use profiler_ring::{RawSample, Ring};

use crate::error::SamplerError;
use crate::timer::PROFILING_SIGNAL;

/// Supplies the current thread's managed-interpreter frame state to the
/// walker. Implemented by the host runtime integration; never by this
/// crate. Must be safe to call from a signal handler: no allocation, no
/// locking, no calls back into the managed runtime's public API.
pub trait ThreadStateProvider: Send + Sync {
    fn current_thread_state(&self) -> Option<&dyn ThreadState>;
}

struct HandlerContext {
    ring: Arc<Ring>,
    walker: FrameWalker,
    provider: Arc<dyn ThreadStateProvider>,
    validation_drops: Arc<AtomicU64>,
    samples_captured: Arc<AtomicU64>,
}

static ARMED: AtomicBool = AtomicBool::new(false);
static CONTEXT: AtomicPtr<HandlerContext> = AtomicPtr::new(std::ptr::null_mut());
static PREV_ACTION: AtomicPtr<libc::sigaction> = AtomicPtr::new(std::ptr::null_mut());

/// Scratch slot the prefork/postfork-parent pair use to hand `ARMED`'s
/// pre-fork value across the fork() call (spec §5 "Fork safety": "a
/// prefork handler quiesces producers ... postfork-parent restores").
static PREFORK_ARMED: AtomicBool = AtomicBool::new(false);
static FORK_HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Registers the `pthread_atfork` triple that implements spec §5's fork
/// safety for the CPU sampler. Idempotent — safe to call from every
/// [`install`], since only the first call actually registers anything.
///
/// `ARMED` is the one piece of process-wide state the signal handler
/// reads before touching anything else, so quiescing it around `fork()`
/// is sufficient: the child process never inherits the per-thread
/// CPU-time timers that would otherwise deliver the profiling signal
/// (`timer_create(2)`: timers are not inherited across `fork`), so
/// leaving `ARMED` false in the child (rather than restoring it, as the
/// parent-side handler does) just makes that already-true fact explicit
/// instead of relying on it implicitly.
pub fn install_fork_hook() {
    if FORK_HOOK_INSTALLED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    unsafe {
        libc::pthread_atfork(Some(prefork), Some(postfork_parent), Some(postfork_child));
    }
}

extern "C" fn prefork() {
    PREFORK_ARMED.store(ARMED.load(Ordering::Acquire), Ordering::Release);
    ARMED.store(false, Ordering::Release);
}

extern "C" fn postfork_parent() {
    ARMED.store(PREFORK_ARMED.load(Ordering::Acquire), Ordering::Release);
}

/// Spec §5: "postfork-child disables all sampling". Deliberately does
/// *not* restore `ARMED` — the child keeps the interposer/handler
/// installed but inert until the host explicitly starts a new session.
extern "C" fn postfork_child() {}

/// Installs the handler and arms it (spec §4.5 start sequence, the
/// "install signal handler, saving any prior handler" step). Must be
/// called before any timer in the registry is armed.
pub fn install(
    ring: Arc<Ring>,
    walker: FrameWalker,
    provider: Arc<dyn ThreadStateProvider>,
    validation_drops: Arc<AtomicU64>,
    samples_captured: Arc<AtomicU64>,
) -> Result<(), SamplerError> {
    install_fork_hook();

    let ctx = Box::into_raw(Box::new(HandlerContext {
        ring,
        walker,
        provider,
        validation_drops,
        samples_captured,
    }));
    CONTEXT.store(ctx, Ordering::Release);

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_signal as usize;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }

    let mut prev: libc::sigaction = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sigaction(PROFILING_SIGNAL, &action, &mut prev) };
    if rc != 0 {
        // Roll back: drop the context we just published.
        let ctx = CONTEXT.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ctx.is_null() {
            drop(unsafe { Box::from_raw(ctx) });
        }
        return Err(SamplerError::SignalInstallFailed(
            std::io::Error::last_os_error(),
        ));
    }
    PREV_ACTION.store(Box::into_raw(Box::new(prev)), Ordering::Release);

    // Final step of spec §4.5's start sequence: "transition to RUNNING".
    ARMED.store(true, Ordering::Release);
    Ok(())
}

/// Spec §4.5 stop sequence steps 1 and 5: flip `ARMED` off (so any
/// handler invocation from here on returns immediately at step 1 of its
/// own algorithm) and restore whatever action preceded `install`.
///
/// Caller is responsible for the surrounding block/disarm/drain/unblock
/// choreography (spec §4.5 steps 2–4, 6) — this function only handles
/// the state flip and the sigaction restore/teardown of the context.
pub fn disarm_and_restore() -> Result<(), SamplerError> {
    ARMED.store(false, Ordering::Release);

    let prev_ptr = PREV_ACTION.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if !prev_ptr.is_null() {
        let prev = unsafe { Box::from_raw(prev_ptr) };
        let rc = unsafe { libc::sigaction(PROFILING_SIGNAL, &prev, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(SamplerError::SignalInstallFailed(
                std::io::Error::last_os_error(),
            ));
        }
    }

    let ctx_ptr = CONTEXT.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if !ctx_ptr.is_null() {
        // Safe: by the time the caller reaches here, the block+drain
        // choreography (spec §4.5 steps 2–4) guarantees no invocation of
        // `handle_signal` is in flight and the per-thread timers that
        // could have generated the signal no longer exist.
        drop(unsafe { Box::from_raw(ctx_ptr) });
    }
    Ok(())
}

/// The extern-C handler itself (spec §4.3 algorithm, steps 1–5; chaining
/// is step 6 and happens last so the profiler's own sample is captured
/// even if the prior handler is unwell-behaved).
extern "C" fn handle_signal(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    // Step 1: bail immediately if not RUNNING.
    if !ARMED.load(Ordering::Acquire) {
        return chain(signum, info, ucontext);
    }

    let ctx_ptr = CONTEXT.load(Ordering::Acquire);
    if ctx_ptr.is_null() {
        return chain(signum, info, ucontext);
    }
    // Safety: `ctx_ptr` was published by `install` before `ARMED` was
    // set, and is only freed by `disarm_and_restore` after `ARMED` has
    // been observed false and the teardown drain has run — i.e. never
    // concurrently with an invocation that got this far.
    let ctx = unsafe { &*ctx_ptr };

    // Step 2: monotonic timestamp.
    let timestamp_ns = monotonic_now_ns();

    // Step 3: thread-state block for the current thread.
    let Some(thread_state) = ctx.provider.current_thread_state() else {
        return chain(signum, info, ucontext);
    };

    // Step 4: walk frames into a stack-resident raw sample.
    let mut sample = RawSample {
        timestamp_ns,
        tid: current_tid(),
        ..RawSample::default()
    };
    let mut code_ptrs = [0usize; profiler_ring::MAX_SAMPLE_DEPTH];
    let mut instr_ptrs = [None; profiler_ring::MAX_SAMPLE_DEPTH];
    let depth = ctx.walker.capture(
        thread_state,
        &mut code_ptrs,
        &mut instr_ptrs,
        &ctx.validation_drops,
    );
    if depth > 0 {
        sample.depth = depth;
        for i in 0..depth as usize {
            sample.set_frame(i, code_ptrs[i], instr_ptrs[i]);
        }
        // Step 5: push to ring (or drop + counter, handled inside `push`).
        ctx.ring.push(sample);
        ctx.samples_captured.fetch_add(1, Ordering::Relaxed);
    }

    // Step 6: chain to whatever handler preceded ours.
    chain(signum, info, ucontext);
}

fn chain(signum: libc::c_int, info: *mut libc::siginfo_t, ucontext: *mut libc::c_void) {
    let prev_ptr = PREV_ACTION.load(Ordering::Acquire);
    if prev_ptr.is_null() {
        return;
    }
    // Safety: `prev_ptr` is only freed by `disarm_and_restore`, which (per
    // the same reasoning as `handle_signal`'s `ctx_ptr` use) cannot race a
    // handler invocation that is still running.
    let prev = unsafe { &*prev_ptr };
    let is_default_or_ignored = prev.sa_sigaction == libc::SIG_DFL
        || prev.sa_sigaction == libc::SIG_IGN;
    if is_default_or_ignored {
        return;
    }
    if prev.sa_flags & libc::SA_SIGINFO != 0 {
        let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            unsafe { std::mem::transmute(prev.sa_sigaction) };
        f(signum, info, ucontext);
    } else {
        let f: extern "C" fn(libc::c_int) = unsafe { std::mem::transmute(prev.sa_sigaction) };
        f(signum);
    }
}

fn monotonic_now_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(target_os = "linux")]
fn current_tid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    struct AlwaysNoneProvider;
    impl ThreadStateProvider for AlwaysNoneProvider {
        fn current_thread_state(&self) -> Option<&dyn ThreadState> {
            None
        }
    }

    #[test]
    fn fork_hook_installation_is_idempotent() {
        install_fork_hook();
        install_fork_hook();
        install_fork_hook();
    }

    #[test]
    fn install_disarm_round_trip_leaves_no_context() {
        let ring = Arc::new(Ring::new(16));
        let walker = FrameWalker::new(
            profiler_frame_walker::WalkerConfig::for_version(
                profiler_frame_walker::InterpreterVersion::V1Legacy,
                Default::default(),
            ),
            profiler_frame_walker::UserSpaceWindow::default_64bit(),
            profiler_frame_walker::CachedCodeType(0),
        );
        install(
            ring,
            walker,
            Arc::new(AlwaysNoneProvider),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
        )
        .expect("install should succeed");
        assert!(ARMED.load(Ordering::Acquire));

        disarm_and_restore().expect("disarm should succeed");
        assert!(!ARMED.load(Ordering::Acquire));
        assert!(CONTEXT.load(Ordering::Acquire).is_null());
        assert!(PREV_ACTION.load(Ordering::Acquire).is_null());

        // Repeated cycles must not leak contexts (spec §8 property 4).
        let ring = Arc::new(Ring::new(16));
        let walker = FrameWalker::new(
            profiler_frame_walker::WalkerConfig::for_version(
                profiler_frame_walker::InterpreterVersion::V1Legacy,
                Default::default(),
            ),
            profiler_frame_walker::UserSpaceWindow::default_64bit(),
            profiler_frame_walker::CachedCodeType(0),
        );
        install(
            ring,
            walker,
            Arc::new(AlwaysNoneProvider),
            Arc::new(AtomicU64::new(0)),
            Arc::new(AtomicU64::new(0)),
        )
        .expect("second install should succeed");
        disarm_and_restore().expect("second disarm should succeed");
        let _ = Duration::from_millis(0);
    }
}
