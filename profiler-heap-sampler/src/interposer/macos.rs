//! macOS interposition via the `malloc_logger` hook (spec §4.11,
//! "platform-specific interception"). `libmalloc` calls through this
//! weak global function pointer, when set, after every allocation and
//! deallocation routed through any registered malloc zone — the same
//! mechanism `MallocStackLogging`/`leaks`/Instruments use, so it sees
//! `malloc`, `calloc`, `realloc`, `free`, and the `*_zone_*` variants
//! uniformly without needing a hook per entry point the way Linux's
//! symbol preemption does.
//!
//! Event types are the `stack_logging_type_*` flags from
//! `<malloc/malloc.h>`; we only care about alloc (`2`) and free (`4`).

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::error::HeapError;

const STACK_LOGGING_TYPE_ALLOC: u32 = 2;
const STACK_LOGGING_TYPE_DEALLOC: u32 = 4;
const STACK_LOGGING_TYPE_GENERAL: u32 = STACK_LOGGING_TYPE_ALLOC | STACK_LOGGING_TYPE_DEALLOC;

type MallocLoggerFn = extern "C" fn(
    log_type: u32,
    arg1: usize,
    arg2: usize,
    arg3: usize,
    result: usize,
    num_hot_frames_to_skip: u32,
);

extern "C" {
    /// Weak global in libSystem's malloc implementation; non-null means
    /// "call this after every allocation event". We save/restore
    /// whatever was installed before us (e.g. `MallocStackLogging`) the
    /// same way the CPU sampler's signal handler chains to a prior
    /// `sigaction` (spec's general "never silently clobber a
    /// pre-existing hook" expectation, §4.3/§4.11).
    static mut malloc_logger: Option<MallocLoggerFn>;
}

static PREVIOUS_LOGGER: std::sync::Mutex<Option<MallocLoggerFn>> = std::sync::Mutex::new(None);
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Count of hook invocations currently executing. Used by
/// [`drain_in_flight`] so a session stop can wait for any already-
/// started hook call to finish publishing to the heap map before the
/// map itself might be torn down — this crate's analogue of the CPU
/// sampler's signal-block-then-drain stop sequence, since there is no
/// way to "block" a function pointer call the way `sigprocmask` blocks
/// a signal.
static IN_FLIGHT: AtomicI64 = AtomicI64::new(0);

pub fn install() -> Result<(), HeapError> {
    let mut previous = PREVIOUS_LOGGER.lock().unwrap();
    unsafe {
        *previous = malloc_logger;
        malloc_logger = Some(hook);
    }
    INSTALLED.store(true, Ordering::Release);
    Ok(())
}

pub fn uninstall() {
    INSTALLED.store(false, Ordering::Release);
    drain_in_flight();
    let mut previous = PREVIOUS_LOGGER.lock().unwrap();
    unsafe {
        malloc_logger = previous.take();
    }
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// Bounded spin until no hook invocation is mid-flight. Bounded rather
/// than unconditional so a hook call that's itself stuck (e.g. blocked
/// allocating inside a signal it can't escape) can't hang teardown
/// forever; see the Open Question note in `DESIGN.md`.
fn drain_in_flight() {
    for _ in 0..100_000 {
        if IN_FLIGHT.load(Ordering::Acquire) == 0 {
            return;
        }
        std::hint::spin_loop();
    }
}

extern "C" fn hook(
    log_type: u32,
    arg1: usize,
    _arg2: usize,
    _arg3: usize,
    result: usize,
    _num_hot_frames_to_skip: u32,
) {
    IN_FLIGHT.fetch_add(1, Ordering::AcqRel);

    if INSTALLED.load(Ordering::Acquire) {
        if log_type & STACK_LOGGING_TYPE_ALLOC == STACK_LOGGING_TYPE_ALLOC && result != 0 {
            crate::record_allocation(result as u64, arg1);
        } else if log_type & STACK_LOGGING_TYPE_DEALLOC == STACK_LOGGING_TYPE_DEALLOC && arg1 != 0
        {
            crate::record_free(arg1 as u64);
        }
    }

    let previous = *PREVIOUS_LOGGER.lock().unwrap();
    if let Some(prev) = previous {
        prev(log_type, arg1, _arg2, _arg3, result, _num_hot_frames_to_skip);
    }
    let _ = STACK_LOGGING_TYPE_GENERAL;

    // Held until the chained call above has returned, so `drain_in_flight`
    // cannot observe quiescence while a previous logger (e.g.
    // MallocStackLogging) is still mid-call.
    IN_FLIGHT.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_in_flight_returns_immediately_when_idle() {
        IN_FLIGHT.store(0, Ordering::SeqCst);
        drain_in_flight();
    }
}
