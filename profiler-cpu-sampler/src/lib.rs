//! Signal-driven periodic stack sampling: the Thread Registry (§4.4),
//! the async-signal-safe Signal Handler (§4.3), and the out-of-band
//! Resolver (§4.6). `profiler-core` drives this crate's start/stop
//! sequencing as part of its lifecycle state machine (§4.5); this crate
//! itself only guarantees that each piece, in isolation, upholds its own
//! invariants.

mod error;
mod handler;
mod registry;
mod resolver;
mod timer;

pub use error::{RegisterThreadError, SamplerError};
pub use handler::{install_fork_hook, ThreadStateProvider};
pub use registry::Registry;
pub use resolver::{CodeResolver, ResolvedFrame, ResolvedSample, Resolver, RuntimeLock, ThreadNameResolver};
pub use timer::{ThreadHandle, PROFILING_SIGNAL};

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use profiler_frame_walker::FrameWalker;
use profiler_ring::Ring;

/// Installs the profiling signal handler and arms it against `ring`
/// (spec §4.5 start sequence: "install signal handler, saving any prior
/// handler"). Must run after the ring and registry exist and before any
/// per-thread timer is armed.
pub fn install_handler(
    ring: Arc<Ring>,
    walker: FrameWalker,
    provider: Arc<dyn ThreadStateProvider>,
    validation_drops: Arc<AtomicU64>,
    samples_captured: Arc<AtomicU64>,
) -> Result<(), SamplerError> {
    handler::install(ring, walker, provider, validation_drops, samples_captured)
}

/// Spec §4.5 stop sequence steps 1 and 5 (state flip + sigaction
/// restore). The caller still owns steps 2–4 and 6 (signal
/// block/disarm/drain/unblock) — see [`crate::registry::Registry`] for
/// the disarm half and the host's lifecycle module for the
/// block/drain/unblock half, which needs direct `sigprocmask`/
/// `sigtimedwait` access that this crate deliberately doesn't wrap
/// (spec §4.5 is explicit that sleeps are forbidden and the block+drain
/// must happen around timer teardown, not inside a single opaque call).
pub fn disarm_and_restore_handler() -> Result<(), SamplerError> {
    handler::disarm_and_restore()
}
