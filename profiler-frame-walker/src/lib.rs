//! Allocation-free, version-dispatched walker over a managed interpreter's
//! frame chain (see spec §4.1), plus the native frame-pointer walk used by
//! the heap sampler's mixed-mode stack capture (§4.12).
//!
//! Every function in this crate that runs on a producer path (signal
//! handler, heap-sampler cold path) must remain async-signal-safe: no
//! allocation, no locks, no calls back into the managed runtime.

mod layout;
mod mixed;
mod native;
mod validate;
mod walker;

pub use layout::{FrameLayout, FrameOwner, InterpreterVersion, WalkerConfig};
pub use mixed::{merge_mixed_stack, MixedFrame};
pub use native::{walk_native_frames, NativeWalkerConfig};
pub use validate::{CachedCodeType, UserSpaceWindow};
pub use walker::{FrameWalker, ThreadState};

/// Hard upper bound on frames returned by a single [`FrameWalker::capture`]
/// call. Stacks deeper than this are truncated from the bottom, keeping the
/// most recent (top) frames — spec §4.3 step 4.
pub const MAX_DEPTH: usize = 128;

/// Safety bound on frames *traversed* while walking, independent of
/// `MAX_DEPTH`: prevents an infinite loop on a corrupted frame chain even
/// when most of the traversed frames are shim frames that don't make it
/// into the output. Spec §4.1.
pub const HARD_TRAVERSAL_BOUND: usize = 512;

/// Size of the rolling window of recently visited frame pointers used for
/// cycle detection (spec §4.1, validation step 4).
pub const CYCLE_WINDOW: usize = 8;

/// A single raw `(code*, instruction*)` pair, as produced by [`FrameWalker`].
/// `instr_ptr` is `None` for interpreter versions that only expose a byte
/// offset into the code object (older layouts) when that offset could not
/// be resolved to a pointer without touching managed memory beyond the code
/// object's own bytecode buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub code_ptr: usize,
    pub instr_ptr: Option<usize>,
}
