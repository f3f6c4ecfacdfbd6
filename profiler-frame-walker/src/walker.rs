use std::sync::atomic::{AtomicU64, Ordering};

use crate::layout::WalkerConfig;
use crate::validate::{is_plausible_pointer, CachedCodeType, UserSpaceWindow};
use crate::{CYCLE_WINDOW, HARD_TRAVERSAL_BOUND, MAX_DEPTH};

/// Supplies the current frame pointer for the thread being sampled. The
/// managed runtime is the real implementation of this trait; it is a trait
/// here so the walker itself never depends on (or calls into) the runtime.
pub trait ThreadState {
    /// Raw, untyped pointer to the innermost interpreter frame for this
    /// thread, or 0 if the thread has no frame chain right now.
    fn current_frame(&self) -> usize;

    /// Byte offset, within a frame object, of the type-identity field used
    /// for the type check in validation step 3. Constant for a given
    /// interpreter build; threaded through here rather than hardcoded so
    /// tests can exercise the walker against a synthetic frame layout.
    fn frame_type_field_offset(&self) -> usize;

    /// Resolves a code object's bytecode-buffer base address, for the
    /// legacy (byte-offset) instruction-pointer layout. Returns `None` if
    /// `code_ptr` doesn't look like a valid code object (caller then
    /// reports no instruction pointer for that frame rather than failing
    /// the whole sample — only the frame chain validity is safety-critical).
    fn bytecode_base(&self, code_ptr: usize) -> Option<usize>;
}

/// The version-dispatched, allocation-free, async-signal-safe frame
/// walker (spec §4.1).
pub struct FrameWalker {
    config: WalkerConfig,
    window: UserSpaceWindow,
    cached_frame_type: CachedCodeType,
}

impl FrameWalker {
    /// `cached_frame_type` must be snapshotted once, at `Profiler::start`,
    /// from the live interpreter (spec §4.1: "cached_code_type ... was
    /// snapshotted once at init").
    pub fn new(
        config: WalkerConfig,
        window: UserSpaceWindow,
        cached_frame_type: CachedCodeType,
    ) -> Self {
        Self {
            config,
            window,
            cached_frame_type,
        }
    }

    /// Walks the frame chain for `thread_state`'s current thread, writing
    /// `(code*, instr*)` pairs into `out_frames`/`out_instrs` in innermost-
    /// to-outermost order (top of stack first). Returns the number of
    /// frames written.
    ///
    /// Returns 0 if the thread has no current frame, or if validation fails
    /// anywhere along the chain — the whole sample is dropped rather than
    /// partially kept (spec §4.1 "Failure semantics"), and
    /// `validation_drops` is incremented exactly once in the latter case.
    ///
    /// Deeper stacks than `out_frames.len()` (capped at [`MAX_DEPTH`]) are
    /// truncated by simply stopping the walk once the output is full: the
    /// frames already collected are the innermost ones, which is exactly
    /// the "keep the top, drop the bottom" truncation policy of spec §4.3.
    pub fn capture(
        &self,
        thread_state: &dyn ThreadState,
        out_frames: &mut [usize],
        out_instrs: &mut [Option<usize>],
        validation_drops: &AtomicU64,
    ) -> u16 {
        let cap = out_frames.len().min(out_instrs.len()).min(MAX_DEPTH);
        let mut frame = thread_state.current_frame();
        if frame == 0 {
            return 0;
        }

        let mut recent: [usize; CYCLE_WINDOW] = [0; CYCLE_WINDOW];
        let mut recent_len = 0usize;
        let mut written = 0usize;
        let mut traversed = 0usize;

        while frame != 0 && traversed < HARD_TRAVERSAL_BOUND {
            traversed += 1;

            if !is_plausible_pointer(frame, 8, self.window) {
                validation_drops.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
            // Safety: `frame` just passed the plausibility check above.
            let type_tag = unsafe {
                (*((frame + thread_state.frame_type_field_offset()) as *const usize))
            };
            if type_tag != self.cached_frame_type.0 {
                validation_drops.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
            if recent[..recent_len].contains(&frame) {
                validation_drops.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
            if recent_len < CYCLE_WINDOW {
                recent[recent_len] = frame;
                recent_len += 1;
            } else {
                recent.copy_within(1.., 0);
                recent[CYCLE_WINDOW - 1] = frame;
            }

            // Safety: `frame` is validated above.
            let owner = unsafe { self.config.owner(frame) };
            if !owner.is_shim() && written < cap {
                // Safety: `frame` is validated above.
                let code_ptr = unsafe { self.config.code_ptr(frame) };
                let bytecode_base = thread_state.bytecode_base(code_ptr);
                // Safety: `frame` is validated above.
                let instr_ptr = unsafe { self.config.instr_ptr(frame, bytecode_base) };
                out_frames[written] = code_ptr;
                out_instrs[written] = instr_ptr;
                written += 1;
            }

            if written >= cap {
                break;
            }

            // Safety: `frame` is validated above.
            frame = unsafe { self.config.previous_frame(frame) };
        }

        written as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{FrameFieldOffsets, FrameLayoutV1, InterpreterVersion};
    use std::cell::Cell;

    #[repr(C)]
    struct SyntheticFrame {
        type_tag: usize,
        previous: usize,
        code_ptr: usize,
        instr_ptr: usize,
        owner_tag: usize,
    }

    const FRAME_TYPE_TAG: usize = 0xC0DE;

    struct Fixture {
        frames: Vec<Box<SyntheticFrame>>,
        current: Cell<usize>,
    }

    impl Fixture {
        fn chain(owners: &[usize]) -> Self {
            let mut frames: Vec<Box<SyntheticFrame>> = owners
                .iter()
                .map(|&owner_tag| {
                    Box::new(SyntheticFrame {
                        type_tag: FRAME_TYPE_TAG,
                        previous: 0,
                        code_ptr: 0x2000_0000,
                        instr_ptr: 0x10,
                        owner_tag,
                    })
                })
                .collect();
            for i in 0..frames.len() {
                let next_addr = frames
                    .get(i + 1)
                    .map(|b| &**b as *const SyntheticFrame as usize)
                    .unwrap_or(0);
                frames[i].previous = next_addr;
            }
            let current = frames
                .first()
                .map(|b| &**b as *const SyntheticFrame as usize)
                .unwrap_or(0);
            Self {
                frames,
                current: Cell::new(current),
            }
        }
    }

    impl ThreadState for Fixture {
        fn current_frame(&self) -> usize {
            self.current.get()
        }
        fn frame_type_field_offset(&self) -> usize {
            std::mem::offset_of!(SyntheticFrame, type_tag)
        }
        fn bytecode_base(&self, _code_ptr: usize) -> Option<usize> {
            Some(0x2000_0000)
        }
    }

    fn offsets() -> FrameFieldOffsets {
        FrameFieldOffsets {
            previous_frame: std::mem::offset_of!(SyntheticFrame, previous),
            code_ptr: std::mem::offset_of!(SyntheticFrame, code_ptr),
            instr_ptr: std::mem::offset_of!(SyntheticFrame, instr_ptr),
            owner_tag: std::mem::offset_of!(SyntheticFrame, owner_tag),
        }
    }

    fn walker() -> FrameWalker {
        let config = WalkerConfig::for_version(InterpreterVersion::V1Legacy, offsets());
        FrameWalker::new(
            config,
            UserSpaceWindow::default_64bit(),
            CachedCodeType(FRAME_TYPE_TAG),
        )
    }

    #[test]
    fn empty_chain_returns_zero() {
        let fixture = Fixture { frames: vec![], current: Cell::new(0) };
        let w = walker();
        let mut f = [0usize; 128];
        let mut i = [None; 128];
        let drops = AtomicU64::new(0);
        assert_eq!(w.capture(&fixture, &mut f, &mut i, &drops), 0);
    }

    #[test]
    fn walks_full_chain_and_skips_shims() {
        // owner tags: 0=FrameObject, 1=Generator, 2=CStackShim, 3=Thread
        let fixture = Fixture::chain(&[0, 2, 0, 1]);
        let w = walker();
        let mut f = [0usize; 128];
        let mut i = [None; 128];
        let drops = AtomicU64::new(0);
        let depth = w.capture(&fixture, &mut f, &mut i, &drops);
        assert_eq!(depth, 3); // one shim frame skipped
        assert_eq!(drops.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn truncates_to_cap_keeping_innermost() {
        let owners: Vec<usize> = std::iter::repeat(0).take(200).collect();
        let fixture = Fixture::chain(&owners);
        let w = walker();
        let mut f = [0usize; 128];
        let mut i = [None; 128];
        let drops = AtomicU64::new(0);
        let depth = w.capture(&fixture, &mut f, &mut i, &drops);
        assert_eq!(depth, 128);
    }

    #[test]
    fn cycle_is_detected_and_sample_dropped() {
        let fixture = Fixture::chain(&[0, 0, 0]);
        // Force a cycle: last frame points back to the first.
        let first_addr = &*fixture.frames[0] as *const SyntheticFrame as usize;
        unsafe {
            let last = &*fixture.frames[2] as *const SyntheticFrame as *mut SyntheticFrame;
            (*last).previous = first_addr;
        }
        let w = walker();
        let mut f = [0usize; 128];
        let mut i = [None; 128];
        let drops = AtomicU64::new(0);
        let depth = w.capture(&fixture, &mut f, &mut i, &drops);
        assert_eq!(depth, 0);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}
