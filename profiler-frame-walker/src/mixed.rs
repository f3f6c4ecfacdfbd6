/// One frame of a merged native+managed stack (spec §4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MixedFrame {
    Native(usize),
    Managed(crate::RawFrame),
}

impl Default for MixedFrame {
    fn default() -> Self {
        MixedFrame::Native(0)
    }
}

/// Merges a native frame-pointer walk with a managed [`crate::FrameWalker`]
/// walk into one "trim & sandwich" stack (spec §4.12 step 3): the native
/// list surrounds the managed one, with `native_leading_skip` profiler-
/// internal frames dropped from the front of `native_frames` and
/// `native_trailing_skip` interpreter-internal frames (the call glue
/// between the host call and the allocator call) dropped from the back.
///
/// Both `native_frames` and `managed_frames` are expected in innermost-
/// first order (as produced by [`crate::walk_native_frames`] and
/// [`crate::FrameWalker::capture`] respectively). Writes the merged,
/// innermost-first result into `out` and returns the number of frames
/// written. Takes no heap allocation (spec §4.12 "Hard safety: no
/// allocation") — `out` is caller-owned, typically a stack-resident array
/// sized for the heap sampler's mixed-stack cap.
pub fn merge_mixed_stack(
    native_frames: &[usize],
    native_leading_skip: usize,
    native_trailing_skip: usize,
    managed_frames: &[crate::RawFrame],
    out: &mut [MixedFrame],
) -> usize {
    let trimmed_end = native_frames.len().saturating_sub(native_trailing_skip);
    let trimmed_start = native_leading_skip.min(trimmed_end);
    let native_trimmed = &native_frames[trimmed_start..trimmed_end];

    let mut written = 0;
    for &pc in native_trimmed {
        if written >= out.len() {
            return written;
        }
        out[written] = MixedFrame::Native(pc);
        written += 1;
    }
    for &frame in managed_frames {
        if written >= out.len() {
            return written;
        }
        out[written] = MixedFrame::Managed(frame);
        written += 1;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RawFrame;

    #[test]
    fn trims_leading_and_trailing_native_frames() {
        let native = [1, 2, 3, 4, 5];
        let managed = [RawFrame { code_ptr: 0x10, instr_ptr: None }];
        let mut out = [MixedFrame::default(); 8];
        let n = merge_mixed_stack(&native, 1, 2, &managed, &mut out);
        assert_eq!(
            &out[..n],
            &[
                MixedFrame::Native(2),
                MixedFrame::Native(3),
                MixedFrame::Managed(managed[0]),
            ]
        );
    }

    #[test]
    fn handles_over_trim_gracefully() {
        let native = [1, 2];
        let managed: [RawFrame; 0] = [];
        let mut out = [MixedFrame::default(); 8];
        let n = merge_mixed_stack(&native, 5, 5, &managed, &mut out);
        assert_eq!(n, 0);
    }

    #[test]
    fn truncates_to_output_capacity() {
        let native = [1, 2, 3, 4];
        let managed = [RawFrame { code_ptr: 0x10, instr_ptr: None }];
        let mut out = [MixedFrame::default(); 2];
        let n = merge_mixed_stack(&native, 0, 0, &managed, &mut out);
        assert_eq!(n, 2);
        assert_eq!(&out[..n], &[MixedFrame::Native(1), MixedFrame::Native(2)]);
    }
}
