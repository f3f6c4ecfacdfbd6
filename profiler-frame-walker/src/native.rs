use crate::validate::{is_plausible_pointer, UserSpaceWindow};

/// Configuration for the native frame-pointer walk used by the heap
/// sampler's mixed-mode stack capture (spec §4.12 step 1). Architecture-
/// specific only in the constant offsets below; the walk itself is
/// architecture-agnostic frame-pointer chasing.
#[derive(Debug, Clone, Copy)]
pub struct NativeWalkerConfig {
    pub window: UserSpaceWindow,
    /// Bounded probe count: native frames are cheap to mis-walk on
    /// optimized builds lacking frame pointers, so this stays small.
    pub max_frames: usize,
}

impl Default for NativeWalkerConfig {
    fn default() -> Self {
        Self {
            window: UserSpaceWindow::default_64bit(),
            max_frames: 64,
        }
    }
}

/// Walks native (C/C++) frames via frame-pointer chains starting at
/// `initial_fp`, writing return addresses into `out`. Returns the number of
/// frames written. Like the managed-frame walker, this never allocates and
/// never panics: a validation failure simply stops the walk early with
/// whatever was already collected (native frames are best-effort — unlike
/// the managed walk, a partial result is still useful here since this
/// feeds into a "surrounds, doesn't replace" merge in spec §4.12).
///
/// # Safety
/// `initial_fp` must be a frame-pointer register value read from a
/// suspended or self thread context; `return_address_offset` and
/// `saved_fp_offset` are the architecture's frame-pointer ABI offsets
/// (e.g. 8 and 0 on x86-64 System V).
pub unsafe fn walk_native_frames(
    initial_fp: usize,
    return_address_offset: usize,
    saved_fp_offset: usize,
    config: NativeWalkerConfig,
    out: &mut [usize],
) -> usize {
    let cap = out.len().min(config.max_frames);
    let mut fp = initial_fp;
    let mut written = 0;

    while written < cap && is_plausible_pointer(fp, std::mem::size_of::<usize>(), config.window) {
        let return_address =
            *((fp + return_address_offset) as *const usize);
        if return_address == 0 {
            break;
        }
        out[written] = return_address;
        written += 1;

        let next_fp = *((fp + saved_fp_offset) as *const usize);
        if next_fp <= fp {
            // Frame pointers must strictly increase up the stack; a
            // non-increasing value means the chain is corrupt or we've
            // reached the top.
            break;
        }
        fp = next_fp;
    }

    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct NativeFrame {
        saved_fp: usize,
        return_address: usize,
    }

    #[test]
    fn walks_simple_chain() {
        // Allocate three frames on the heap, then sort them by address so
        // the chain walks in strictly-increasing-address order regardless
        // of allocator behavior (the walk rejects non-increasing frame
        // pointers as a corruption signal).
        let mut boxes = vec![
            Box::new(NativeFrame { saved_fp: 0, return_address: 0x2000 }),
            Box::new(NativeFrame { saved_fp: 0, return_address: 0x3000 }),
            Box::new(NativeFrame { saved_fp: 0, return_address: 0x4000 }),
        ];
        boxes.sort_by_key(|b| &**b as *const NativeFrame as usize);
        let addrs: Vec<usize> = boxes.iter().map(|b| &**b as *const NativeFrame as usize).collect();
        boxes[0].saved_fp = addrs[1];
        boxes[1].saved_fp = addrs[2];
        boxes[2].saved_fp = 0;
        let expected: Vec<usize> = boxes.iter().map(|b| b.return_address).collect();

        let initial_fp = addrs[0];
        let mut out = [0usize; 16];
        let written = unsafe {
            walk_native_frames(
                initial_fp,
                std::mem::offset_of!(NativeFrame, return_address),
                std::mem::offset_of!(NativeFrame, saved_fp),
                NativeWalkerConfig::default(),
                &mut out,
            )
        };
        assert_eq!(written, 3);
        assert_eq!(&out[..3], &expected[..]);
    }
}
