//! Windows has no stable equivalent of `LD_PRELOAD` symbol preemption
//! or macOS's `malloc_logger` hook short of IAT patching or a detours-
//! style trampoline, which spec §4.11 explicitly marks experimental and
//! out of scope for this pass. [`install`] fails fast rather than
//! silently running with no allocation sampling.

use crate::error::HeapError;

pub fn install() -> Result<(), HeapError> {
    Err(HeapError::Unsupported)
}

pub fn uninstall() {}

pub fn is_installed() -> bool {
    false
}
