//! Allocator interposition (spec §4.11): the entry points that see
//! every `malloc`/`free` call in the process and decide, via
//! [`crate::poisson`], whether to record one in the
//! [`crate::heap_map::HeapMap`].
//!
//! The mechanism is necessarily platform-specific — `LD_PRELOAD`-style
//! symbol interposition on Linux, a malloc-zone logging hook on macOS,
//! nothing (yet) on Windows — so each platform gets its own module, and
//! this one just picks between them (mirroring the split already used
//! for [`crate::poisson`]'s sibling timer module in `profiler-cpu-sampler`).

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::{install, is_installed, uninstall};
    } else if #[cfg(target_os = "macos")] {
        mod macos;
        pub use macos::{install, is_installed, uninstall};
    } else {
        mod windows;
        pub use windows::{install, is_installed, uninstall};
    }
}
