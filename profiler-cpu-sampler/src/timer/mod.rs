//! Per-thread CPU-time timer creation and arming (spec §4.4).
//!
//! The registry above this module is platform-agnostic; only the
//! mechanism used to bind a timer to one specific thread and the type
//! used to name that thread differ per OS.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub use linux::{ThreadHandle, ThreadTimer, PROFILING_SIGNAL};
    } else {
        mod fallback;
        pub use fallback::{ThreadHandle, ThreadTimer, PROFILING_SIGNAL};
    }
}
