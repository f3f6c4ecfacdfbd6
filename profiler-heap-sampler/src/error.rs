use thiserror::Error;

/// Spec §7 "Interposer bootstrap failure": fail-fast, refuse to start.
#[derive(Debug, Error)]
pub enum HeapError {
    #[error("heap sampler is already initialized")]
    AlreadyInitialized,
    #[error("heap sampler has not been initialized")]
    NotInitialized,
    #[error("heap sampler is already running")]
    AlreadyRunning,
    #[error("heap sampler is not running")]
    NotRunning,
    #[error("failed to allocate the heap map / stack table backing storage")]
    OutOfMemory,
    #[error("failed to resolve real allocator symbols: {0}")]
    InterposerBootstrapFailed(String),
    #[error("heap sampling is not supported on this platform")]
    Unsupported,
}
