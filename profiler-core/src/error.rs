use thiserror::Error;

/// Lifecycle violations (spec §4.5): the state machine's own guard
/// rails, distinct from the lower-level `SamplerError`/`HeapError` the
/// CPU and heap cores can also surface.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("CPU sampler is already running")]
    CpuAlreadyRunning,
    #[error("CPU sampler is not running")]
    CpuNotRunning,
    #[error("sampling interval must be at least 1ms")]
    InvalidInterval,
    #[error("this platform can only register the calling thread, not an arbitrary TID")]
    RegisterThreadRequiresSelf,
    #[error("heap sampler is already running")]
    HeapAlreadyRunning,
    #[error("heap sampler is not running")]
    HeapNotRunning,
    #[error("failed to block the profiling signal: {0}")]
    SignalBlockFailed(#[source] std::io::Error),
    #[error("failed to unblock the profiling signal: {0}")]
    SignalUnblockFailed(#[source] std::io::Error),
    #[error(transparent)]
    Sampler(#[from] profiler_cpu_sampler::SamplerError),
    #[error(transparent)]
    RegisterThread(#[from] profiler_cpu_sampler::RegisterThreadError),
    #[error(transparent)]
    Heap(#[from] profiler_heap_sampler::HeapError),
}
