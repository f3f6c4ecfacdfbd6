use thiserror::Error;

/// Resource-exhaustion kind from spec §7: "Resource exhaustion at timer
/// create" — `register_thread` reports this for a single thread without
/// aborting the session for the others.
#[derive(Debug, Error)]
pub enum RegisterThreadError {
    #[error("thread {0} is already registered")]
    AlreadyRegistered(libc::pid_t),
    #[error("timer_create failed for thread: {0}")]
    TimerCreateFailed(#[source] std::io::Error),
    #[error("timer_settime failed for thread: {0}")]
    TimerArmFailed(#[source] std::io::Error),
}

/// Errors surfaced by the signal-installation and resolver plumbing.
/// Never constructed on a producer path (spec §7 "Global discipline").
#[derive(Debug, Error)]
pub enum SamplerError {
    #[error("failed to install the profiling signal handler: {0}")]
    SignalInstallFailed(#[source] std::io::Error),
    #[error("failed to block the profiling signal: {0}")]
    SignalBlockFailed(#[source] std::io::Error),
    #[error("failed to unblock the profiling signal: {0}")]
    SignalUnblockFailed(#[source] std::io::Error),
}
