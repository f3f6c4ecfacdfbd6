//! Thread Registry (spec §3.1 `ThreadTimerEntry`/`Registry`, §4.4).
//!
//! A dynamic TID→timer map behind a readers-writer lock: enumeration
//! (pause/resume/cleanup) happens under the read lock, mutation
//! (register/unregister) under the write lock. Never touched from the
//! signal handler itself — only from the registering thread and from
//! `stop`'s teardown path, both of which run with the profiling signal
//! blocked on the calling thread when they need exclusivity.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::RegisterThreadError;
use crate::timer::{ThreadHandle, ThreadTimer};

/// Spec §3.1 `ThreadTimerEntry`.
struct ThreadTimerEntry {
    timer: ThreadTimer,
    overrun_total: AtomicU64,
    active: AtomicBool,
}

/// Spec §3.1 `Registry`: process-wide singleton with init/teardown.
/// `profiler-core` owns the one instance used per profiling session.
pub struct Registry {
    entries: RwLock<FxHashMap<libc::pid_t, ThreadTimerEntry>>,
    total_overruns: AtomicU64,
    create_failures: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            total_overruns: AtomicU64::new(0),
            create_failures: AtomicU64::new(0),
        }
    }

    /// Spec §4.4 "Register": create a timer bound to `tid`/`handle`, arm
    /// it with `interval`, insert. Transient failure is retried once;
    /// persistent failure increments `create_failures` and returns an
    /// error for this thread without aborting the session (spec §7).
    pub fn register_thread(
        &self,
        tid: libc::pid_t,
        handle: ThreadHandle,
        interval: Duration,
    ) -> Result<(), RegisterThreadError> {
        {
            let entries = self.entries.read();
            if entries.contains_key(&tid) {
                return Err(RegisterThreadError::AlreadyRegistered(tid));
            }
        }

        let timer = match ThreadTimer::create(handle) {
            Ok(timer) => timer,
            Err(first_err) => {
                log::debug!("timer_create failed for tid {tid}, retrying once: {first_err}");
                match ThreadTimer::create(handle) {
                    Ok(timer) => timer,
                    Err(err) => {
                        self.create_failures.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                }
            }
        };

        if let Err(err) = timer.arm(Some(interval)) {
            self.create_failures.fetch_add(1, Ordering::Relaxed);
            return Err(RegisterThreadError::TimerArmFailed(err));
        }

        let mut entries = self.entries.write();
        entries.insert(
            tid,
            ThreadTimerEntry {
                timer,
                overrun_total: AtomicU64::new(0),
                active: AtomicBool::new(true),
            },
        );
        Ok(())
    }

    /// Spec §4.4 "Unregister": find, remove, delete the timer. Caller is
    /// responsible for blocking the profiling signal first when this is
    /// called as part of teardown (spec §4.5 step 3).
    pub fn unregister_thread(&self, tid: libc::pid_t) {
        let removed = self.entries.write().remove(&tid);
        if let Some(entry) = removed {
            let final_overrun = entry.timer.overruns();
            self.total_overruns
                .fetch_add(final_overrun as u64 + entry.overrun_total.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Spec §4.4 "Pause / Resume (all)": enumerate under the read lock,
    /// `timer_settime(zero)` or `(saved interval)` per active entry.
    pub fn pause_all(&self) {
        let entries = self.entries.read();
        for entry in entries.values() {
            if entry.active.load(Ordering::Relaxed) {
                let _ = entry.timer.arm(None);
            }
        }
    }

    pub fn resume_all(&self, interval: Duration) {
        let entries = self.entries.read();
        for entry in entries.values() {
            if entry.active.load(Ordering::Relaxed) {
                let _ = entry.timer.arm(Some(interval));
            }
        }
    }

    /// Spec §4.5 "registry cleanup enumerates under write lock with the
    /// signal blocked": drops every entry (each `Drop` runs
    /// `timer_delete`), folding final overrun counts into the total.
    pub fn cleanup_all(&self) {
        let mut entries = self.entries.write();
        for (_, entry) in entries.drain() {
            let final_overrun = entry.timer.overruns();
            self.total_overruns.fetch_add(
                final_overrun as u64 + entry.overrun_total.load(Ordering::Relaxed),
                Ordering::Relaxed,
            );
        }
    }

    /// Called by the resolver after draining a `RawSample` carrying a
    /// nonzero `overrun_count` (spec §4.4 "Overrun accounting": "after
    /// the signal drains in the consumer, sample-carried overrun counts
    /// are added to a process-wide atomic total").
    pub fn record_sample_overrun(&self, tid: libc::pid_t, overrun: u32) {
        if overrun == 0 {
            return;
        }
        let entries = self.entries.read();
        if let Some(entry) = entries.get(&tid) {
            entry.overrun_total.fetch_add(overrun as u64, Ordering::Relaxed);
        }
        self.total_overruns.fetch_add(overrun as u64, Ordering::Relaxed);
    }

    pub fn registered_threads(&self) -> usize {
        self.entries.read().len()
    }

    pub fn active_threads(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.active.load(Ordering::Relaxed))
            .count()
    }

    pub fn total_overruns(&self) -> u64 {
        self.total_overruns.load(Ordering::Relaxed)
    }

    pub fn create_failures(&self) -> u64 {
        self.create_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    fn self_handle() -> (libc::pid_t, ThreadHandle) {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
        (tid, tid)
    }

    #[cfg(not(target_os = "linux"))]
    fn self_handle() -> (libc::pid_t, ThreadHandle) {
        (std::process::id() as libc::pid_t, unsafe { libc::pthread_self() })
    }

    #[test]
    fn register_then_duplicate_register_fails() {
        // Exercises this module's `log::debug!` retry path under a real
        // logger (run with `RUST_LOG=debug` to see it fire).
        let _ = env_logger::try_init();
        let registry = Registry::new();
        let (tid, handle) = self_handle();
        registry
            .register_thread(tid, handle, Duration::from_millis(10))
            .expect("first register should succeed");
        assert_eq!(registry.registered_threads(), 1);

        let err = registry
            .register_thread(tid, handle, Duration::from_millis(10))
            .expect_err("duplicate register should fail");
        assert!(matches!(err, RegisterThreadError::AlreadyRegistered(_)));

        registry.unregister_thread(tid);
        assert_eq!(registry.registered_threads(), 0);
    }

    #[test]
    fn pause_and_resume_do_not_panic_on_empty_registry() {
        let registry = Registry::new();
        registry.pause_all();
        registry.resume_all(Duration::from_millis(10));
        registry.cleanup_all();
    }
}
