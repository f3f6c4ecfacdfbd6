//! `timer_create(CLOCK_THREAD_CPUTIME_ID, SIGEV_THREAD_ID, ...)` bound to
//! one TID (spec §4.4: "a CPU-time timer bound to the thread via a
//! platform-specific mechanism that delivers the signal to that TID").
//!
//! `libc`'s `sigevent` binding models glibc's anonymous
//! `_sigev_un` union only as opaque padding, so it doesn't expose the
//! `_tid` member `SIGEV_THREAD_ID` needs. [`RawSigevent`] mirrors
//! glibc's `struct sigevent` layout closely enough that writing the TID
//! at the union's offset and handing the struct to `timer_create` as a
//! `*mut libc::sigevent` reads back correctly in the kernel. The same
//! raw-layout trick the teacher uses for mach message structures it
//! doesn't otherwise have bindings for (`mac/mach_ipc.rs`,
//! `mac/thread_info.rs`).

use std::io;
use std::time::Duration;

use crate::error::RegisterThreadError;

/// Thread identifier as the kernel names it (`gettid(2)`), not the
/// `pthread_t` opaque handle.
pub type ThreadHandle = libc::pid_t;

pub const PROFILING_SIGNAL: libc::c_int = libc::SIGPROF;

const SIGEV_THREAD_ID: libc::c_int = 4;

#[repr(C)]
struct RawSigevent {
    sigev_value: libc::sigval,
    sigev_signo: libc::c_int,
    sigev_notify: libc::c_int,
    sigev_un_tid: libc::c_int,
    // Padding to match `sizeof(struct sigevent)` on glibc so
    // `timer_create` never reads past the end of this struct.
    _reserved: [u8; 44],
}

/// A per-thread CPU-time timer. Created once by `register_thread`,
/// destroyed by `unregister_thread`/`cleanup_all` (spec §3.1
/// `ThreadTimerEntry`).
pub struct ThreadTimer {
    id: libc::timer_t,
}

// Safety: `id` only ever names a kernel timer object, manipulated
// exclusively through `timer_settime`/`timer_getoverrun`/`timer_delete`,
// all safe to call from any thread.
unsafe impl Send for ThreadTimer {}

impl ThreadTimer {
    pub fn create(tid: ThreadHandle) -> Result<Self, RegisterThreadError> {
        let mut ev: RawSigevent = unsafe { std::mem::zeroed() };
        ev.sigev_notify = SIGEV_THREAD_ID;
        ev.sigev_signo = PROFILING_SIGNAL;
        ev.sigev_un_tid = tid;

        let mut id: libc::timer_t = std::ptr::null_mut();
        let rc = unsafe {
            libc::timer_create(
                libc::CLOCK_THREAD_CPUTIME_ID,
                &mut ev as *mut RawSigevent as *mut libc::sigevent,
                &mut id,
            )
        };
        if rc != 0 {
            return Err(RegisterThreadError::TimerCreateFailed(
                io::Error::last_os_error(),
            ));
        }
        Ok(Self { id })
    }

    /// Arms with `interval`, or disarms (spec §4.4 pause:
    /// "timer_settime(zero interval)") when `interval` is `None`.
    pub fn arm(&self, interval: Option<Duration>) -> io::Result<()> {
        let ts = duration_to_timespec(interval.unwrap_or_default());
        let spec = libc::itimerspec {
            it_interval: ts,
            it_value: ts,
        };
        let rc = unsafe { libc::timer_settime(self.id, 0, &spec, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Spec §4.4 "Overrun accounting": captured on timer destruction and
    /// added to the process-wide total.
    pub fn overruns(&self) -> u32 {
        let rc = unsafe { libc::timer_getoverrun(self.id) };
        rc.max(0) as u32
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        unsafe {
            libc::timer_delete(self.id);
        }
    }
}

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_arm_self_thread_timer() {
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as ThreadHandle };
        let timer = ThreadTimer::create(tid).expect("timer_create should succeed for self");
        timer
            .arm(Some(Duration::from_millis(10)))
            .expect("arming should succeed");
        timer.arm(None).expect("disarming should succeed");
    }
}
