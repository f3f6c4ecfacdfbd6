//! Non-Linux fallback: there is no portable `SIGEV_THREAD_ID` equivalent
//! outside Linux, so macOS (and any other non-Linux target that reaches
//! this crate) gets a dedicated ticker thread per registered thread that
//! directs the profiling signal at a specific `pthread_t` on a fixed
//! wall-clock interval via `pthread_kill`. This samples wall-clock time
//! rather than CPU time — coarser than the Linux path — but the rest of
//! the sampler (ring, handler, resolver) is identical across platforms;
//! spec §4.4's precise timer mechanism is explicitly scoped to Linux.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::RegisterThreadError;

/// The native thread handle `pthread_kill` expects.
pub type ThreadHandle = libc::pthread_t;

pub const PROFILING_SIGNAL: libc::c_int = libc::SIGPROF;

pub struct ThreadTimer {
    target: ThreadHandle,
    running: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTimer {
    pub fn create(target: ThreadHandle) -> Result<Self, RegisterThreadError> {
        Ok(Self {
            target,
            running: Arc::new(AtomicBool::new(false)),
            ticker: Mutex::new(None),
        })
    }

    pub fn arm(&self, interval: Option<Duration>) -> io::Result<()> {
        let mut ticker = self.ticker.lock().unwrap();
        match interval {
            None => {
                self.running.store(false, Ordering::SeqCst);
                if let Some(handle) = ticker.take() {
                    let _ = handle.join();
                }
            }
            Some(interval) if ticker.is_none() => {
                self.running.store(true, Ordering::SeqCst);
                let running = Arc::clone(&self.running);
                let target = self.target;
                *ticker = Some(std::thread::spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        std::thread::sleep(interval);
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        unsafe {
                            libc::pthread_kill(target, PROFILING_SIGNAL);
                        }
                    }
                }));
            }
            Some(_) => {
                // Already ticking; interval changes take effect once the
                // caller disarms and rearms (matches the coarse fallback
                // nature of this path).
            }
        }
        Ok(())
    }

    pub fn overruns(&self) -> u32 {
        // The ticker thread cannot overrun the way a kernel timer can.
        0
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
