//! Poisson-process byte-interval sampling (spec §4.7): decides which
//! allocations get a stack walk attached, keeping the expected sampled
//! byte interval at `mean_bytes` regardless of individual allocation
//! sizes (so a workload dominated by large allocations isn't
//! over-sampled relative to one dominated by small ones).
//!
//! Each thread owns its own [`PerThreadState`]: the byte counter, the
//! PRNG, and a re-entrancy flag guarding against the allocator itself
//! calling back into `malloc` while we're still inside the interposer
//! (glibc's `dlsym(RTLD_NEXT, ...)` path on first use is the classic
//! trigger for this).

use std::cell::Cell;

/// `xorshift128+`: a 2-word generator that passes SmallCrush/BigCrush and
/// needs no heap allocation, no locks, and no syscalls — all attractive
/// properties for code invoked on the hot allocation path. Hand-rolled
/// rather than pulled from `rand` since the algorithm is a handful of
/// lines and the bootstrap seed is all `rand` is used for (spec §4.7
/// supplement).
struct XorShift128Plus {
    state: [u64; 2],
}

impl XorShift128Plus {
    fn seeded_from_rand() -> Self {
        use rand::RngCore;
        let mut seed = [0u64; 2];
        let mut rng = rand::thread_rng();
        seed[0] = rng.next_u64();
        seed[1] = rng.next_u64();
        // xorshift128+ requires a non-all-zero state.
        if seed[0] == 0 && seed[1] == 0 {
            seed[0] = 0x9E3779B97F4A7C15;
        }
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        let mut s1 = self.state[0];
        let s0 = self.state[1];
        let result = s1.wrapping_add(s0);
        self.state[0] = s0;
        s1 ^= s1 << 23;
        s1 ^= s1 >> 17;
        s1 ^= s0;
        s1 ^= s0 >> 26;
        self.state[1] = s1;
        result
    }

    /// Uniform open interval `(0, 1)`, never exactly 0 so `ln` stays finite.
    fn next_open01(&mut self) -> f64 {
        // Top 53 bits give full f64 mantissa precision; +1 keeps us off zero.
        let bits = (self.next_u64() >> 11) + 1;
        bits as f64 / ((1u64 << 53) as f64 + 1.0)
    }
}

pub struct PerThreadState {
    prng: XorShift128Plus,
    bytes_until_next_sample: i64,
    in_interposer: bool,
    /// Snapshot of the PID this state was created under; see
    /// [`PerThreadState::check_fork`].
    pid_at_init: libc::pid_t,
}

impl PerThreadState {
    fn new() -> Self {
        let mut prng = XorShift128Plus::seeded_from_rand();
        let threshold = next_threshold(&mut prng, DEFAULT_MEAN_BYTES);
        Self {
            prng,
            bytes_until_next_sample: threshold,
            in_interposer: false,
            pid_at_init: unsafe { libc::getpid() },
        }
    }

    /// Spec §4.7 edge case: "process forks while sampling is active" —
    /// a child's thread-locals survive `fork()` verbatim (only the
    /// calling thread exists post-fork, but its TLS is a byte-for-byte
    /// copy), so a fresh generator with a fresh `thread_rng` reseed
    /// avoids the child replaying the exact same sample sequence as the
    /// parent.
    fn check_fork(&mut self) {
        let current_pid = unsafe { libc::getpid() };
        if current_pid != self.pid_at_init {
            *self = Self::new();
        }
    }
}

thread_local! {
    static STATE: std::cell::RefCell<Option<PerThreadState>> = const { std::cell::RefCell::new(None) };
}

pub const DEFAULT_MEAN_BYTES: i64 = 512 * 1024;

fn next_threshold(prng: &mut XorShift128Plus, mean_bytes: i64) -> i64 {
    let u = prng.next_open01();
    let sample = -(mean_bytes as f64) * u.ln();
    // Spec §4.7: "clamped to a minimum of 1 byte" so a degenerate draw
    // never produces a zero or negative threshold that samples every
    // single allocation forever.
    (sample as i64).max(1)
}

/// Re-entrancy guard: `true` means the calling thread is already inside
/// the interposer (e.g. the allocator's own bookkeeping allocated), so
/// the caller must skip sampling and walk-triggering entirely to avoid
/// recursing into the signal-unsafe(-ish) walker from inside `malloc`.
pub struct ReentrancyGuard(bool);

impl ReentrancyGuard {
    pub fn is_reentrant(&self) -> bool {
        self.0
    }
}

/// Runs `f` with the calling thread's Poisson state, returning whether
/// this particular allocation of `size` bytes should be sampled (i.e.
/// the running byte counter crossed the current threshold), and whether
/// we were already inside the interposer on this thread.
///
/// `f` receives `(should_sample, effective_mean_bytes)`; the caller is
/// responsible for computing `weight` from `effective_mean_bytes` to
/// hand to [`crate::heap_map::HeapMap`] (spec §4.7: `weight = mean_bytes`
/// at the moment of the sample).
pub fn on_allocation(size: usize, mean_bytes: i64) -> (ReentrancyGuard, bool) {
    STATE.with(|cell| {
        let mut state_ref = cell.borrow_mut();
        if state_ref.is_none() {
            *state_ref = Some(PerThreadState::new());
        }
        let state = state_ref.as_mut().unwrap();

        if state.in_interposer {
            return (ReentrancyGuard(true), false);
        }
        state.check_fork();
        state.in_interposer = true;

        state.bytes_until_next_sample -= size as i64;
        let should_sample = state.bytes_until_next_sample <= 0;
        if should_sample {
            state.bytes_until_next_sample = next_threshold(&mut state.prng, mean_bytes);
        }
        (ReentrancyGuard(false), should_sample)
    })
}

/// Must be called exactly once, after the allocation this
/// [`ReentrancyGuard`] was obtained for has completed, to clear the
/// thread's re-entrancy flag. No-op if the guard observed re-entrancy
/// (the outer call owns clearing the flag in that case).
pub fn finish_allocation(guard: ReentrancyGuard) {
    if guard.is_reentrant() {
        return;
    }
    STATE.with(|cell| {
        if let Some(state) = cell.borrow_mut().as_mut() {
            state.in_interposer = false;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_never_zero_or_negative() {
        let mut prng = XorShift128Plus::seeded_from_rand();
        for _ in 0..10_000 {
            assert!(next_threshold(&mut prng, DEFAULT_MEAN_BYTES) >= 1);
        }
    }

    #[test]
    fn prng_is_not_degenerate() {
        let mut prng = XorShift128Plus { state: [1, 2] };
        let mut seen_zero = false;
        let mut distinct = std::collections::HashSet::new();
        for _ in 0..1000 {
            let v = prng.next_u64();
            if v == 0 {
                seen_zero = true;
            }
            distinct.insert(v);
        }
        assert!(!seen_zero);
        assert!(distinct.len() > 990, "xorshift128+ output looks degenerate");
    }

    #[test]
    fn mean_interval_is_approximately_correct_over_many_draws() {
        let mut prng = XorShift128Plus::seeded_from_rand();
        let mean = 1024i64;
        let n = 20_000;
        let total: i64 = (0..n).map(|_| next_threshold(&mut prng, mean)).sum();
        let observed_mean = total as f64 / n as f64;
        let relative_error = (observed_mean - mean as f64).abs() / mean as f64;
        assert!(relative_error < 0.05, "observed mean {observed_mean} far from {mean}");
    }

    #[test]
    fn reentrant_allocation_is_never_sampled() {
        let (_guard1, _) = on_allocation(64, DEFAULT_MEAN_BYTES);
        let (guard2, sampled2) = on_allocation(64, DEFAULT_MEAN_BYTES);
        assert!(guard2.is_reentrant());
        assert!(!sampled2);
    }
}
