use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::sample::RawSample;

/// Default ring capacity: 2^16 slots of fixed-size raw samples, ≈16 MiB
/// total (spec §4.2).
pub const DEFAULT_CAPACITY: usize = 1 << 16;

/// Fixed-capacity, lock-free single-producer/single-consumer ring of
/// [`RawSample`]s (spec §4.2). The producer side is async-signal-safe:
/// fixed-size writes to a pre-allocated slot, two atomic loads, one atomic
/// store — no allocation, no locking, no runtime calls.
///
/// Capacity must be a power of two; [`Ring::new`] panics otherwise (this
/// check runs once at `Profiler::start`, never on the producer path).
pub struct Ring {
    slots: Box<[UnsafeCell<RawSample>]>,
    mask: usize,
    write: AtomicU64,
    read: AtomicU64,
    dropped: AtomicU64,
}

// Safety: exactly one producer thread calls `push`, exactly one consumer
// thread calls `pop`/`pop_batch`; all cross-thread visibility is mediated
// by the acquire/release operations on `write`/`read` below.
unsafe impl Sync for Ring {}
unsafe impl Send for Ring {}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(RawSample::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
            write: AtomicU64::new(0),
            read: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Producer path (spec §4.2 steps 1–4). Must only ever be called from
    /// the single designated producer (the signal handler on the sampled
    /// thread). Drops the sample and increments the dropped counter if the
    /// ring is full, rather than blocking.
    ///
    /// Async-signal-safe: no allocation, no locking, bounded work.
    pub fn push(&self, sample: RawSample) {
        let write = self.write.load(Ordering::Relaxed);
        let next = write.wrapping_add(1);
        // ATOMICS: acquire load of `read` ensures we see every slot the
        // consumer has already vacated before deciding whether there is
        // room for this write.
        let read = self.read.load(Ordering::Acquire);
        if (next - read) as usize > self.capacity() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let index = (write as usize) & self.mask;
        // Safety: this slot is not concurrently read — the consumer only
        // reads indices below `read`, and we've just confirmed there is
        // room, so `index` is not in the consumer's live range.
        unsafe {
            *self.slots[index].get() = sample;
        }
        // ATOMICS: release store of `write` publishes the slot contents
        // written just above to the consumer's subsequent acquire load.
        self.write.store(next, Ordering::Release);
    }

    /// Consumer path. Returns `None` if the ring is empty. Must only ever
    /// be called from the single designated consumer thread.
    pub fn pop(&self) -> Option<RawSample> {
        let read = self.read.load(Ordering::Relaxed);
        // ATOMICS: acquire load of `write` ensures the slot contents
        // written by the producer's release store are visible here.
        let write = self.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let index = (read as usize) & self.mask;
        // Safety: the producer will not touch this slot again until the
        // ring wraps all the way around, which cannot happen before we
        // publish the advanced `read` index below.
        let sample = unsafe { *self.slots[index].get() };
        // ATOMICS: release store of `read` tells the producer this slot is
        // free to be overwritten again.
        self.read.store(read.wrapping_add(1), Ordering::Release);
        Some(sample)
    }

    /// Drains every sample currently available, calling `f` on each. Used
    /// at teardown (spec §4.5 step 7: "drain remaining ring contents").
    pub fn drain(&self, mut f: impl FnMut(RawSample)) {
        while let Some(sample) = self.pop() {
            f(sample);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (write - read) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_with_tid(tid: u64) -> RawSample {
        RawSample { tid, ..RawSample::default() }
    }

    #[test]
    fn push_pop_round_trips_in_order() {
        let ring = Ring::new(8);
        for i in 0..5 {
            ring.push(sample_with_tid(i));
        }
        for i in 0..5 {
            assert_eq!(ring.pop().unwrap().tid, i);
        }
        assert!(ring.pop().is_none());
    }

    #[test]
    fn drops_rather_than_overwrites_when_full() {
        let ring = Ring::new(4);
        for i in 0..4 {
            ring.push(sample_with_tid(i));
        }
        // Ring is now full (capacity 4, 4 entries).
        ring.push(sample_with_tid(99));
        assert_eq!(ring.dropped_count(), 1);
        // The four original entries are all still intact, in order.
        for i in 0..4 {
            assert_eq!(ring.pop().unwrap().tid, i);
        }
        assert!(ring.pop().is_none());
    }

    #[test]
    fn drain_consumes_everything() {
        let ring = Ring::new(8);
        for i in 0..3 {
            ring.push(sample_with_tid(i));
        }
        let mut seen = Vec::new();
        ring.drain(|s| seen.push(s.tid));
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_spsc_preserves_every_sample_exactly_once() {
        use std::sync::Arc;
        use std::thread;

        let ring = Arc::new(Ring::new(1024));
        const N: u64 = 200_000;

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..N {
                    loop {
                        let before = ring.dropped_count();
                        ring.push(sample_with_tid(i));
                        if ring.dropped_count() == before {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut received = Vec::with_capacity(N as usize);
                while (received.len() as u64) < N {
                    if let Some(sample) = ring.pop() {
                        received.push(sample.tid);
                    } else {
                        thread::yield_now();
                    }
                }
                received
            })
        };

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received, (0..N).collect::<Vec<_>>());
    }

    proptest::proptest! {
        #[test]
        fn write_minus_read_never_exceeds_capacity(ops in proptest::collection::vec(proptest::bool::ANY, 0..500)) {
            let ring = Ring::new(16);
            for push in ops {
                if push {
                    ring.push(sample_with_tid(0));
                } else {
                    ring.pop();
                }
                prop_assert!(ring.len() <= ring.capacity());
            }
        }
    }
}
