//! Lock-free ring buffers behind the reactor/worker duplex queue.
//!
//! Two mirror-image shapes, each a power-of-two ring of slots with a
//! one-byte `phase` per slot:
//!
//! - [`ScmpRing`]: multiple producers claim slots by CAS on the write
//!   index; the single consumer follows the per-slot phase. Carries results
//!   from the workers back to the reactor.
//! - [`McspRing`]: the single producer publishes in order; multiple
//!   consumers claim slots by CAS on the read index. Carries requests from
//!   the reactor to the workers.
//!
//! The phase byte is the per-slot handshake: the producer toggles it full
//! (release) after writing the value, the consumer toggles it empty
//! (release) after reading. An index alone can say a slot *was claimed*;
//! only the phase says its data is published. Indices are monotonically
//! increasing `u64`s, which at any realistic rate cannot wrap within
//! decades, so plain subtraction measures occupancy.
//!
//! Producer-side capacity is reduced by one slot per registered producer so
//! that concurrent claim races can never reach around the ring into a slot
//! the consumer has not yet drained.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

const EMPTY: u8 = 0;
const FULL: u8 = 1;

struct Slot<T> {
    phase: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

fn make_slots<T>(capacity: usize) -> Box<[Slot<T>]> {
    assert!(
        capacity.is_power_of_two() && capacity >= 4,
        "ring capacity must be a power of two"
    );
    (0..capacity).map(|_| Slot::new()).collect()
}

////////////////////////////////////////////////////////////////////////////////
// ScmpRing
////////////////////////////////////////////////////////////////////////////////

/// Single consumer, multiple producers.
pub(crate) struct ScmpRing<T> {
    write: AtomicU64,
    read: AtomicU64,
    mask: u64,
    /// One reserved slot plus one per producer, see the module docs.
    reserve: u64,
    slots: Box<[Slot<T>]>,
}

// Safety: slot values are only touched under the phase handshake.
unsafe impl<T: Send> Send for ScmpRing<T> {}
unsafe impl<T: Send> Sync for ScmpRing<T> {}

impl<T: Copy> ScmpRing<T> {
    pub fn new(capacity: usize, producers: usize) -> Self {
        let reserve = 1 + producers as u64;
        assert!(
            (capacity as u64) > reserve,
            "ring capacity too small for {} producers",
            producers
        );
        Self {
            write: AtomicU64::new(0),
            read: AtomicU64::new(0),
            mask: capacity as u64 - 1,
            reserve,
            slots: make_slots(capacity),
        }
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Usable capacity from a producer's point of view.
    #[inline(always)]
    pub fn usable(&self) -> usize {
        self.slots.len() - self.reserve as usize
    }

    /// Pushes a value from any thread. Returns `false`, with no side
    /// effects, when the ring is full.
    pub fn push(&self, value: T) -> bool {
        loop {
            let w = self.write.load(Ordering::Relaxed);
            let r = self.read.load(Ordering::Acquire);
            if w.wrapping_sub(r) >= self.slots.len() as u64 - self.reserve {
                return false;
            }
            if self
                .write
                .compare_exchange_weak(w, w + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.slots[(w & self.mask) as usize];
                debug_assert_eq!(slot.phase.load(Ordering::Relaxed), EMPTY);
                // Safety: the CAS gave this producer exclusive ownership of
                // the slot until the phase flips
                unsafe { (*slot.value.get()).write(value) };
                slot.phase.store(FULL, Ordering::Release);
                return true;
            }
        }
    }

    /// Pops the next value. Single-consumer side: no CAS needed. Returns
    /// `None` when the ring is empty or the head slot is claimed but not
    /// yet published.
    pub fn pop(&self) -> Option<T> {
        let r = self.read.load(Ordering::Relaxed);
        let slot = &self.slots[(r & self.mask) as usize];
        if slot.phase.load(Ordering::Acquire) != FULL {
            return None;
        }
        // Safety: the acquire on the phase pairs with the producer's
        // release after writing the value
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.phase.store(EMPTY, Ordering::Release);
        self.read.store(r + 1, Ordering::Release);
        Some(value)
    }

    /// Occupancy snapshot; exact only at quiescence.
    pub fn len(&self) -> usize {
        let w = self.write.load(Ordering::Acquire);
        let r = self.read.load(Ordering::Acquire);
        w.wrapping_sub(r) as usize
    }
}

////////////////////////////////////////////////////////////////////////////////
// McspRing
////////////////////////////////////////////////////////////////////////////////

/// Multiple consumers, single producer.
pub(crate) struct McspRing<T> {
    write: AtomicU64,
    read: AtomicU64,
    mask: u64,
    reserve: u64,
    slots: Box<[Slot<T>]>,
}

// Safety: slot values are only touched under the phase handshake.
unsafe impl<T: Send> Send for McspRing<T> {}
unsafe impl<T: Send> Sync for McspRing<T> {}

impl<T: Copy> McspRing<T> {
    pub fn new(capacity: usize, consumers: usize) -> Self {
        let reserve = 1 + consumers as u64;
        assert!(
            (capacity as u64) > reserve,
            "ring capacity too small for {} consumers",
            consumers
        );
        Self {
            write: AtomicU64::new(0),
            read: AtomicU64::new(0),
            mask: capacity as u64 - 1,
            reserve,
            slots: make_slots(capacity),
        }
    }

    #[inline(always)]
    pub fn usable(&self) -> usize {
        self.slots.len() - self.reserve as usize
    }

    /// Pushes a value. Single-producer side: publishes in order. Returns
    /// `false`, with no side effects, when the ring is full or the target
    /// slot is still being drained by a lagging consumer.
    pub fn push(&self, value: T) -> bool {
        let w = self.write.load(Ordering::Relaxed);
        let r = self.read.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= self.slots.len() as u64 - self.reserve {
            return false;
        }
        let slot = &self.slots[(w & self.mask) as usize];
        if slot.phase.load(Ordering::Acquire) != EMPTY {
            return false;
        }
        // Safety: phase EMPTY means the last consumer of this slot is done
        unsafe { (*slot.value.get()).write(value) };
        slot.phase.store(FULL, Ordering::Release);
        self.write.store(w + 1, Ordering::Release);
        true
    }

    /// Pops the next value from any thread.
    pub fn pop(&self) -> Option<T> {
        loop {
            let r = self.read.load(Ordering::Relaxed);
            let w = self.write.load(Ordering::Acquire);
            if r == w {
                return None;
            }
            if self
                .read
                .compare_exchange_weak(r, r + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let slot = &self.slots[(r & self.mask) as usize];
                // The single producer published the phase before advancing
                // the write index we acquired above.
                debug_assert_eq!(slot.phase.load(Ordering::Acquire), FULL);
                // Safety: the CAS gave this consumer exclusive ownership of
                // the slot until the phase flips
                let value = unsafe { (*slot.value.get()).assume_init_read() };
                slot.phase.store(EMPTY, Ordering::Release);
                return Some(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn scmp_push_pop_single_thread() {
        let ring = ScmpRing::new(8, 1);
        assert_eq!(ring.usable(), 6);
        for i in 0..6u32 {
            assert!(ring.push(i));
        }
        // full: fails with no side effects
        assert!(!ring.push(99));
        for i in 0..6u32 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
        // wrap around
        assert!(ring.push(7));
        assert_eq!(ring.pop(), Some(7));
    }

    #[test]
    fn mcsp_push_pop_single_thread() {
        let ring = McspRing::new(8, 1);
        for i in 0..ring.usable() as u32 {
            assert!(ring.push(i));
        }
        assert!(!ring.push(99));
        for i in 0..ring.usable() as u32 {
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.pop(), None);
    }

    /// 24 producer threads, 100 integers each, capacity 128, one consumer.
    /// Every value arrives exactly once and each producer's stream stays in
    /// order.
    #[test]
    fn scmp_producer_burst() {
        const PRODUCERS: u64 = 24;
        const PER_PRODUCER: u64 = 100;

        let ring = Arc::new(ScmpRing::new(128, PRODUCERS as usize));
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i;
                    while !ring.push(value) {
                        thread::yield_now();
                    }
                }
            }));
        }

        let mut received = Vec::with_capacity((PRODUCERS * PER_PRODUCER) as usize);
        while received.len() < (PRODUCERS * PER_PRODUCER) as usize {
            match ring.pop() {
                Some(v) => received.push(v),
                None => thread::yield_now(),
            }
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(ring.pop(), None);
        assert_eq!(ring.len(), 0);

        // per-producer order is preserved
        let mut last = vec![None::<u64>; PRODUCERS as usize];
        for v in &received {
            let p = (v / PER_PRODUCER) as usize;
            assert!(last[p].map_or(true, |prev| prev < *v), "reordered in stream {p}");
            last[p] = Some(*v);
        }
        // and nothing was lost or duplicated
        let mut sorted = received;
        sorted.sort_unstable();
        let expected: Vec<u64> = (0..PRODUCERS * PER_PRODUCER).collect();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn mcsp_many_consumers() {
        const TOTAL: u64 = 4000;
        const CONSUMERS: usize = 6;

        let ring = Arc::new(McspRing::new(64, CONSUMERS));
        let mut handles = Vec::new();
        for _ in 0..CONSUMERS {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                loop {
                    match ring.pop() {
                        Some(u64::MAX) => break,
                        Some(v) => got.push(v),
                        None => thread::yield_now(),
                    }
                }
                got
            }));
        }

        for v in 0..TOTAL {
            while !ring.push(v) {
                thread::yield_now();
            }
        }
        for _ in 0..CONSUMERS {
            while !ring.push(u64::MAX) {
                thread::yield_now();
            }
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (0..TOTAL).collect();
        assert_eq!(all, expected);
    }
}
