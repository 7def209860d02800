//! Lock-Free Sample Ring
//!
//! Single-producer single-consumer circular buffer of f64 samples with
//! power-of-two capacity. On overrun the oldest value is dropped and a
//! `full` flag latches. Slots store f64 bit patterns in atomics so snapshot
//! reads are race-free without locking the producer.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

pub struct SpscRing {
    buf: Box<[AtomicU64]>,
    mask: usize,
    /// Producer writes here.
    head: CachePadded<AtomicUsize>,
    /// Consumer reads from here; advanced by the producer on overrun.
    tail: CachePadded<AtomicUsize>,
    full: AtomicBool,
}

impl SpscRing {
    /// `capacity` must be a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        let buf = (0..capacity).map(|_| AtomicU64::new(0)).collect();
        Self {
            buf,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            full: AtomicBool::new(false),
        }
    }

    /// O(1) insertion; single producer only. Overwrites the oldest sample
    /// when the ring is full.
    #[inline]
    pub fn push(&self, value: f64) {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & self.mask;

        if next == self.tail.load(Ordering::Acquire) {
            let tail = self.tail.load(Ordering::Relaxed);
            self.tail.store((tail + 1) & self.mask, Ordering::Release);
            self.full.store(true, Ordering::Relaxed);
        }

        self.buf[head].store(value.to_bits(), Ordering::Relaxed);
        self.head.store(next, Ordering::Release);
    }

    /// Approximate number of buffered samples.
    #[inline]
    pub fn len(&self) -> usize {
        let h = self.head.load(Ordering::Relaxed);
        let t = self.tail.load(Ordering::Relaxed);
        if h >= t {
            h - t
        } else {
            self.buf.len() - (t - h)
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the ring has ever overrun.
    #[inline]
    pub fn has_been_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }

    /// Copy buffered samples oldest-first for statistics computation.
    pub fn snapshot(&self) -> Vec<f64> {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);

        let mut out = Vec::with_capacity(self.buf.len());
        let mut pos = tail;
        while pos != head {
            out.push(f64::from_bits(self.buf[pos].load(Ordering::Relaxed)));
            pos = (pos + 1) & self.mask;
        }
        out
    }

    pub fn clear(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
        self.full.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_snapshot_preserve_order() {
        let ring = SpscRing::new(8);
        for i in 0..5 {
            ring.push(i as f64);
        }
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.snapshot(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert!(!ring.has_been_full());
    }

    #[test]
    fn overrun_drops_oldest_and_latches_full() {
        let ring = SpscRing::new(4);
        for i in 0..10 {
            ring.push(i as f64);
        }
        assert!(ring.has_been_full());
        let snap = ring.snapshot();
        // Capacity 4 ring holds at most 3 live samples; the newest survive.
        assert_eq!(snap, vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn clear_resets_state() {
        let ring = SpscRing::new(4);
        ring.push(1.0);
        ring.push(2.0);
        ring.clear();
        assert!(ring.is_empty());
        assert!(ring.snapshot().is_empty());
    }
}
