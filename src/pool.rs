//! Memory Pools
//!
//! Pre-allocated object pools so the trading path recycles heap allocations
//! instead of hitting the allocator. The mutex-guarded pool grows by a
//! power-of-two factor; the lock-free variant is fixed-capacity and reserved
//! for single-threaded hot sections.

use crate::types::Order;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Mutex-guarded growing pool of boxed objects.
pub struct MemoryPool<T: Default> {
    free: Mutex<Vec<Box<T>>>,
    total_allocated: AtomicUsize,
    block_size: AtomicUsize,
    growth_factor: usize,
}

impl<T: Default> MemoryPool<T> {
    pub fn new(initial_size: usize, growth_factor: usize) -> Self {
        let pool = Self {
            free: Mutex::new(Vec::with_capacity(initial_size)),
            total_allocated: AtomicUsize::new(0),
            block_size: AtomicUsize::new(initial_size.max(1)),
            growth_factor: growth_factor.max(2),
        };
        pool.expand(initial_size.max(1));
        pool
    }

    /// Take an object from the pool, growing it if empty. The returned object
    /// is reset to its default state. The boolean is true when the request was
    /// served without expansion.
    pub fn acquire_tracked(&self) -> (Box<T>, bool) {
        let mut free = self.free.lock();
        let hit = !free.is_empty();
        if !hit {
            let grown = self.block_size.load(Ordering::Relaxed) * self.growth_factor;
            Self::expand_into(&mut free, grown);
            self.total_allocated.fetch_add(grown, Ordering::Relaxed);
            self.block_size.store(grown, Ordering::Relaxed);
        }
        let mut obj = free.pop().expect("pool expanded but empty");
        *obj = T::default();
        (obj, hit)
    }

    pub fn acquire(&self) -> Box<T> {
        self.acquire_tracked().0
    }

    /// Return an object to the free list.
    pub fn release(&self, obj: Box<T>) {
        self.free.lock().push(obj);
    }

    pub fn total_allocated(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.total_allocated().saturating_sub(self.available())
    }

    /// Pre-allocate additional capacity outside the hot path.
    pub fn reserve(&self, additional: usize) {
        let mut free = self.free.lock();
        Self::expand_into(&mut free, additional);
        self.total_allocated.fetch_add(additional, Ordering::Relaxed);
    }

    fn expand(&self, count: usize) {
        let mut free = self.free.lock();
        Self::expand_into(&mut free, count);
        self.total_allocated.fetch_add(count, Ordering::Relaxed);
    }

    fn expand_into(free: &mut Vec<Box<T>>, count: usize) {
        free.reserve(count);
        for _ in 0..count {
            free.push(Box::default());
        }
    }
}

/// Fixed-capacity pool without locking. Not thread-safe; intended for a
/// single-threaded critical section that owns it exclusively. Exhaustion
/// returns `None` and the caller escalates to the guarded pool.
pub struct LockFreeMemoryPool<T: Default> {
    free: Vec<Box<T>>,
    capacity: usize,
}

impl<T: Default> LockFreeMemoryPool<T> {
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Box::default());
        }
        Self { free, capacity }
    }

    pub fn acquire(&mut self) -> Option<Box<T>> {
        let mut obj = self.free.pop()?;
        *obj = T::default();
        Some(obj)
    }

    pub fn release(&mut self, obj: Box<T>) {
        if self.free.len() < self.capacity {
            self.free.push(obj);
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn in_use(&self) -> usize {
        self.capacity - self.free.len()
    }

    /// True when headroom has dropped below 10% of capacity.
    #[inline]
    pub fn needs_expansion(&self) -> bool {
        self.free.len() * 10 < self.capacity
    }
}

/// Pool usage snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub total_allocated: usize,
    pub in_use: usize,
    pub peak_usage: usize,
    pub allocation_requests: usize,
    pub cache_hits: usize,
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        if self.allocation_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.allocation_requests as f64
        }
    }
}

/// Order-object pool with hit-rate and peak-usage tracking.
pub struct OrderPool {
    pool: MemoryPool<Order>,
    peak_usage: AtomicUsize,
    allocation_requests: AtomicUsize,
    cache_hits: AtomicUsize,
}

impl OrderPool {
    pub fn new(initial_size: usize) -> Self {
        Self {
            pool: MemoryPool::new(initial_size, 2),
            peak_usage: AtomicUsize::new(0),
            allocation_requests: AtomicUsize::new(0),
            cache_hits: AtomicUsize::new(0),
        }
    }

    pub fn acquire_order(&self) -> Box<Order> {
        self.allocation_requests.fetch_add(1, Ordering::Relaxed);
        let (order, hit) = self.pool.acquire_tracked();
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.peak_usage
            .fetch_max(self.pool.in_use(), Ordering::Relaxed);
        order
    }

    pub fn release_order(&self, order: Box<Order>) {
        self.pool.release(order);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_allocated: self.pool.total_allocated(),
            in_use: self.pool.in_use(),
            peak_usage: self.peak_usage.load(Ordering::Relaxed),
            allocation_requests: self.allocation_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.peak_usage.store(0, Ordering::Relaxed);
        self.allocation_requests.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
    }
}

/// Owns every pool in the system. Constructed once during assembly and
/// passed explicitly to the components that allocate.
pub struct MemoryManager {
    order_pool: OrderPool,
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl MemoryManager {
    pub fn new(order_pool_size: usize) -> Self {
        Self {
            order_pool: OrderPool::new(order_pool_size),
        }
    }

    #[inline]
    pub fn order_pool(&self) -> &OrderPool {
        &self.order_pool
    }

    pub fn stats(&self) -> PoolStats {
        self.order_pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_recycles_and_counts() {
        let pool: MemoryPool<Order> = MemoryPool::new(4, 2);
        assert_eq!(pool.total_allocated(), 4);
        assert_eq!(pool.available(), 4);

        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(pool.in_use(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn pool_grows_when_exhausted() {
        let pool: MemoryPool<Order> = MemoryPool::new(2, 2);
        let _held: Vec<_> = (0..3).map(|_| pool.acquire()).collect();
        assert!(pool.total_allocated() > 2);
    }

    #[test]
    fn acquired_order_is_reset() {
        let pool: MemoryPool<Order> = MemoryPool::new(1, 2);
        let mut order = pool.acquire();
        order.order_id = 42;
        order.price = 99.5;
        pool.release(order);

        let recycled = pool.acquire();
        assert_eq!(recycled.order_id, 0);
        assert_eq!(recycled.price, 0.0);
    }

    #[test]
    fn lock_free_pool_exhausts_to_none() {
        let mut pool: LockFreeMemoryPool<Order> = LockFreeMemoryPool::new(2);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert!(pool.needs_expansion());

        pool.release(a);
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn order_pool_hit_rate() {
        let pool = OrderPool::new(2);
        let a = pool.acquire_order();
        pool.release_order(a);
        let b = pool.acquire_order();
        pool.release_order(b);

        let stats = pool.stats();
        assert_eq!(stats.allocation_requests, 2);
        assert_eq!(stats.cache_hits, 2);
        assert!((stats.hit_rate() - 1.0).abs() < f64::EPSILON);
        assert!(stats.peak_usage >= 1);
    }
}
