//! Size-classed buffer pool with a thread-local and a global tier.
//!
//! Requests are rounded up to one of the bins in [`POOL_BIN_SIZES`]. A rent
//! checks the calling thread's ring for that bin first, then the pool-wide
//! lock-free queue, and only then allocates. Returning a buffer walks the
//! same tiers in the same order; when both are full the buffer is dropped.
//!
//! Requests above [`MAX_POOLED_SIZE`](crate::audio::constants::MAX_POOLED_SIZE) get a private allocation that is freed
//! on release, and zero-length requests get an empty buffer that owns no heap
//! memory at all.
//!
//! A [`PooledBuffer`] is released exactly once: [`PooledBuffer::dispose`]
//! consumes it, and dropping it releases it on every other exit path.
//!
//! ```compile_fail
//! use streamcodec::audio::buffer::BufferPool;
//!
//! let pool = BufferPool::<u8>::default();
//! let buffer = pool.rent(64);
//! buffer.dispose();
//! buffer.dispose();
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::queue::ArrayQueue;
use tracing::{debug, trace};

use crate::audio::constants::{DEFAULT_BIN_INDEX, DEFAULT_BUFFER_SIZE, POOL_BIN_SIZES};
use crate::configs::PoolConfig;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Per-thread caches, keyed by pool id so independent pools never mix.
    static LOCAL_CACHES: RefCell<HashMap<usize, Box<dyn LocalSlot>>> = RefCell::new(HashMap::new());
}

/// Element types a pool can hold.
pub trait PoolElement: Copy + Default + Send + 'static {}

impl<T: Copy + Default + Send + 'static> PoolElement for T {}

/// Index of the smallest bin able to hold `min_size` elements.
pub fn bin_for(min_size: usize) -> Option<usize> {
    if min_size == DEFAULT_BUFFER_SIZE {
        return Some(DEFAULT_BIN_INDEX);
    }
    POOL_BIN_SIZES.iter().position(|&size| size >= min_size)
}

// ── Stats ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PoolCounters {
    rented: AtomicU64,
    pooled_allocations: AtomicU64,
    unpooled_allocations: AtomicU64,
    reclaimed: AtomicU64,
    lost: AtomicU64,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Rents served from a bin, cached or not.
    pub rented: u64,
    /// Bin buffers that had to be freshly allocated.
    pub pooled_allocations: u64,
    /// Oversized buffers allocated outside the bins.
    pub unpooled_allocations: u64,
    /// Buffers accepted back into a cache tier.
    pub reclaimed: u64,
    /// Buffers dropped because both tiers were full.
    pub lost: u64,
}

// ── Thread-local tier ────────────────────────────────────────────────────────

/// Type-erased view of one pool's cache on one thread.
trait LocalSlot {
    /// True once the owning pool has been dropped.
    fn is_orphaned(&self) -> bool;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct LocalEntry<T> {
    owner: Weak<PoolShared<T>>,
    cache: LocalCache<T>,
}

impl<T: 'static> LocalSlot for LocalEntry<T> {
    fn is_orphaned(&self) -> bool {
        self.owner.strong_count() == 0
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct LocalCache<T> {
    bins: Vec<Vec<Vec<T>>>,
    capacity: usize,
}

impl<T> LocalCache<T> {
    fn new(capacity: usize) -> Self {
        Self {
            bins: (0..POOL_BIN_SIZES.len())
                .map(|_| Vec::with_capacity(capacity))
                .collect(),
            capacity,
        }
    }

    fn pop(&mut self, bin: usize) -> Option<Vec<T>> {
        self.bins[bin].pop()
    }

    fn push(&mut self, bin: usize, data: Vec<T>) -> Result<(), Vec<T>> {
        let ring = &mut self.bins[bin];
        if ring.len() >= self.capacity {
            return Err(data);
        }
        ring.push(data);
        Ok(())
    }
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct PoolShared<T> {
    id: usize,
    config: PoolConfig,
    global: Vec<ArrayQueue<Vec<T>>>,
    counters: PoolCounters,
}

impl<T: PoolElement> PoolShared<T> {
    /// Runs `f` against this pool's cache on the calling thread. Returns `None`
    /// while the thread is tearing down its locals.
    ///
    /// Creating a cache first drops the caches of pools that died elsewhere.
    fn with_local<R>(self: &Arc<Self>, f: impl FnOnce(&mut LocalCache<T>) -> R) -> Option<R> {
        if self.config.thread_local_capacity == 0 {
            return None;
        }
        LOCAL_CACHES
            .try_with(|caches| {
                let mut caches = caches.try_borrow_mut().ok()?;
                if !caches.contains_key(&self.id) {
                    let before = caches.len();
                    caches.retain(|_, slot| !slot.is_orphaned());
                    if caches.len() < before {
                        trace!(pruned = before - caches.len(), "dropped caches of released pools");
                    }
                    caches.insert(
                        self.id,
                        Box::new(LocalEntry {
                            owner: Arc::downgrade(self),
                            cache: LocalCache::<T>::new(self.config.thread_local_capacity),
                        }),
                    );
                }
                let slot = caches.get_mut(&self.id)?;
                slot.as_any_mut()
                    .downcast_mut::<LocalEntry<T>>()
                    .map(|entry| f(&mut entry.cache))
            })
            .ok()
            .flatten()
    }

    fn take(self: &Arc<Self>, bin: usize) -> Vec<T> {
        if let Some(data) = self.with_local(|local| local.pop(bin)).flatten() {
            return data;
        }
        if let Some(data) = self.global[bin].pop() {
            return data;
        }

        self.counters.pooled_allocations.fetch_add(1, Ordering::Relaxed);
        trace!(pool = self.id, bin = POOL_BIN_SIZES[bin], "pool miss, allocating");
        vec![T::default(); POOL_BIN_SIZES[bin]]
    }

    fn reclaim(self: &Arc<Self>, bin: usize, data: Vec<T>) {
        assert_eq!(
            data.len(),
            POOL_BIN_SIZES[bin],
            "buffer returned to bin {} with a foreign capacity",
            POOL_BIN_SIZES[bin]
        );

        let mut slot = Some(data);
        self.with_local(|local| {
            if let Some(data) = slot.take() {
                if let Err(data) = local.push(bin, data) {
                    slot = Some(data);
                }
            }
        });

        match slot {
            None => {
                self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
            }
            Some(data) => self.push_global(bin, data),
        }
    }

    fn push_global(&self, bin: usize, data: Vec<T>) {
        match self.global[bin].push(data) {
            Ok(()) => {
                self.counters.reclaimed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_dropped) => {
                self.counters.lost.fetch_add(1, Ordering::Relaxed);
                trace!(pool = self.id, bin = POOL_BIN_SIZES[bin], "both tiers full, dropping buffer");
            }
        }
    }
}

impl<T> Drop for PoolShared<T> {
    fn drop(&mut self) {
        let _ = LOCAL_CACHES.try_with(|caches| {
            if let Ok(mut caches) = caches.try_borrow_mut() {
                caches.remove(&self.id);
            }
        });
    }
}

/// Number of pool caches living on the calling thread.
#[cfg(test)]
fn local_cache_entries() -> usize {
    LOCAL_CACHES.with(|caches| caches.borrow().len())
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Explicitly constructed pool of `T` buffers. Cloning shares the pool.
pub struct BufferPool<T: PoolElement> {
    shared: Arc<PoolShared<T>>,
}

impl<T: PoolElement> Clone for BufferPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: PoolElement> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl<T: PoolElement> fmt::Debug for BufferPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("id", &self.shared.id)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: PoolElement> BufferPool<T> {
    pub fn new(config: PoolConfig) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let global_capacity = config.global_capacity.max(1);
        debug!(
            pool = id,
            element = std::any::type_name::<T>(),
            thread_local = config.thread_local_capacity,
            global = global_capacity,
            "creating buffer pool"
        );

        Self {
            shared: Arc::new(PoolShared {
                id,
                config,
                global: POOL_BIN_SIZES
                    .iter()
                    .map(|_| ArrayQueue::new(global_capacity))
                    .collect(),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Rents a buffer of the fast-path size.
    pub fn rent_default(&self) -> PooledBuffer<T> {
        self.rent(DEFAULT_BUFFER_SIZE)
    }

    /// Rents a buffer whose capacity is at least `min_size`. The buffer's
    /// length starts at `min_size`; its contents are unspecified.
    pub fn rent(&self, min_size: usize) -> PooledBuffer<T> {
        if min_size == 0 {
            return PooledBuffer {
                data: Vec::new(),
                len: 0,
                origin: Origin::Empty,
                pool: None,
            };
        }

        let Some(bin) = bin_for(min_size) else {
            self.shared
                .counters
                .unpooled_allocations
                .fetch_add(1, Ordering::Relaxed);
            trace!(pool = self.shared.id, size = min_size, "unmapped rent");
            return PooledBuffer {
                data: vec![T::default(); min_size],
                len: min_size,
                origin: Origin::Unmapped,
                pool: None,
            };
        };

        self.shared.counters.rented.fetch_add(1, Ordering::Relaxed);
        PooledBuffer {
            data: self.shared.take(bin),
            len: min_size,
            origin: Origin::Bin(bin),
            pool: Some(Arc::clone(&self.shared)),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            rented: c.rented.load(Ordering::Relaxed),
            pooled_allocations: c.pooled_allocations.load(Ordering::Relaxed),
            unpooled_allocations: c.unpooled_allocations.load(Ordering::Relaxed),
            reclaimed: c.reclaimed.load(Ordering::Relaxed),
            lost: c.lost.load(Ordering::Relaxed),
        }
    }

    /// Overwrites every cached buffer reachable from this thread with random
    /// values so stale readers of returned buffers show up in tests.
    #[cfg(any(test, feature = "debug-shred"))]
    pub fn shred(&self)
    where
        rand::distributions::Standard: rand::distributions::Distribution<T>,
    {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut fill = |data: &mut Vec<T>| data.iter_mut().for_each(|v| *v = rng.r#gen());

        for queue in &self.shared.global {
            let mut drained = Vec::with_capacity(queue.len());
            while let Some(mut data) = queue.pop() {
                fill(&mut data);
                drained.push(data);
            }
            for data in drained {
                let _ = queue.push(data);
            }
        }

        self.shared.with_local(|local| {
            local.bins.iter_mut().flatten().for_each(&mut fill);
        });
    }
}

// ── Pooled buffer ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Bin(usize),
    Unmapped,
    Empty,
}

/// A rented buffer. Dereferences to its first `len()` elements.
pub struct PooledBuffer<T: PoolElement> {
    data: Vec<T>,
    len: usize,
    origin: Origin,
    pool: Option<Arc<PoolShared<T>>>,
}

impl<T: PoolElement> PooledBuffer<T> {
    /// Intended-use length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Changes the intended-use length.
    ///
    /// # Panics
    /// If `len` exceeds the capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.data.len(),
            "length {} exceeds pooled capacity {}",
            len,
            self.data.len()
        );
        self.len = len;
    }

    /// The whole backing array, regardless of the intended-use length.
    pub fn full_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn full(&self) -> &[T] {
        &self.data
    }

    /// Capacity of the bin this buffer came from, if it came from one.
    pub fn bin(&self) -> Option<usize> {
        match self.origin {
            Origin::Bin(bin) => Some(POOL_BIN_SIZES[bin]),
            _ => None,
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self.origin, Origin::Bin(_))
    }

    /// Returns the buffer to its pool. Equivalent to dropping it.
    pub fn dispose(self) {
        drop(self);
    }
}

impl<T: PoolElement> Deref for PooledBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.data[..self.len]
    }
}

impl<T: PoolElement> DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..self.len]
    }
}

impl<T: PoolElement> fmt::Debug for PooledBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .field("origin", &self.origin)
            .finish()
    }
}

impl<T: PoolElement> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        if let (Origin::Bin(bin), Some(pool)) = (self.origin, self.pool.take()) {
            let data = std::mem::take(&mut self.data);
            pool.reclaim(bin, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(thread_local_capacity: usize, global_capacity: usize) -> BufferPool<u8> {
        BufferPool::new(PoolConfig {
            thread_local_capacity,
            global_capacity,
        })
    }

    #[test]
    fn capacity_covers_request() {
        let pool = BufferPool::<u8>::default();
        for size in [1, 64, 65_536, 300_000] {
            let buffer = pool.rent(size);
            assert!(buffer.capacity() >= size, "size {}", size);
            assert_eq!(buffer.len(), size);
        }
    }

    #[test]
    fn picks_smallest_bin() {
        assert_eq!(bin_for(1), Some(0));
        assert_eq!(bin_for(64), Some(0));
        assert_eq!(bin_for(65), Some(1));
        assert_eq!(bin_for(65_536), Some(DEFAULT_BIN_INDEX));
        assert_eq!(bin_for(262_144), Some(5));
        assert_eq!(bin_for(262_145), None);
    }

    #[test]
    fn rent_dispose_rent_reuses_allocation() {
        let pool = BufferPool::<f32>::default();

        let first = pool.rent(1_000);
        let ptr = first.full().as_ptr();
        first.dispose();

        let second = pool.rent(1_000);
        assert_eq!(second.full().as_ptr(), ptr);
        assert_eq!(second.capacity(), 1_024);

        let stats = pool.stats();
        assert_eq!(stats.pooled_allocations, 1);
        assert_eq!(stats.rented, 2);
        assert_eq!(stats.reclaimed, 1);
    }

    #[test]
    fn drop_returns_buffer() {
        let pool = BufferPool::<u8>::default();
        {
            let _scoped = pool.rent_default();
        }
        let again = pool.rent_default();
        assert_eq!(again.capacity(), DEFAULT_BUFFER_SIZE);
        assert_eq!(pool.stats().pooled_allocations, 1);
    }

    #[test]
    fn oversized_buffers_are_never_recycled() {
        let pool = BufferPool::<u8>::default();
        let big = pool.rent(300_000);
        assert!(!big.is_pooled());
        assert_eq!(big.bin(), None);
        big.dispose();

        let _again = pool.rent(300_000);
        let stats = pool.stats();
        assert_eq!(stats.unpooled_allocations, 2);
        assert_eq!(stats.reclaimed, 0);
    }

    #[test]
    fn zero_length_rent_is_empty() {
        let pool = BufferPool::<u8>::default();
        let empty = pool.rent(0);
        assert!(empty.is_empty());
        assert_eq!(empty.capacity(), 0);
        empty.dispose();
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn full_tiers_drop_buffers() {
        let pool = pool(1, 1);
        let a = pool.rent(64);
        let b = pool.rent(64);
        let c = pool.rent(64);
        a.dispose();
        b.dispose();
        c.dispose();

        let stats = pool.stats();
        assert_eq!(stats.reclaimed, 2);
        assert_eq!(stats.lost, 1);
    }

    #[test]
    fn global_tier_serves_other_threads() {
        let pool = pool(0, 4);
        let buffer = pool.rent(4_096);

        std::thread::spawn(move || buffer.dispose())
            .join()
            .unwrap();

        let _again = pool.rent(4_096);
        assert_eq!(pool.stats().pooled_allocations, 1);
    }

    #[test]
    fn concurrent_rent_and_dispose() {
        let pool = BufferPool::<u8>::default();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let mut buffer = pool.rent(1 + (i % 5_000));
                        buffer[0] = 1;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.rented, 2_000);
        assert_eq!(stats.reclaimed + stats.lost, 2_000);
    }

    #[test]
    fn pools_are_isolated() {
        let a = BufferPool::<u8>::default();
        let b = BufferPool::<u8>::default();
        a.rent(64).dispose();
        let _from_b = b.rent(64);
        assert_eq!(b.stats().pooled_allocations, 1);
    }

    #[test]
    fn shred_scrambles_cached_buffers() {
        let pool = BufferPool::<u8>::default();
        let mut buffer = pool.rent(64);
        buffer.full_mut().fill(0);
        buffer.dispose();

        pool.shred();

        let again = pool.rent(64);
        assert!(again.full().iter().any(|&b| b != 0));
    }

    #[test]
    fn dropped_pools_leave_no_thread_caches() {
        let before = local_cache_entries();
        for _ in 0..50 {
            let pool = BufferPool::<f32>::new(PoolConfig::default());
            pool.rent(64).dispose();
        }
        assert_eq!(local_cache_entries(), before);
    }

    #[test]
    fn caches_of_pools_dropped_elsewhere_are_pruned() {
        let pool = BufferPool::<u8>::default();
        pool.rent(64).dispose();
        let with_pool = local_cache_entries();

        std::thread::spawn(move || drop(pool)).join().unwrap();
        assert_eq!(local_cache_entries(), with_pool);

        let other = BufferPool::<u8>::default();
        other.rent(64).dispose();
        assert_eq!(local_cache_entries(), with_pool);
    }

    #[test]
    #[should_panic(expected = "exceeds pooled capacity")]
    fn set_len_beyond_capacity_panics() {
        let pool = BufferPool::<u8>::default();
        let mut buffer = pool.rent(10);
        buffer.set_len(65);
    }
}
