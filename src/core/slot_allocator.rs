//! KV cache slot allocator.
//!
//! The SlotAllocator hands out token-granular KV cache slots from a fixed
//! pool, much like the block manager of a paged cache but with one slot per
//! token position.
//!
//! ## Features
//!
//! - **Lowest-index-first reuse**: the free pool is ordered, so allocation
//!   order is deterministic and freed slots are reused from the bottom up
//! - **Eviction on pressure**: when the pool runs short, the attached
//!   [`PrefixCache`] is asked to release inactive entries before failing
//! - **Scoped locking**: every check-evict-allocate sequence runs under one
//!   mutex guard that is released on every exit path
//!
//! ## Example
//!
//! ```
//! use kvserve::core::slot_allocator::SlotAllocator;
//!
//! let allocator = SlotAllocator::new(10);
//!
//! assert_eq!(allocator.alloc(4).unwrap(), vec![0, 1, 2, 3]);
//! assert_eq!(allocator.alloc(3).unwrap(), vec![4, 5, 6]);
//!
//! allocator.free(&[4, 5]).unwrap();
//! assert_eq!(allocator.alloc(2).unwrap(), vec![4, 5]);
//! ```

use std::collections::BTreeSet;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::core::prefix_cache::{hash_token_block, PrefixCache};
use crate::error::{Error, Result};

/// Index of one token-sized KV cache slot.
pub type SlotIndex = u32;

/// The raw free/allocated partition of the slot space.
///
/// `SlotPool` does no locking of its own; it is only reachable through a
/// [`SlotGuard`], and prefix caches receive it by `&mut` while evicting.
#[derive(Debug)]
pub struct SlotPool {
    /// Free slots, ordered so the lowest index is handed out first.
    free: BTreeSet<SlotIndex>,
    /// Allocation flag per slot.
    allocated: Vec<bool>,
}

impl SlotPool {
    fn new(capacity: usize) -> Self {
        Self {
            free: (0..capacity as SlotIndex).collect(),
            allocated: vec![false; capacity],
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.allocated.len()
    }

    /// Number of free slots.
    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Number of allocated slots.
    pub fn num_allocated(&self) -> usize {
        self.capacity() - self.free.len()
    }

    /// Whether `slot` is currently allocated.
    pub fn is_allocated(&self, slot: SlotIndex) -> bool {
        self.allocated.get(slot as usize).copied().unwrap_or(false)
    }

    /// Take `n` slots, lowest index first. Takes nothing if fewer are free.
    fn take(&mut self, n: usize) -> Option<Vec<SlotIndex>> {
        if self.free.len() < n {
            return None;
        }
        let mut slots = Vec::with_capacity(n);
        for _ in 0..n {
            let slot = self.free.pop_first()?;
            self.allocated[slot as usize] = true;
            slots.push(slot);
        }
        Some(slots)
    }

    /// Return slots to the free pool.
    ///
    /// The whole call is validated first: an out-of-range index, a slot that
    /// is not allocated, or a slot listed twice leaves the pool untouched.
    pub fn release(&mut self, slots: &[SlotIndex]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for &slot in slots {
            if slot as usize >= self.capacity() {
                return Err(Error::SlotOutOfRange {
                    slot,
                    capacity: self.capacity(),
                });
            }
            if !self.allocated[slot as usize] || !seen.insert(slot) {
                return Err(Error::DoubleFree(slot));
            }
        }
        for &slot in slots {
            self.allocated[slot as usize] = false;
            self.free.insert(slot);
        }
        Ok(())
    }

    fn reset(&mut self) {
        let capacity = self.capacity();
        self.free = (0..capacity as SlotIndex).collect();
        self.allocated.iter_mut().for_each(|a| *a = false);
    }
}

struct AllocatorState {
    pool: SlotPool,
    prefix_cache: Option<Box<dyn PrefixCache>>,
}

/// Thread-safe allocator of KV cache slots.
///
/// All mutation goes through an internal mutex, so the allocator can be
/// shared behind an `Arc` between the scheduling loop and anything else that
/// reclaims slots.
pub struct SlotAllocator {
    state: Mutex<AllocatorState>,
    capacity: usize,
}

impl std::fmt::Debug for SlotAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SlotAllocator")
            .field("capacity", &self.capacity)
            .field("num_free", &state.pool.num_free())
            .field("has_prefix_cache", &state.prefix_cache.is_some())
            .finish()
    }
}

impl SlotAllocator {
    /// Create an allocator with `capacity` slots and no prefix cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                pool: SlotPool::new(capacity),
                prefix_cache: None,
            }),
            capacity,
        }
    }

    /// Create an allocator that evicts from `prefix_cache` under pressure.
    pub fn with_prefix_cache(capacity: usize, prefix_cache: Box<dyn PrefixCache>) -> Self {
        let allocator = Self::new(capacity);
        allocator.state.lock().prefix_cache = Some(prefix_cache);
        allocator
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of free slots.
    pub fn num_free(&self) -> usize {
        self.state.lock().pool.num_free()
    }

    /// Number of allocated slots (including slots held by the prefix cache).
    pub fn num_allocated(&self) -> usize {
        self.state.lock().pool.num_allocated()
    }

    /// Check whether `n` slots could be allocated right now without eviction.
    pub fn can_allocate(&self, n: usize) -> bool {
        self.state.lock().pool.num_free() >= n
    }

    /// Acquire the allocator's critical section.
    ///
    /// Use this when several operations must happen atomically; the lock is
    /// released when the guard is dropped.
    pub fn lock(&self) -> SlotGuard<'_> {
        SlotGuard {
            state: self.state.lock(),
        }
    }

    /// Allocate `n` slots, evicting from the prefix cache if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSlots`] if the pool cannot satisfy the request
    /// even after eviction. Nothing is allocated in that case.
    pub fn alloc(&self, n: usize) -> Result<Vec<SlotIndex>> {
        self.lock().alloc(n)
    }

    /// Return slots to the free pool.
    pub fn free(&self, slots: &[SlotIndex]) -> Result<()> {
        self.lock().free(slots)
    }

    /// Reset every slot to free and drop everything the prefix cache holds.
    pub fn free_all(&self) {
        self.lock().free_all();
    }

    /// Hand the slots backing `token_ids` to the prefix cache so they can be
    /// reused or evicted later. The entry is keyed by [`hash_token_block`] of
    /// the tokens.
    pub fn retain_in_prefix_cache(&self, token_ids: &[u32], slots: Vec<SlotIndex>) -> Result<()> {
        if token_ids.len() != slots.len() {
            return Err(Error::Config(format!(
                "{} tokens for {} cached slots",
                token_ids.len(),
                slots.len()
            )));
        }
        let key = hash_token_block(token_ids, None);
        let mut guard = self.lock();
        let state = &mut *guard.state;
        match state.prefix_cache.as_mut() {
            Some(cache) => {
                cache.insert(key, slots);
                Ok(())
            }
            // Without a prefix cache the slots go straight back to the pool.
            None => state.pool.release(&slots),
        }
    }
}

/// Exclusive access to the allocator state.
pub struct SlotGuard<'a> {
    state: MutexGuard<'a, AllocatorState>,
}

impl SlotGuard<'_> {
    /// Read-only view of the pool.
    pub fn pool(&self) -> &SlotPool {
        &self.state.pool
    }

    /// Ask the prefix cache to free enough slots for `n` more tokens.
    ///
    /// Returns the number of slots released.
    pub fn evict_to_free(&mut self, n: usize) -> usize {
        let state = &mut *self.state;
        let free_before = state.pool.num_free();
        if free_before >= n {
            return 0;
        }
        let Some(cache) = state.prefix_cache.as_mut() else {
            return 0;
        };
        cache.evict_to_free(n, &mut state.pool);
        let released = state.pool.num_free() - free_before;
        debug!(need = n, released, "evicted from prefix cache");
        released
    }

    /// Allocate `n` slots under the held lock.
    pub fn alloc(&mut self, n: usize) -> Result<Vec<SlotIndex>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.state.pool.num_free() < n {
            self.evict_to_free(n);
        }
        match self.state.pool.take(n) {
            Some(slots) => Ok(slots),
            None => {
                let available = self.state.pool.num_free();
                warn!(requested = n, available, "kv slot allocation failed");
                Err(Error::OutOfSlots {
                    requested: n,
                    available,
                })
            }
        }
    }

    /// Free slots under the held lock.
    pub fn free(&mut self, slots: &[SlotIndex]) -> Result<()> {
        self.state.pool.release(slots)
    }

    /// Reset the pool under the held lock.
    pub fn free_all(&mut self) {
        let state = &mut *self.state;
        if let Some(cache) = state.prefix_cache.as_mut() {
            cache.clear();
        }
        state.pool.reset();
    }
}
