//! Prefix cache interface consumed by the slot allocator.
//!
//! The allocator only needs one thing from a prefix cache: when the pool is
//! short, release slots held by cached prefixes that no running request is
//! using. The tree structure a real radix cache keeps is not modelled here;
//! [`FifoPrefixCache`] is a minimal implementation that evicts whole entries
//! in insertion order.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use tracing::warn;

use crate::core::slot_allocator::{SlotIndex, SlotPool};

/// Compute a cumulative hash for a run of tokens including its prefix chain.
///
/// The parent hash is mixed in first, so identical tokens behind different
/// prefixes hash differently.
///
/// # Example
///
/// ```
/// use kvserve::core::prefix_cache::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let first = hash_token_block(&tokens, None);
/// let chained = hash_token_block(&tokens, Some(first));
/// assert_ne!(first, chained);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(ph) = parent_hash {
        ph.hash(&mut hasher);
    }
    for &token in token_ids {
        token.hash(&mut hasher);
    }
    hasher.finish()
}

/// A cache of KV slots for previously computed prefixes.
pub trait PrefixCache: Send {
    /// Take ownership of `slots` under `key`.
    fn insert(&mut self, key: u64, slots: Vec<SlotIndex>);

    /// Release cached slots into `pool` until at least `need` are free or
    /// nothing evictable remains. Returns the number of slots released.
    fn evict_to_free(&mut self, need: usize, pool: &mut SlotPool) -> usize;

    /// Forget every entry without touching the pool.
    fn clear(&mut self);

    /// Number of slots currently held.
    fn num_cached_tokens(&self) -> usize;
}

/// Prefix cache that evicts whole entries, oldest first.
#[derive(Debug, Default)]
pub struct FifoPrefixCache {
    entries: VecDeque<(u64, Vec<SlotIndex>)>,
}

impl FifoPrefixCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an entry for `key` is cached.
    pub fn contains(&self, key: u64) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }
}

impl PrefixCache for FifoPrefixCache {
    fn insert(&mut self, key: u64, slots: Vec<SlotIndex>) {
        self.entries.push_back((key, slots));
    }

    fn evict_to_free(&mut self, need: usize, pool: &mut SlotPool) -> usize {
        let mut released = 0;
        while pool.num_free() < need {
            let Some((key, slots)) = self.entries.pop_front() else {
                break;
            };
            match pool.release(&slots) {
                Ok(()) => released += slots.len(),
                Err(e) => warn!(key, error = %e, "dropping corrupt prefix cache entry"),
            }
        }
        released
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn num_cached_tokens(&self) -> usize {
        self.entries.iter().map(|(_, s)| s.len()).sum()
    }
}
