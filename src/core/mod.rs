//! Core infrastructure for kvserve.
//!
//! This module contains the fundamental building blocks:
//! - SlotAllocator for token-granular KV slot allocation
//! - PrefixCache, the eviction interface the allocator drives
//! - RequestTable for per-request slot rows
//! - Request for per-request state
//! - KvMemory for per-layer KV storage

pub mod kv_cache;
pub mod prefix_cache;
pub mod req_table;
pub mod request;
pub mod slot_allocator;

pub use kv_cache::{KvMemory, KvMemoryConfig, KvRows};
pub use prefix_cache::{FifoPrefixCache, PrefixCache};
pub use req_table::RequestTable;
pub use request::{FinishReason, MultimodalParams, Request, RequestId, RequestStatus};
pub use slot_allocator::{SlotAllocator, SlotGuard, SlotIndex, SlotPool};
