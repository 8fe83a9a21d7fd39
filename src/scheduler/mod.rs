//! Request scheduling: lifecycle bookkeeping and batch construction.
//!
//! - [`ServingContext`] owns the live requests, the request table and a
//!   handle to the slot allocator, and classifies requests every tick.
//! - [`BatchBuilder`] packs a set of requests into a model input, allocating
//!   their KV slots.

pub mod batch_builder;
pub mod lifecycle;

pub use batch_builder::{BatchBuilder, PreparedBatch};
pub use lifecycle::{ClassifiedRequests, ServingContext};
