//! Error types for kvserve.

use thiserror::Error;

use crate::core::request::RequestId;

/// Result type alias for kvserve operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for kvserve.
#[derive(Error, Debug)]
pub enum Error {
    /// Slot allocation failed even after asking the prefix cache to evict.
    #[error("out of KV cache slots: requested {requested}, available {available}")]
    OutOfSlots { requested: usize, available: usize },

    /// A slot was released that is not currently allocated.
    #[error("slot {0} is not allocated")]
    DoubleFree(u32),

    /// A slot index outside of the pool was passed in.
    #[error("slot {slot} out of range (capacity {capacity})")]
    SlotOutOfRange { slot: u32, capacity: usize },

    /// The request table has no free rows left.
    #[error("request table is full ({capacity} rows)")]
    OutOfRequestSlots { capacity: usize },

    /// Request not found in the serving context.
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    /// A request with this id is already being served.
    #[error("request {0} already exists")]
    DuplicateRequest(RequestId),

    /// Invalid request state transition.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: &'static str,
        to: &'static str,
    },

    /// A request entered the decode path with an inconsistent KV length.
    #[error(
        "decode invariant violated for request {request_id}: cur_kv_len {cur_kv_len} != seq_len {seq_len} - 1"
    )]
    DecodeInvariant {
        request_id: RequestId,
        cur_kv_len: usize,
        seq_len: usize,
    },

    /// Replay was requested for a batch size that has no captured graph.
    #[error("no replay graph captured for batch size {0}")]
    GraphNotCaptured(usize),

    /// Graph capture could not be completed.
    #[error("graph capture failed: {0}")]
    GraphCapture(String),

    /// Two overlapped microbatches were bound to the same communication group.
    #[error("overlap microbatches share communication group {0}")]
    SharedCommGroup(usize),

    /// KV transfer worker failure.
    #[error("kv transfer failed: {0}")]
    Transfer(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
