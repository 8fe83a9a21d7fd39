//! kvserve: the request-serving core of an LLM inference engine.
//!
//! This crate implements the machinery around the model's forward pass:
//! - Slot allocation for a token-granular KV cache, with prefix-cache eviction
//! - Packed batch construction for prefill, decode and draft verification
//! - Request lifecycle bookkeeping for continuous batching
//! - Capture/replay of decode passes per batch size
//! - Speculative multi-token drafting and verification
//! - A decode-side worker receiving KV rows from prefill nodes
//! - A cache of tuned kernel configurations

pub mod config;
pub mod error;
pub mod logging;

pub mod core;
pub mod disagg;
pub mod engine;
pub mod kernel_config;
pub mod scheduler;
pub mod speculative;
pub mod testing;

pub use config::{EngineConfig, GraphConfig, SamplingConfig, TransferConfig};
pub use core::{Request, RequestId, SlotAllocator};
pub use engine::{
    ForwardModel, GenerationOutput, ModelInput, ModelOutput, ModelRunner, ReplayGraphCache,
    PhaseOutcome, ServingEngine, TickOutcome,
};
pub use error::{Error, Result};
pub use scheduler::{BatchBuilder, ServingContext};
pub use speculative::{SpeculativeConfig, SpeculativeEngine};
