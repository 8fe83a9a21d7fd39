//! Inference engine.
//!
//! This module contains:
//! - The forward-pass interface ([`ForwardModel`]) and batch descriptors
//! - [`ReplayGraphCache`] for capture/replay of decode passes, plus warmup
//! - [`ModelRunner`] dispatching batches to graphs or eager forwards
//! - [`Sampler`] for token selection
//! - [`ServingEngine`] driving the tick loop

pub mod backend;
pub mod graph;
pub mod model;
pub mod runner;
pub mod sampler;
pub mod warmup;

pub use backend::{GenerationOutput, PhaseOutcome, ServingEngine, TickOutcome};
pub use graph::{GraphPool, GraphState, ReplayGraphCache};
pub use model::{
    AuxState, AuxTensors, DecodeMicroBatch, ForwardModel, InferState, ModelInput, ModelOutput,
    PrefillMicroBatch,
};
pub use runner::ModelRunner;
pub use sampler::Sampler;
pub use warmup::{warmup, warmup_overlap, WarmupStats};
