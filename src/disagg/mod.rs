//! Prefill/decode disaggregation: moving KV rows between nodes.
//!
//! A prefill node computes a prompt's KV and ships the rows to a decode node.
//! On the decode side a [`TransferWorker`] receives [`KvMoveTask`]s, pulls the
//! rows over a [`KvTransport`] and writes them into the local KV memory.

pub mod task;
pub mod transport;
pub mod worker;

pub use task::{KvMoveTask, TransferOutcome, TransferStatus};
pub use transport::{
    ChannelSender, ChannelTransport, KvPayload, KvTransport, COMM_TUNING_ENV,
};
pub use worker::{SharedKvMemory, TransferWorker, TransferWorkerHandle};
