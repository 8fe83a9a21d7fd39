//! Wire types exchanged with the KV transfer worker.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::request::RequestId;
use crate::core::slot_allocator::SlotIndex;
use crate::error::{Error, Result};

/// One request's worth of KV rows to move from a prefill node to this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvMoveTask {
    pub request_id: RequestId,
    /// Number of KV positions to move; zero means the request had nothing to
    /// transfer and only needs an acknowledgement.
    pub move_kv_len: usize,
    /// Source slots on the prefill node.
    #[serde(default)]
    pub prefill_token_indexes: Vec<SlotIndex>,
    /// Destination slots on this node.
    #[serde(default)]
    pub decode_token_indexes: Vec<SlotIndex>,
    /// Prefill node the rows come from.
    #[serde(default)]
    pub prefill_node_id: Option<String>,
}

impl KvMoveTask {
    pub fn new(request_id: RequestId, decode_token_indexes: Vec<SlotIndex>) -> Self {
        Self {
            request_id,
            move_kv_len: decode_token_indexes.len(),
            prefill_token_indexes: Vec::new(),
            decode_token_indexes,
            prefill_node_id: None,
        }
    }

    pub fn with_prefill_source(
        mut self,
        node_id: impl Into<String>,
        prefill_token_indexes: Vec<SlotIndex>,
    ) -> Self {
        self.prefill_node_id = Some(node_id.into());
        self.prefill_token_indexes = prefill_token_indexes;
        self
    }

    /// Short descriptor for decode-side log lines.
    pub fn to_decode_log_info(&self) -> String {
        format!(
            "request_id: {} move_kv_len: {} decode_slots: {} prefill_node: {}",
            self.request_id,
            self.move_kv_len,
            self.decode_token_indexes.len(),
            self.prefill_node_id.as_deref().unwrap_or("-")
        )
    }
}

/// Status messages sent by the worker to its supervisor.
///
/// Startup sends `proc_start`, `get_mem_managers_ok` and `<transport>_ok` in
/// that order; every task is then answered with `ok` or `fail`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    ProcStart,
    MemManagersReady,
    TransportReady(String),
    Ok,
    Fail,
}

impl TransferStatus {
    pub fn as_str(&self) -> String {
        match self {
            Self::ProcStart => "proc_start".to_string(),
            Self::MemManagersReady => "get_mem_managers_ok".to_string(),
            Self::TransportReady(name) => format!("{name}_ok"),
            Self::Ok => "ok".to_string(),
            Self::Fail => "fail".to_string(),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "proc_start" => Self::ProcStart,
            "get_mem_managers_ok" => Self::MemManagersReady,
            "ok" => Self::Ok,
            "fail" => Self::Fail,
            other => match other.strip_suffix("_ok") {
                Some(name) if !name.is_empty() => Self::TransportReady(name.to_string()),
                _ => return Err(Error::Transfer(format!("unknown status {other:?}"))),
            },
        })
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// How the worker loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The task channel was closed.
    Completed,
    /// The worker gave up; it will not process further tasks.
    Failed(String),
}
