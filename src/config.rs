//! Configuration types for kvserve.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::speculative::SpeculativeConfig;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Total number of KV cache slots (one slot per token position).
    pub max_total_token_num: usize,
    /// Number of rows in the request table.
    pub max_req_num: usize,
    /// Maximum sequence length (prompt + generated) per request.
    pub max_seq_len: usize,
    /// Split long prompts into chunks processed over several ticks.
    pub enable_chunked_prefill: bool,
    /// Number of new prompt tokens per request per tick when chunking.
    pub chunk_size: usize,
    /// Vocabulary size of the served model.
    pub vocab_size: usize,
    /// Hidden size of the served model (dummy hidden states for drafting warmup).
    pub hidden_size: usize,
    /// End-of-sequence token id.
    pub eos_token_id: Option<u32>,
    /// Replay graph settings.
    pub graph: GraphConfig,
    /// Speculative decoding settings (`None` disables drafting).
    pub speculative: Option<SpeculativeConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_total_token_num: 16384,
            max_req_num: 1000,
            max_seq_len: 5 * 1024,
            enable_chunked_prefill: false,
            chunk_size: 512,
            vocab_size: 32000,
            hidden_size: 4096,
            eos_token_id: None,
            graph: GraphConfig::default(),
            speculative: None,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.max_total_token_num == 0 {
            return Err(Error::Config("max_total_token_num must be > 0".into()));
        }
        if self.max_req_num == 0 {
            return Err(Error::Config("max_req_num must be > 0".into()));
        }
        if self.enable_chunked_prefill && self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0 when chunking".into()));
        }
        if self.vocab_size == 0 {
            return Err(Error::Config("vocab_size must be > 0".into()));
        }
        if let Some(spec) = &self.speculative {
            if spec.spec_step == 0 {
                return Err(Error::Config("spec_step must be > 0".into()));
            }
            if self.enable_chunked_prefill {
                return Err(Error::Config(
                    "chunked prefill cannot be combined with speculative decoding".into(),
                ));
            }
        }
        if self.graph.enabled && self.graph.max_batch_size == 0 {
            return Err(Error::Config("graph.max_batch_size must be > 0".into()));
        }
        Ok(())
    }

    /// Chunk size to use when building prefill batches.
    pub fn prefill_chunk(&self) -> Option<usize> {
        self.enable_chunked_prefill.then_some(self.chunk_size)
    }

    /// Number of token rows per request in a decode batch.
    pub fn decode_stride(&self) -> usize {
        self.speculative.as_ref().map_or(1, |s| s.stride())
    }
}

/// Replay graph configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Capture and replay decode graphs.
    pub enabled: bool,
    /// Largest batch size served from a captured graph.
    pub max_batch_size: usize,
    /// Largest `max_len_in_batch` served from a captured graph.
    pub max_len_in_batch: usize,
    /// Capture two decode microbatches into one graph.
    pub enable_decode_microbatch_overlap: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 16,
            max_len_in_batch: 8192,
            enable_decode_microbatch_overlap: false,
        }
    }
}

impl GraphConfig {
    /// Configuration with graphs turned off (eager execution only).
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_new_tokens: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            max_new_tokens: 256,
        }
    }
}

/// Configuration of the decode-side KV transfer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Tensor-parallel degree; one memory manager handle is expected per rank.
    pub tp: usize,
    /// Local device index; selects the memory manager that receives the KV rows.
    pub device_index: usize,
    /// How long to wait for each peer during setup.
    #[serde(with = "duration_secs")]
    pub setup_timeout: Duration,
    /// How long to wait for a KV payload once a task has been received.
    #[serde(with = "duration_secs")]
    pub recv_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            tp: 1,
            device_index: 0,
            setup_timeout: Duration::from_secs(60),
            recv_timeout: Duration::from_secs(60),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert_eq!(EngineConfig::default().decode_stride(), 1);
        assert_eq!(EngineConfig::default().prefill_chunk(), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_total_token_num": 64, "graph": {"max_batch_size": 4}}"#)
                .unwrap();
        assert_eq!(config.max_total_token_num, 64);
        assert_eq!(config.graph.max_batch_size, 4);
        assert_eq!(config.graph.max_len_in_batch, 8192);
        assert!(config.speculative.is_none());
    }

    #[test]
    fn test_spec_with_chunking_rejected() {
        let config = EngineConfig {
            enable_chunked_prefill: true,
            speculative: Some(SpeculativeConfig::new(1)),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_transfer_timeout_round_trip() {
        let config: TransferConfig =
            serde_json::from_str(r#"{"tp": 2, "setup_timeout": 1.5}"#).unwrap();
        assert_eq!(config.tp, 2);
        assert_eq!(config.setup_timeout, Duration::from_millis(1500));
        assert_eq!(config.recv_timeout, Duration::from_secs(60));
    }
}
