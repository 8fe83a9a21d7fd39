//! Request tracking for the serving loop.
//!
//! A request carries its full token sequence (prompt followed by generated
//! tokens) and the counters the batch builder and the speculative verifier
//! read: how much of the sequence already has KV entries, and how many draft
//! tokens the current cycle has accepted.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Lifecycle status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    /// Added but not yet given a request table row.
    Uninitialized,
    /// Prompt tokens still need KV entries.
    Prefill,
    /// Prompt fully cached; generating one position per step.
    Decode,
    /// Stopped on EOS or the token limit.
    Finished,
}

impl RequestStatus {
    /// Whether the request still takes part in scheduling.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Prefill | Self::Decode)
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Prefill => "Prefill",
            Self::Decode => "Decode",
            Self::Finished => "Finished",
        }
    }
}

/// Reason for request completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Maximum token limit reached.
    MaxTokens,
    /// Aborted by the caller.
    Aborted,
}

/// Multimodal inputs attached to a request.
///
/// Only carried through to the model input; nothing here interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultimodalParams {
    /// Opaque image descriptors.
    pub images: Vec<String>,
    /// Opaque audio descriptors.
    pub audios: Vec<String>,
}

impl MultimodalParams {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.audios.is_empty()
    }
}

/// A single generation request.
///
/// # Example
///
/// ```
/// use kvserve::core::request::{Request, RequestStatus};
///
/// let mut req = Request::new(1, vec![1, 2, 3, 4], 8);
/// assert_eq!(req.status(), RequestStatus::Uninitialized);
/// assert_eq!(req.seq_len(), 4);
///
/// req.init(0).unwrap();
/// assert_eq!(req.input_token_ids(None), &[1, 2, 3, 4]);
/// assert_eq!(req.input_token_ids(Some(3)), &[1, 2, 3]);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    request_id: RequestId,
    /// Row in the request table, assigned on init.
    req_idx: Option<u32>,
    /// Prompt followed by generated tokens.
    token_ids: Vec<u32>,
    prompt_len: usize,
    /// Number of leading positions that have KV entries.
    cur_kv_len: usize,
    /// Draft tokens accepted in the current drafting cycle.
    cur_accepted_len: usize,
    /// Draft tokens accepted over the request's lifetime.
    total_accepted_len: usize,
    multimodal: MultimodalParams,
    max_new_tokens: usize,
    eos_token_id: Option<u32>,
    status: RequestStatus,
    aborted: bool,
    finish_reason: Option<FinishReason>,
}

impl Request {
    /// Create a request for `prompt_token_ids`, generating at most `max_new_tokens`.
    pub fn new(request_id: RequestId, prompt_token_ids: Vec<u32>, max_new_tokens: usize) -> Self {
        let prompt_len = prompt_token_ids.len();
        Self {
            request_id,
            req_idx: None,
            token_ids: prompt_token_ids,
            prompt_len,
            cur_kv_len: 0,
            cur_accepted_len: 0,
            total_accepted_len: 0,
            multimodal: MultimodalParams::default(),
            max_new_tokens,
            eos_token_id: None,
            status: RequestStatus::Uninitialized,
            aborted: false,
            finish_reason: None,
        }
    }

    /// Stop generation at `eos_token_id`.
    pub fn with_eos(mut self, eos_token_id: Option<u32>) -> Self {
        self.eos_token_id = eos_token_id;
        self
    }

    /// Attach multimodal inputs.
    pub fn with_multimodal(mut self, multimodal: MultimodalParams) -> Self {
        self.multimodal = multimodal;
        self
    }

    // ========== Getters ==========

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn req_idx(&self) -> Option<u32> {
        self.req_idx
    }

    /// All token IDs (prompt + generated).
    pub fn token_ids(&self) -> &[u32] {
        &self.token_ids
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.token_ids[..self.prompt_len]
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.token_ids[self.prompt_len..]
    }

    pub fn cur_kv_len(&self) -> usize {
        self.cur_kv_len
    }

    pub fn cur_accepted_len(&self) -> usize {
        self.cur_accepted_len
    }

    pub fn total_accepted_len(&self) -> usize {
        self.total_accepted_len
    }

    pub fn multimodal(&self) -> &MultimodalParams {
        &self.multimodal
    }

    pub fn max_new_tokens(&self) -> usize {
        self.max_new_tokens
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    // ========== Length queries ==========

    /// Current sequence length (prompt + generated).
    pub fn seq_len(&self) -> usize {
        self.token_ids.len()
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn output_len(&self) -> usize {
        self.token_ids.len() - self.prompt_len
    }

    /// Whether every prompt position has a KV entry.
    pub fn is_prefill_complete(&self) -> bool {
        self.cur_kv_len >= self.prompt_len
    }

    /// End of the next prefill step, capped by `chunk_size` when chunking.
    pub fn prefill_end(&self, chunk_size: Option<usize>) -> usize {
        match chunk_size {
            Some(chunk) => (self.cur_kv_len + chunk).min(self.seq_len()),
            None => self.seq_len(),
        }
    }

    /// Tokens that still need KV entries in the next prefill step.
    pub fn input_token_ids(&self, chunk_size: Option<usize>) -> &[u32] {
        &self.token_ids[self.cur_kv_len..self.prefill_end(chunk_size)]
    }

    pub fn last_token_id(&self) -> Option<u32> {
        self.token_ids.last().copied()
    }

    // ========== State transitions ==========

    /// Bind the request to a request table row.
    ///
    /// # Errors
    ///
    /// Returns error unless the request is still uninitialized.
    pub fn init(&mut self, req_idx: u32) -> Result<()> {
        if self.status != RequestStatus::Uninitialized {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Prefill",
            });
        }
        self.req_idx = Some(req_idx);
        self.status = RequestStatus::Prefill;
        Ok(())
    }

    /// Record a finished prefill step that cached positions up to `kv_end`.
    ///
    /// When the whole prompt is cached, `next_token` is appended and the
    /// request moves to decode. Intermediate chunks discard the sampled token.
    pub fn commit_prefill(&mut self, kv_end: usize, next_token: u32) -> Result<()> {
        if self.status != RequestStatus::Prefill {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Decode",
            });
        }
        self.cur_kv_len = kv_end.clamp(self.cur_kv_len, self.seq_len());
        if self.cur_kv_len == self.seq_len() {
            self.status = RequestStatus::Decode;
            self.push_token(next_token);
        }
        Ok(())
    }

    /// Record `tokens.len()` decoded positions and append the new tokens.
    ///
    /// Each committed token's predecessor now has a KV entry, so `cur_kv_len`
    /// stays one behind the sequence length.
    pub fn commit_decode(&mut self, tokens: &[u32]) -> Result<()> {
        if self.status != RequestStatus::Decode {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_str(),
                to: "Decode",
            });
        }
        for &token in tokens {
            if self.status == RequestStatus::Finished {
                break;
            }
            self.cur_kv_len += 1;
            self.push_token(token);
        }
        Ok(())
    }

    fn push_token(&mut self, token: u32) {
        self.token_ids.push(token);
        if self.eos_token_id == Some(token) {
            self.finish(FinishReason::EndOfSequence);
        } else if self.output_len() >= self.max_new_tokens {
            self.finish(FinishReason::MaxTokens);
        }
    }

    fn finish(&mut self, reason: FinishReason) {
        self.status = RequestStatus::Finished;
        self.finish_reason = Some(reason);
    }

    #[cfg(test)]
    pub(crate) fn force_cur_kv_len(&mut self, cur_kv_len: usize) {
        self.cur_kv_len = cur_kv_len;
    }

    /// Flag the request for removal at the next classification.
    pub fn abort(&mut self) {
        self.aborted = true;
        if self.finish_reason.is_none() {
            self.finish_reason = Some(FinishReason::Aborted);
        }
    }

    // ========== Speculative counters ==========

    /// Count one more accepted draft token in the current cycle.
    pub fn accept_draft(&mut self) {
        self.cur_accepted_len += 1;
    }

    /// Close the drafting cycle: fold the accepted count into the lifetime
    /// total and start the next cycle from zero.
    pub fn finish_draft_cycle(&mut self) {
        self.total_accepted_len += self.cur_accepted_len;
        self.cur_accepted_len = 0;
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for Request {}
