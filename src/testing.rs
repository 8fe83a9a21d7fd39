//! Deterministic stand-in model for tests, warmup dry runs and the CLI.
//!
//! [`ArithmeticModel`] predicts `(token + offset) % vocab_size` for every
//! token it is asked to score. With offset 1 it "counts", which makes
//! generated sequences easy to predict; a draft model with the same offset
//! agrees with it, one with a different offset does not.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::engine::model::{AuxState, AuxTensors, ForwardModel, InferState, ModelOutput};
use crate::error::{Error, Result};

/// Counters shared between a model and its observers.
#[derive(Debug, Default)]
pub struct ModelStats {
    forward_calls: AtomicUsize,
    aux_inits: AtomicUsize,
    prefill_calls: AtomicUsize,
}

impl ModelStats {
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::Relaxed)
    }

    /// Number of times auxiliary state had to be created.
    pub fn aux_inits(&self) -> usize {
        self.aux_inits.load(Ordering::Relaxed)
    }

    pub fn prefill_calls(&self) -> usize {
        self.prefill_calls.load(Ordering::Relaxed)
    }
}

/// A model whose next token is a fixed function of the current one.
#[derive(Debug, Clone)]
pub struct ArithmeticModel {
    vocab_size: usize,
    hidden_size: usize,
    offset: u32,
    device: Device,
    stats: Arc<ModelStats>,
}

impl ArithmeticModel {
    pub fn new(vocab_size: usize, hidden_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size,
            offset: 1,
            device: Device::Cpu,
            stats: Arc::new(ModelStats::default()),
        }
    }

    /// Predict `token + offset` instead of `token + 1`.
    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Handle to the model's counters; stays valid after the model is boxed.
    pub fn stats(&self) -> Arc<ModelStats> {
        Arc::clone(&self.stats)
    }

    /// The token this model predicts after `token`.
    pub fn next_token(&self, token: u32) -> u32 {
        ((token as u64 + self.offset as u64) % self.vocab_size as u64) as u32
    }

    fn positions(state: &InferState) -> Result<Tensor> {
        let cu = state.cu_seqlens.to_vec1::<u32>()?;
        let seq_lens = state.b_seq_len.to_vec1::<u32>()?;
        let mut positions = Vec::with_capacity(cu.last().copied().unwrap_or(0) as usize);
        for (i, &seq_len) in seq_lens.iter().enumerate() {
            let new_len = cu[i + 1] - cu[i];
            positions.extend(seq_len.saturating_sub(new_len)..seq_len);
        }
        Ok(Tensor::new(positions, state.mem_indexes.device())?)
    }
}

impl ForwardModel for ArithmeticModel {
    fn forward(&mut self, input_ids: &Tensor, state: &mut InferState) -> Result<ModelOutput> {
        self.stats.forward_calls.fetch_add(1, Ordering::Relaxed);
        if state.is_prefill {
            self.stats.prefill_calls.fetch_add(1, Ordering::Relaxed);
        }
        if let AuxState::Absent = state.aux {
            state.aux = AuxState::Present(AuxTensors {
                position_ids: Self::positions(state)?,
            });
            self.stats.aux_inits.fetch_add(1, Ordering::Relaxed);
        }

        let ids = input_ids.to_vec1::<u32>()?;
        let cu = state.cu_seqlens.to_vec1::<u32>()?;
        if cu.last().copied().unwrap_or(0) as usize != ids.len() {
            return Err(Error::Config(format!(
                "{} input ids but cu_seqlens ends at {:?}",
                ids.len(),
                cu.last()
            )));
        }

        // Prefill scores the last token of each sequence; decode scores every row.
        let scored: Vec<u32> = if state.is_prefill {
            cu.windows(2)
                .filter(|w| w[1] > w[0])
                .map(|w| ids[w[1] as usize - 1])
                .collect()
        } else {
            ids.clone()
        };

        let mut logits = vec![0f32; scored.len() * self.vocab_size];
        for (row, &token) in scored.iter().enumerate() {
            logits[row * self.vocab_size + self.next_token(token) as usize] = 1.0;
        }
        let logits = Tensor::from_vec(logits, (scored.len(), self.vocab_size), &self.device)?;

        let hidden: Vec<f32> = ids
            .iter()
            .flat_map(|&t| std::iter::repeat(t as f32).take(self.hidden_size))
            .collect();
        let hidden_states = Tensor::from_vec(hidden, (ids.len(), self.hidden_size), &self.device)?;

        Ok(ModelOutput {
            logits,
            hidden_states: Some(hidden_states),
        })
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}
