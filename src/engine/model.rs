//! Forward-pass interface and batch descriptors.
//!
//! The compute kernels live behind [`ForwardModel`]. Everything the engine
//! knows about one forward pass travels in a [`ModelInput`], which is turned
//! into a mutable [`InferState`] for the call itself.
//!
//! ## Packed layout
//!
//! Requests are packed back to back without padding. For a prefill batch of
//! two requests with 3 and 2 new tokens:
//!
//! ```text
//! input_ids:   [a0 a1 a2 b0 b1]
//! mem_indexes: [s0 s1 s2 s3 s4]
//! cu_seqlens:  [0 3 5]
//! ```

use candle_core::{Device, Tensor};

use crate::core::request::MultimodalParams;
use crate::core::slot_allocator::SlotIndex;
use crate::error::{Error, Result};
use crate::kernel_config::KernelConfig;

/// Batch descriptor for one forward pass.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// Number of sequences (rows of `b_seq_len`).
    pub batch_size: usize,
    /// Number of packed new tokens.
    pub total_token_num: usize,
    /// Prefill: largest new-token count. Decode: largest sequence length.
    pub max_len_in_batch: usize,
    /// Packed token ids, u32 `[total_token_num]`.
    pub input_ids: Tensor,
    /// KV slot of every packed token, u32 `[total_token_num]`.
    pub mem_indexes: Tensor,
    /// Request table row per sequence, u32 `[batch_size]`.
    pub b_req_idx: Tensor,
    /// Sequence length per sequence after this pass, u32 `[batch_size]`.
    pub b_seq_len: Tensor,
    /// Already-cached prefix length per sequence (prefill only).
    pub b_ready_cache_len: Option<Tensor>,
    /// Cumulative new-token counts, u32 `[batch_size + 1]`.
    pub cu_seqlens: Tensor,
    pub is_prefill: bool,
    pub multimodal_params: Vec<MultimodalParams>,
    /// Hidden states from the previous model in a drafting chain.
    pub hidden_states: Option<Tensor>,
}

impl ModelInput {
    /// Build a descriptor from host-side arrays.
    ///
    /// `new_lens[i]` is the number of packed tokens of sequence `i`.
    #[allow(clippy::too_many_arguments)]
    pub fn from_host(
        device: &Device,
        is_prefill: bool,
        input_ids: &[u32],
        mem_indexes: &[SlotIndex],
        b_req_idx: &[u32],
        b_seq_len: &[u32],
        b_ready_cache_len: Option<&[u32]>,
        new_lens: &[usize],
        max_len_in_batch: usize,
        multimodal_params: Vec<MultimodalParams>,
    ) -> Result<Self> {
        if input_ids.len() != mem_indexes.len() {
            return Err(Error::Config(format!(
                "{} input ids for {} slots",
                input_ids.len(),
                mem_indexes.len()
            )));
        }
        let mut cu_seqlens = Vec::with_capacity(new_lens.len() + 1);
        cu_seqlens.push(0u32);
        let mut acc = 0u32;
        for &len in new_lens {
            acc += len as u32;
            cu_seqlens.push(acc);
        }
        Ok(Self {
            batch_size: b_seq_len.len(),
            total_token_num: input_ids.len(),
            max_len_in_batch,
            input_ids: Tensor::new(input_ids, device)?,
            mem_indexes: Tensor::new(mem_indexes, device)?,
            b_req_idx: Tensor::new(b_req_idx, device)?,
            b_seq_len: Tensor::new(b_seq_len, device)?,
            b_ready_cache_len: b_ready_cache_len
                .map(|r| Tensor::new(r, device))
                .transpose()?,
            cu_seqlens: Tensor::new(cu_seqlens, device)?,
            is_prefill,
            multimodal_params,
            hidden_states: None,
        })
    }

    /// Same batch with different token ids, as fed to a draft model.
    pub fn with_input_ids(&self, input_ids: Tensor) -> Self {
        Self {
            input_ids,
            ..self.clone()
        }
    }

    /// Attach hidden states from the previous model.
    pub fn with_hidden_states(mut self, hidden_states: Tensor) -> Self {
        self.hidden_states = Some(hidden_states);
        self
    }

    pub fn device(&self) -> &Device {
        self.input_ids.device()
    }
}

/// Output of one forward pass.
///
/// Prefill produces one logits row per sequence (its last token); decode
/// produces one per packed token. Hidden states are per packed token.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[rows, vocab_size]`.
    pub logits: Tensor,
    /// `[total_token_num, hidden_size]`, when the model exposes them.
    pub hidden_states: Option<Tensor>,
}

/// Lazily created per-pass tensors.
#[derive(Debug, Clone)]
pub struct AuxTensors {
    /// Absolute position of every packed token.
    pub position_ids: Tensor,
}

/// Auxiliary state a model creates on first use within a pass.
#[derive(Debug, Clone, Default)]
pub enum AuxState {
    #[default]
    Absent,
    Present(AuxTensors),
}

impl AuxState {
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present(_))
    }
}

/// Mutable execution state of one forward pass.
#[derive(Debug, Clone)]
pub struct InferState {
    pub batch_size: usize,
    pub total_token_num: usize,
    pub max_len_in_batch: usize,
    pub is_prefill: bool,
    pub mem_indexes: Tensor,
    pub b_req_idx: Tensor,
    pub b_seq_len: Tensor,
    pub b_ready_cache_len: Option<Tensor>,
    pub cu_seqlens: Tensor,
    pub multimodal_params: Vec<MultimodalParams>,
    pub hidden_states: Option<Tensor>,
    /// Communication group the pass runs its collectives on.
    pub comm_group: usize,
    /// Kernel configuration selected for this batch shape.
    pub kernel_config: Option<KernelConfig>,
    pub aux: AuxState,
}

impl InferState {
    pub fn from_input(input: &ModelInput) -> Self {
        Self {
            batch_size: input.batch_size,
            total_token_num: input.total_token_num,
            max_len_in_batch: input.max_len_in_batch,
            is_prefill: input.is_prefill,
            mem_indexes: input.mem_indexes.clone(),
            b_req_idx: input.b_req_idx.clone(),
            b_seq_len: input.b_seq_len.clone(),
            b_ready_cache_len: input.b_ready_cache_len.clone(),
            cu_seqlens: input.cu_seqlens.clone(),
            multimodal_params: input.multimodal_params.clone(),
            hidden_states: input.hidden_states.clone(),
            comm_group: 0,
            kernel_config: None,
            aux: AuxState::Absent,
        }
    }

    /// Run on another communication group.
    pub fn with_comm_group(mut self, comm_group: usize) -> Self {
        self.comm_group = comm_group;
        self
    }

    /// Copy sharing every tensor with `self`, with auxiliary state dropped.
    pub fn shallow_copy(&self) -> Self {
        Self {
            aux: AuxState::Absent,
            ..self.clone()
        }
    }

    /// Deep copy with freshly owned buffers, used as a graph's fixed state.
    pub fn detached(&self) -> Result<Self> {
        Ok(Self {
            mem_indexes: self.mem_indexes.copy()?,
            b_req_idx: self.b_req_idx.copy()?,
            b_seq_len: self.b_seq_len.copy()?,
            b_ready_cache_len: self.b_ready_cache_len.as_ref().map(Tensor::copy).transpose()?,
            cu_seqlens: self.cu_seqlens.copy()?,
            hidden_states: self.hidden_states.as_ref().map(Tensor::copy).transpose()?,
            aux: AuxState::Absent,
            ..self.clone()
        })
    }

    /// Overwrite the graph-relevant buffers of `self` with `src`'s values.
    ///
    /// Buffers are written in place, so every alias of `self`'s tensors sees
    /// the new values. Scalars fixed at capture time are left alone.
    pub fn copy_for_graph(&mut self, src: &InferState) -> Result<()> {
        crate::engine::graph::copy_inplace(&self.mem_indexes, &src.mem_indexes)?;
        crate::engine::graph::copy_inplace(&self.b_req_idx, &src.b_req_idx)?;
        crate::engine::graph::copy_inplace(&self.b_seq_len, &src.b_seq_len)?;
        crate::engine::graph::copy_inplace(&self.cu_seqlens, &src.cu_seqlens)?;
        if let (Some(dst), Some(s)) = (&self.hidden_states, &src.hidden_states) {
            crate::engine::graph::copy_inplace(dst, s)?;
        }
        self.multimodal_params.clone_from(&src.multimodal_params);
        self.kernel_config.clone_from(&src.kernel_config);
        Ok(())
    }
}

/// The compute-forward interface.
pub trait ForwardModel: Send {
    /// Run one forward pass over `input_ids` described by `state`.
    fn forward(&mut self, input_ids: &Tensor, state: &mut InferState) -> Result<ModelOutput>;

    /// Run two microbatches whose collectives may overlap.
    ///
    /// The default runs them one after the other.
    fn forward_overlap(
        &mut self,
        first: (&Tensor, &mut InferState),
        second: (&Tensor, &mut InferState),
    ) -> Result<(ModelOutput, ModelOutput)> {
        let out0 = self.forward(first.0, first.1)?;
        let out1 = self.forward(second.0, second.1)?;
        Ok((out0, out1))
    }

    fn vocab_size(&self) -> usize;

    fn hidden_size(&self) -> usize;
}

/// A decode batch that runs as one half of an overlapped pair.
#[derive(Debug, Clone)]
pub struct DecodeMicroBatch {
    input: ModelInput,
}

impl DecodeMicroBatch {
    pub fn new(input: ModelInput) -> Result<Self> {
        if input.is_prefill {
            return Err(Error::Config("decode microbatch built from prefill input".into()));
        }
        Ok(Self { input })
    }

    pub fn batch_size(&self) -> usize {
        self.input.batch_size
    }

    pub fn max_len_in_batch(&self) -> usize {
        self.input.max_len_in_batch
    }

    pub fn input(&self) -> &ModelInput {
        &self.input
    }
}

/// A prefill batch that runs as one half of an overlapped pair.
#[derive(Debug, Clone)]
pub struct PrefillMicroBatch {
    input: ModelInput,
}

impl PrefillMicroBatch {
    pub fn new(input: ModelInput) -> Result<Self> {
        if !input.is_prefill {
            return Err(Error::Config("prefill microbatch built from decode input".into()));
        }
        Ok(Self { input })
    }

    pub fn batch_size(&self) -> usize {
        self.input.batch_size
    }

    pub fn input(&self) -> &ModelInput {
        &self.input
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_input() -> ModelInput {
        ModelInput::from_host(
            &Device::Cpu,
            false,
            &[7, 8],
            &[3, 4],
            &[0, 1],
            &[5, 9],
            None,
            &[1, 1],
            9,
            vec![MultimodalParams::default(); 2],
        )
        .unwrap()
    }

    #[test]
    fn test_cu_seqlens_from_lengths() {
        let input = ModelInput::from_host(
            &Device::Cpu,
            true,
            &[1, 2, 3, 4, 5],
            &[0, 1, 2, 3, 4],
            &[0, 1],
            &[3, 2],
            Some(&[0, 0]),
            &[3, 2],
            3,
            vec![MultimodalParams::default(); 2],
        )
        .unwrap();
        assert_eq!(input.batch_size, 2);
        assert_eq!(input.total_token_num, 5);
        assert_eq!(input.cu_seqlens.to_vec1::<u32>().unwrap(), vec![0, 3, 5]);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let result = ModelInput::from_host(
            &Device::Cpu,
            false,
            &[1, 2],
            &[0],
            &[0],
            &[1],
            None,
            &[1],
            1,
            Vec::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_shallow_copy_drops_aux_only() {
        let input = decode_input();
        let mut state = InferState::from_input(&input).with_comm_group(3);
        state.aux = AuxState::Present(AuxTensors {
            position_ids: Tensor::new(&[4u32, 8], &Device::Cpu).unwrap(),
        });

        let copy = state.shallow_copy();
        assert!(!copy.aux.is_present());
        assert!(state.aux.is_present());
        assert_eq!(copy.comm_group, 3);
        assert_eq!(copy.b_seq_len.to_vec1::<u32>().unwrap(), vec![5, 9]);
    }

    #[test]
    fn test_copy_for_graph_updates_aliases() {
        let mut fixed = InferState::from_input(&decode_input()).detached().unwrap();
        let alias = fixed.b_seq_len.clone();

        let next = ModelInput::from_host(
            &Device::Cpu,
            false,
            &[1, 2],
            &[10, 11],
            &[2, 3],
            &[6, 10],
            None,
            &[1, 1],
            10,
            vec![MultimodalParams::default(); 2],
        )
        .unwrap();
        fixed.copy_for_graph(&InferState::from_input(&next)).unwrap();

        assert_eq!(alias.to_vec1::<u32>().unwrap(), vec![6, 10]);
        assert_eq!(fixed.mem_indexes.to_vec1::<u32>().unwrap(), vec![10, 11]);
        // Scalars stay as captured.
        assert_eq!(fixed.max_len_in_batch, 9);
    }

    #[test]
    fn test_microbatch_mode_checks() {
        assert!(DecodeMicroBatch::new(decode_input()).is_ok());
        assert!(PrefillMicroBatch::new(decode_input()).is_err());
    }
}
