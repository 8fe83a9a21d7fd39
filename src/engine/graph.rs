//! Replay graph cache for the decode step.
//!
//! One graph is captured per decode batch size. A captured graph owns fixed
//! input buffers, a fixed copy of the execution state and fixed output
//! buffers. Replay copies the caller's inputs into the fixed buffers in
//! place, re-issues the recorded forward against them and writes the result
//! into the fixed outputs, so the returned tensors alias the same storage
//! across calls.
//!
//! # States
//!
//! ```text
//! Uncaptured ──capture()──► Capturing ──ok──► Captured ──replay()──┐
//!     ▲                         │                 ▲                │
//!     └──────── error ──────────┘                 └────────────────┘
//! ```
//!
//! # Overlap
//!
//! Two decode microbatches can be captured into one graph so that their
//! collectives overlap. The microbatches must run on different
//! communication groups.

use std::collections::{BTreeMap, HashMap};

use candle_core::{Device, Tensor};
use tracing::{debug, info};

use crate::config::GraphConfig;
use crate::engine::model::{AuxState, ForwardModel, InferState, ModelOutput};
use crate::error::{Error, Result};

/// Copy `src` into `dst`'s storage in place.
///
/// Both tensors must have the same dtype, element count and device. Every
/// tensor sharing `dst`'s storage observes the new values.
pub fn copy_inplace(dst: &Tensor, src: &Tensor) -> Result<()> {
    if dst.dtype() != src.dtype() {
        return Err(Error::GraphCapture(format!(
            "dtype mismatch: dst={:?}, src={:?}",
            dst.dtype(),
            src.dtype()
        )));
    }
    if dst.elem_count() != src.elem_count() {
        return Err(Error::GraphCapture(format!(
            "element count mismatch: dst={}, src={}",
            dst.elem_count(),
            src.elem_count()
        )));
    }
    if dst.device().location() != src.device().location() {
        return Err(Error::GraphCapture(format!(
            "device mismatch: dst={:?}, src={:?}",
            dst.device().location(),
            src.device().location()
        )));
    }
    let src = src.contiguous()?;
    dst.inplace_op2(&src, &InplaceCopyOp)?;
    Ok(())
}

struct InplaceCopyOp;

impl candle_core::InplaceOp2 for InplaceCopyOp {
    fn name(&self) -> &'static str {
        "inplace_copy"
    }

    fn cpu_fwd(
        &self,
        dst_storage: &mut candle_core::CpuStorage,
        dst_layout: &candle_core::Layout,
        src_storage: &candle_core::CpuStorage,
        src_layout: &candle_core::Layout,
    ) -> candle_core::Result<()> {
        use candle_core::CpuStorage;

        let dst_offset = dst_layout.start_offset();
        let src_offset = src_layout.start_offset();
        let n = dst_layout.shape().elem_count();

        match (dst_storage, src_storage) {
            (CpuStorage::U8(d), CpuStorage::U8(s)) => {
                d[dst_offset..dst_offset + n].copy_from_slice(&s[src_offset..src_offset + n])
            }
            (CpuStorage::U32(d), CpuStorage::U32(s)) => {
                d[dst_offset..dst_offset + n].copy_from_slice(&s[src_offset..src_offset + n])
            }
            (CpuStorage::I64(d), CpuStorage::I64(s)) => {
                d[dst_offset..dst_offset + n].copy_from_slice(&s[src_offset..src_offset + n])
            }
            (CpuStorage::BF16(d), CpuStorage::BF16(s)) => {
                d[dst_offset..dst_offset + n].copy_from_slice(&s[src_offset..src_offset + n])
            }
            (CpuStorage::F16(d), CpuStorage::F16(s)) => {
                d[dst_offset..dst_offset + n].copy_from_slice(&s[src_offset..src_offset + n])
            }
            (CpuStorage::F32(d), CpuStorage::F32(s)) => {
                d[dst_offset..dst_offset + n].copy_from_slice(&s[src_offset..src_offset + n])
            }
            (CpuStorage::F64(d), CpuStorage::F64(s)) => {
                d[dst_offset..dst_offset + n].copy_from_slice(&s[src_offset..src_offset + n])
            }
            _ => candle_core::bail!("inplace_copy: unsupported or mismatched dtypes"),
        }
        Ok(())
    }

    #[cfg(feature = "cuda")]
    fn cuda_fwd(
        &self,
        dst_storage: &mut candle_core::CudaStorage,
        dst_layout: &candle_core::Layout,
        src_storage: &candle_core::CudaStorage,
        src_layout: &candle_core::Layout,
    ) -> candle_core::Result<()> {
        use candle_core::cuda::CudaStorageSlice;

        let dst_offset = dst_layout.start_offset();
        let src_offset = src_layout.start_offset();
        let n = dst_layout.shape().elem_count();

        // Device-to-device copy on the destination's stream.
        macro_rules! dtod {
            ($d:expr, $s:expr) => {{
                let sv = $s.slice(src_offset..src_offset + n);
                let mut dv = $d.slice_mut(dst_offset..dst_offset + n);
                dst_storage
                    .device
                    .memcpy_dtod(&sv, &mut dv)
                    .map_err(candle_core::Error::wrap)?;
            }};
        }

        match (&mut dst_storage.slice, &src_storage.slice) {
            (CudaStorageSlice::U8(d), CudaStorageSlice::U8(s)) => dtod!(d, s),
            (CudaStorageSlice::U32(d), CudaStorageSlice::U32(s)) => dtod!(d, s),
            (CudaStorageSlice::I64(d), CudaStorageSlice::I64(s)) => dtod!(d, s),
            (CudaStorageSlice::BF16(d), CudaStorageSlice::BF16(s)) => dtod!(d, s),
            (CudaStorageSlice::F16(d), CudaStorageSlice::F16(s)) => dtod!(d, s),
            (CudaStorageSlice::F32(d), CudaStorageSlice::F32(s)) => dtod!(d, s),
            (CudaStorageSlice::F64(d), CudaStorageSlice::F64(s)) => dtod!(d, s),
            _ => candle_core::bail!("inplace_copy: unsupported or mismatched CUDA dtypes"),
        }
        Ok(())
    }
}

/// Capture state of one batch size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Uncaptured,
    Capturing,
    Captured,
}

/// Memory pool shared by every captured graph.
///
/// Graphs are replayed one at a time, so the pool is sized by the largest
/// graph rather than the sum.
#[derive(Debug, Default, Clone)]
pub struct GraphPool {
    reserved_bytes: usize,
    num_graphs: usize,
}

impl GraphPool {
    fn reserve(&mut self, bytes: usize) {
        self.reserved_bytes = self.reserved_bytes.max(bytes);
        self.num_graphs += 1;
    }

    fn release(&mut self) {
        self.num_graphs = self.num_graphs.saturating_sub(1);
        if self.num_graphs == 0 {
            self.reserved_bytes = 0;
        }
    }

    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    pub fn num_graphs(&self) -> usize {
        self.num_graphs
    }
}

/// Fixed buffers of one microbatch inside a graph.
#[derive(Debug)]
struct GraphLane {
    input_ids: Tensor,
    state: InferState,
    output: ModelOutput,
}

impl GraphLane {
    fn size_bytes(&self) -> usize {
        let bytes = |t: &Tensor| t.elem_count() * t.dtype().size_in_bytes();
        bytes(&self.input_ids)
            + bytes(&self.output.logits)
            + self.output.hidden_states.as_ref().map_or(0, bytes)
    }

    /// Refresh the fixed inputs from the caller's batch.
    fn load(&mut self, input_ids: &Tensor, state: &InferState) -> Result<()> {
        copy_inplace(&self.input_ids, input_ids)?;
        self.state.copy_for_graph(state)?;
        // Auxiliary tensors are recreated inside the recorded pass.
        self.state.aux = AuxState::Absent;
        Ok(())
    }

    /// Publish a pass result through the fixed output buffers.
    fn store(&self, out: &ModelOutput) -> Result<ModelOutput> {
        copy_inplace(&self.output.logits, &out.logits)?;
        if let (Some(dst), Some(src)) = (&self.output.hidden_states, &out.hidden_states) {
            copy_inplace(dst, src)?;
        }
        Ok(self.output.clone())
    }
}

#[derive(Debug)]
enum GraphEntry {
    Capturing,
    Captured(Vec<GraphLane>),
}

/// Per-batch-size cache of captured decode graphs.
#[derive(Debug)]
pub struct ReplayGraphCache {
    max_batch_size: usize,
    max_len_in_batch: usize,
    device: Device,
    graphs: HashMap<usize, GraphEntry>,
    overlap_graphs: HashMap<usize, GraphEntry>,
    pool: GraphPool,
}

impl ReplayGraphCache {
    pub fn new(config: &GraphConfig, device: Device) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            max_len_in_batch: config.max_len_in_batch,
            device,
            graphs: HashMap::new(),
            overlap_graphs: HashMap::new(),
            pool: GraphPool::default(),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_len_in_batch(&self) -> usize {
        self.max_len_in_batch
    }

    pub fn pool(&self) -> &GraphPool {
        &self.pool
    }

    /// Whether a decode batch of this shape may be served by a graph.
    ///
    /// When false the caller runs the forward eagerly.
    pub fn can_run(&self, batch_size: usize, max_len_in_batch: usize) -> bool {
        batch_size <= self.max_batch_size && max_len_in_batch <= self.max_len_in_batch
    }

    /// Whether `batch_size` still has to be captured.
    pub fn need_capture(&self, batch_size: usize) -> bool {
        self.state(batch_size) != GraphState::Captured
    }

    /// Whether the overlap graph for `batch_size` still has to be captured.
    pub fn need_capture_overlap(&self, batch_size: usize) -> bool {
        Self::entry_state(self.overlap_graphs.get(&batch_size)) != GraphState::Captured
    }

    pub fn state(&self, batch_size: usize) -> GraphState {
        Self::entry_state(self.graphs.get(&batch_size))
    }

    fn entry_state(entry: Option<&GraphEntry>) -> GraphState {
        match entry {
            None => GraphState::Uncaptured,
            Some(GraphEntry::Capturing) => GraphState::Capturing,
            Some(GraphEntry::Captured(_)) => GraphState::Captured,
        }
    }

    /// Batch sizes with a captured single-stream graph, ascending.
    pub fn captured_batch_sizes(&self) -> Vec<usize> {
        let sizes: BTreeMap<usize, ()> = self
            .graphs
            .iter()
            .filter(|(_, e)| matches!(e, GraphEntry::Captured(_)))
            .map(|(&bs, _)| (bs, ()))
            .collect();
        sizes.into_keys().collect()
    }

    /// Capture the decode graph for `state.batch_size`, then replay it once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::GraphCapture`] if the shape is outside the caps or the
    /// size is already captured; any forward error aborts the capture and
    /// leaves the size uncaptured.
    pub fn capture(
        &mut self,
        model: &mut dyn ForwardModel,
        input_ids: &Tensor,
        state: &InferState,
    ) -> Result<ModelOutput> {
        let batch_size = state.batch_size;
        self.check_capturable(batch_size, state, false)?;
        self.graphs.insert(batch_size, GraphEntry::Capturing);

        match self.record(model, &[(input_ids, state)]) {
            Ok(lanes) => {
                self.pool.reserve(lanes.iter().map(GraphLane::size_bytes).sum());
                self.graphs.insert(batch_size, GraphEntry::Captured(lanes));
                info!(batch_size, pool_bytes = self.pool.reserved_bytes(), "captured decode graph");
                self.replay(model, input_ids, state)
            }
            Err(e) => {
                self.graphs.remove(&batch_size);
                Err(e)
            }
        }
    }

    /// Replay the captured graph for `state.batch_size`.
    ///
    /// The returned tensors alias the graph's fixed output buffers and are
    /// overwritten by the next replay of the same batch size.
    pub fn replay(
        &mut self,
        model: &mut dyn ForwardModel,
        input_ids: &Tensor,
        state: &InferState,
    ) -> Result<ModelOutput> {
        let batch_size = state.batch_size;
        let Some(GraphEntry::Captured(lanes)) = self.graphs.get_mut(&batch_size) else {
            return Err(Error::GraphNotCaptured(batch_size));
        };
        let lane = &mut lanes[0];
        lane.load(input_ids, state)?;
        let out = model.forward(&lane.input_ids, &mut lane.state)?;
        debug!(batch_size, "replayed decode graph");
        lane.store(&out)
    }

    /// Capture two microbatches into one overlap graph keyed by their batch size.
    pub fn capture_overlap(
        &mut self,
        model: &mut dyn ForwardModel,
        first: (&Tensor, &InferState),
        second: (&Tensor, &InferState),
    ) -> Result<(ModelOutput, ModelOutput)> {
        if first.1.comm_group == second.1.comm_group {
            return Err(Error::SharedCommGroup(first.1.comm_group));
        }
        if first.1.batch_size != second.1.batch_size {
            return Err(Error::GraphCapture(format!(
                "overlap microbatches differ in size: {} vs {}",
                first.1.batch_size, second.1.batch_size
            )));
        }
        let batch_size = first.1.batch_size;
        self.check_capturable(batch_size, first.1, true)?;
        self.check_capturable(batch_size, second.1, true)?;
        self.overlap_graphs.insert(batch_size, GraphEntry::Capturing);

        match self.record(model, &[first, second]) {
            Ok(lanes) => {
                self.pool.reserve(lanes.iter().map(GraphLane::size_bytes).sum());
                self.overlap_graphs
                    .insert(batch_size, GraphEntry::Captured(lanes));
                info!(batch_size, "captured overlap decode graph");
                self.replay_overlap(model, first, second)
            }
            Err(e) => {
                self.overlap_graphs.remove(&batch_size);
                Err(e)
            }
        }
    }

    /// Replay the overlap graph for the microbatches' batch size.
    pub fn replay_overlap(
        &mut self,
        model: &mut dyn ForwardModel,
        first: (&Tensor, &InferState),
        second: (&Tensor, &InferState),
    ) -> Result<(ModelOutput, ModelOutput)> {
        let batch_size = first.1.batch_size;
        let Some(GraphEntry::Captured(lanes)) = self.overlap_graphs.get_mut(&batch_size) else {
            return Err(Error::GraphNotCaptured(batch_size));
        };
        let [lane0, lane1] = lanes.as_mut_slice() else {
            return Err(Error::GraphCapture("overlap graph without two lanes".into()));
        };
        lane0.load(first.0, first.1)?;
        lane1.load(second.0, second.1)?;
        let (out0, out1) = model.forward_overlap(
            (&lane0.input_ids, &mut lane0.state),
            (&lane1.input_ids, &mut lane1.state),
        )?;
        Ok((lane0.store(&out0)?, lane1.store(&out1)?))
    }

    /// Drop every captured graph.
    pub fn clear(&mut self) {
        for _ in 0..self.graphs.len() + self.overlap_graphs.len() {
            self.pool.release();
        }
        self.graphs.clear();
        self.overlap_graphs.clear();
    }

    fn check_capturable(&self, batch_size: usize, state: &InferState, overlap: bool) -> Result<()> {
        if state.is_prefill {
            return Err(Error::GraphCapture("only decode batches are captured".into()));
        }
        if !self.can_run(batch_size, state.max_len_in_batch) {
            return Err(Error::GraphCapture(format!(
                "batch size {} / max len {} exceeds caps {} / {}",
                batch_size, state.max_len_in_batch, self.max_batch_size, self.max_len_in_batch
            )));
        }
        let entry = if overlap {
            self.overlap_graphs.get(&batch_size)
        } else {
            self.graphs.get(&batch_size)
        };
        match Self::entry_state(entry) {
            GraphState::Uncaptured => Ok(()),
            other => Err(Error::GraphCapture(format!(
                "batch size {batch_size} is already {other:?}"
            ))),
        }
    }

    /// Run the eager pass and the recorded pass, producing the fixed lanes.
    fn record(
        &self,
        model: &mut dyn ForwardModel,
        batches: &[(&Tensor, &InferState)],
    ) -> Result<Vec<GraphLane>> {
        let mut fixed_states = Vec::with_capacity(batches.len());
        for (_, state) in batches {
            let mut fixed = state.detached()?;
            fixed.max_len_in_batch = self.max_len_in_batch;
            fixed.total_token_num = self.max_len_in_batch * fixed.batch_size;
            fixed_states.push(fixed);
        }

        // Eager pass on shallow copies so lazily created state does not leak
        // into the states being recorded.
        self.device.synchronize()?;
        let mut eager: Vec<InferState> = fixed_states.iter().map(InferState::shallow_copy).collect();
        match eager.as_mut_slice() {
            [s0] => {
                model.forward(batches[0].0, s0)?;
            }
            [s0, s1] => {
                model.forward_overlap((batches[0].0, s0), (batches[1].0, s1))?;
            }
            _ => return Err(Error::GraphCapture("unsupported lane count".into())),
        }
        self.device.synchronize()?;

        let inputs = batches
            .iter()
            .map(|(ids, _)| ids.copy())
            .collect::<candle_core::Result<Vec<_>>>()?;
        let outputs = match fixed_states.as_mut_slice() {
            [s0] => vec![model.forward(&inputs[0], s0)?],
            [s0, s1] => {
                let (o0, o1) = model.forward_overlap((&inputs[0], s0), (&inputs[1], s1))?;
                vec![o0, o1]
            }
            _ => return Err(Error::GraphCapture("unsupported lane count".into())),
        };
        self.device.synchronize()?;

        inputs
            .into_iter()
            .zip(fixed_states)
            .zip(outputs)
            .map(|((input_ids, state), out)| {
                Ok(GraphLane {
                    input_ids,
                    state,
                    output: ModelOutput {
                        logits: out.logits.copy()?,
                        hidden_states: out.hidden_states.as_ref().map(Tensor::copy).transpose()?,
                    },
                })
            })
            .collect()
    }
}
