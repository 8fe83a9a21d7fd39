//! Model runner: dispatches a batch to a replay graph or an eager forward.

use tracing::trace;

use crate::engine::graph::ReplayGraphCache;
use crate::engine::model::{
    DecodeMicroBatch, ForwardModel, InferState, ModelInput, ModelOutput, PrefillMicroBatch,
};
use crate::error::Result;
use crate::kernel_config::ConfigSelector;

/// Communication groups used by the two halves of an overlapped pair.
const OVERLAP_COMM_GROUPS: (usize, usize) = (0, 1);

/// Owns a model together with its graph cache and kernel config selector.
pub struct ModelRunner {
    model: Box<dyn ForwardModel>,
    graph: Option<ReplayGraphCache>,
    selector: Option<Box<dyn ConfigSelector>>,
}

impl std::fmt::Debug for ModelRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRunner")
            .field("graph", &self.graph)
            .field("has_selector", &self.selector.is_some())
            .finish()
    }
}

impl ModelRunner {
    /// Runner that always executes eagerly.
    pub fn new(model: Box<dyn ForwardModel>) -> Self {
        Self {
            model,
            graph: None,
            selector: None,
        }
    }

    /// Serve decode batches within the graph caps from captured graphs.
    pub fn with_graph(mut self, graph: ReplayGraphCache) -> Self {
        self.graph = Some(graph);
        self
    }

    /// Inject a kernel configuration into every forward pass.
    pub fn with_config_selector(mut self, selector: Box<dyn ConfigSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn graph(&self) -> Option<&ReplayGraphCache> {
        self.graph.as_ref()
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    pub fn hidden_size(&self) -> usize {
        self.model.hidden_size()
    }

    fn prepare_state(&mut self, input: &ModelInput, comm_group: usize) -> Result<InferState> {
        let mut state = InferState::from_input(input).with_comm_group(comm_group);
        if let Some(selector) = self.selector.as_mut() {
            state.kernel_config = selector.select_config(&state)?;
        }
        Ok(state)
    }

    /// Run one batch.
    ///
    /// Decode batches that fit the graph caps are replayed, capturing the
    /// batch size first if needed; everything else runs eagerly. Outputs of a
    /// replay alias the graph's fixed buffers.
    pub fn forward(&mut self, input: &ModelInput) -> Result<ModelOutput> {
        let mut state = self.prepare_state(input, 0)?;
        match self.graph.as_mut() {
            Some(graph) if !input.is_prefill && graph.can_run(input.batch_size, input.max_len_in_batch) => {
                if graph.need_capture(input.batch_size) {
                    graph.capture(self.model.as_mut(), &input.input_ids, &state)
                } else {
                    trace!(batch_size = input.batch_size, "replay");
                    graph.replay(self.model.as_mut(), &input.input_ids, &state)
                }
            }
            _ => self.model.forward(&input.input_ids, &mut state),
        }
    }

    /// Run two decode microbatches on separate communication groups.
    pub fn forward_overlap_decode(
        &mut self,
        first: &DecodeMicroBatch,
        second: &DecodeMicroBatch,
    ) -> Result<(ModelOutput, ModelOutput)> {
        let mut s0 = self.prepare_state(first.input(), OVERLAP_COMM_GROUPS.0)?;
        let mut s1 = self.prepare_state(second.input(), OVERLAP_COMM_GROUPS.1)?;
        let ids0 = &first.input().input_ids;
        let ids1 = &second.input().input_ids;

        match self.graph.as_mut() {
            Some(graph)
                if first.batch_size() == second.batch_size()
                    && graph.can_run(first.batch_size(), first.max_len_in_batch())
                    && graph.can_run(second.batch_size(), second.max_len_in_batch()) =>
            {
                if graph.need_capture_overlap(first.batch_size()) {
                    graph.capture_overlap(self.model.as_mut(), (ids0, &s0), (ids1, &s1))
                } else {
                    graph.replay_overlap(self.model.as_mut(), (ids0, &s0), (ids1, &s1))
                }
            }
            _ => self.model.forward_overlap((ids0, &mut s0), (ids1, &mut s1)),
        }
    }

    /// Run two prefill microbatches eagerly on separate communication groups.
    pub fn forward_overlap_prefill(
        &mut self,
        first: &PrefillMicroBatch,
        second: &PrefillMicroBatch,
    ) -> Result<(ModelOutput, ModelOutput)> {
        let mut s0 = self.prepare_state(first.input(), OVERLAP_COMM_GROUPS.0)?;
        let mut s1 = self.prepare_state(second.input(), OVERLAP_COMM_GROUPS.1)?;
        self.model.forward_overlap(
            (&first.input().input_ids, &mut s0),
            (&second.input().input_ids, &mut s1),
        )
    }
}
