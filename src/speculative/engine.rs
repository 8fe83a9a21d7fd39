//! Draft model chain.
//!
//! After every main-model pass the chain runs `spec_step` draft models. Draft
//! model 0 sees the main model's sampled tokens and hidden states; each later
//! model sees the previous draft model's. Draft `k` of request `r` is stored
//! at `[r.req_idx][k]` of the [`DraftTokenMap`].
//!
//! ```text
//!             ┌────────────┐ tokens, hidden ┌─────────┐      ┌─────────┐
//! main pass ─►│ next tokens│───────────────►│ draft 0 │─────►│ draft 1 │─► ...
//!             └────────────┘                └────┬────┘      └────┬────┘
//!                                                ▼                ▼
//!                                         map[req_idx][0]  map[req_idx][1]
//! ```

use candle_core::Tensor;
use tracing::debug;

use crate::core::request::RequestId;
use crate::engine::model::{ModelInput, ModelOutput};
use crate::engine::runner::ModelRunner;
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::scheduler::batch_builder::PreparedBatch;
use crate::scheduler::lifecycle::ServingContext;
use crate::speculative::config::SpeculativeConfig;
use crate::speculative::draft_map::DraftTokenMap;

/// Drives the draft models and owns the draft token map.
#[derive(Debug)]
pub struct SpeculativeEngine {
    config: SpeculativeConfig,
    draft_runners: Vec<ModelRunner>,
    draft_map: DraftTokenMap,
    sampler: Sampler,
}

impl SpeculativeEngine {
    /// Create the engine. One runner per draft step is required.
    pub fn new(
        config: SpeculativeConfig,
        draft_runners: Vec<ModelRunner>,
        max_req_num: usize,
    ) -> Result<Self> {
        if draft_runners.len() != config.spec_step {
            return Err(Error::Config(format!(
                "spec_step {} needs {} draft models, got {}",
                config.spec_step,
                config.spec_step,
                draft_runners.len()
            )));
        }
        Ok(Self {
            draft_map: DraftTokenMap::new(max_req_num, config.spec_step),
            config,
            draft_runners,
            sampler: Sampler::greedy(),
        })
    }

    pub fn config(&self) -> &SpeculativeConfig {
        &self.config
    }

    pub fn spec_step(&self) -> usize {
        self.config.spec_step
    }

    pub fn stride(&self) -> usize {
        self.config.stride()
    }

    pub fn draft_map(&self) -> &DraftTokenMap {
        &self.draft_map
    }

    pub fn draft_map_mut(&mut self) -> &mut DraftTokenMap {
        &mut self.draft_map
    }

    pub fn draft_runners_mut(&mut self) -> &mut [ModelRunner] {
        &mut self.draft_runners
    }

    /// Draft after a prefill pass.
    ///
    /// Each draft model sees the packed prompt shifted left by one token with
    /// the previous model's sampled token appended per request.
    pub fn draft_prefill(
        &mut self,
        ctx: &mut ServingContext,
        batch: &PreparedBatch,
        main_output: &ModelOutput,
        next_token_ids: &[u32],
    ) -> Result<()> {
        let cu = batch.input.cu_seqlens.to_vec1::<u32>()?;
        let mut ids = batch.input_ids.clone();
        let mut sampled = next_token_ids.to_vec();
        let mut hidden = main_output.hidden_states.clone();

        for step in 0..self.spec_step() {
            ids = shift_packed_ids(&ids, &cu, &sampled);
            let input = self.draft_input(&batch.input, &ids, hidden.take())?;
            let output = self.draft_runners[step].forward(&input)?;
            sampled = self.sampler.sample(&output.logits)?;
            self.save_draft_tokens(ctx, &batch.run_reqs, &sampled, 1, step)?;
            hidden = output.hidden_states;
        }
        debug!(requests = batch.run_reqs.len(), "drafted after prefill");
        Ok(())
    }

    /// Draft after a verification decode pass.
    ///
    /// `next_token_ids` holds the main model's prediction for every row of
    /// the stride layout; the draft output of request `r` is read at row
    /// `r.cur_accepted_len` of its stride, the last accepted position.
    pub fn draft_decode(
        &mut self,
        ctx: &mut ServingContext,
        batch: &PreparedBatch,
        main_output: &ModelOutput,
        next_token_ids: &[u32],
    ) -> Result<()> {
        let stride = self.stride();
        let mut sampled = next_token_ids.to_vec();
        let mut hidden = main_output.hidden_states.clone();

        for step in 0..self.spec_step() {
            let input = self.draft_input(&batch.input, &sampled, hidden.take())?;
            let output = self.draft_runners[step].forward(&input)?;
            sampled = self.sampler.sample(&output.logits)?;
            self.save_draft_tokens(ctx, &batch.run_reqs, &sampled, stride, step)?;
            hidden = output.hidden_states;
        }
        debug!(requests = batch.run_reqs.len(), "drafted after decode");
        Ok(())
    }

    /// Record draft `step` for every request.
    ///
    /// `tokens` has `rows_per_req` rows per request; the one at the request's
    /// `cur_accepted_len` is stored. After the last step the cycle closes:
    /// the accepted count is added to the lifetime total and reset to 0.
    pub fn save_draft_tokens(
        &mut self,
        ctx: &mut ServingContext,
        run_reqs: &[RequestId],
        tokens: &[u32],
        rows_per_req: usize,
        step: usize,
    ) -> Result<()> {
        let last_step = step + 1 == self.spec_step();
        for (i, &id) in run_reqs.iter().enumerate() {
            let req = ctx.get_mut(id)?;
            let req_idx = req.req_idx().ok_or(Error::RequestNotFound(id))?;
            let row = i * rows_per_req + req.cur_accepted_len().min(rows_per_req - 1);
            let token = tokens.get(row).copied().ok_or_else(|| {
                Error::Config(format!("draft output has no row {row} for request {id}"))
            })?;
            self.draft_map.set(req_idx, step, token);
            if last_step {
                req.finish_draft_cycle();
            }
        }
        Ok(())
    }

    fn draft_input(
        &self,
        base: &ModelInput,
        ids: &[u32],
        hidden: Option<Tensor>,
    ) -> Result<ModelInput> {
        let input = base.with_input_ids(Tensor::new(ids, base.device())?);
        Ok(match hidden {
            Some(h) => input.with_hidden_states(h),
            None => input,
        })
    }
}

/// Shift every packed sequence left by one and append its next token.
fn shift_packed_ids(ids: &[u32], cu_seqlens: &[u32], next: &[u32]) -> Vec<u32> {
    let mut shifted = Vec::with_capacity(ids.len());
    for (i, w) in cu_seqlens.windows(2).enumerate() {
        let (start, end) = (w[0] as usize, w[1] as usize);
        if end > start {
            shifted.extend_from_slice(&ids[start + 1..end]);
            shifted.push(next[i]);
        }
    }
    shifted
}
