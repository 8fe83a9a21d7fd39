//! Serving engine: drives one tick of continuous batching at a time.
//!
//! ## Tick flow
//!
//! ```text
//! ┌────────────┐   ┌──────────────┐   ┌──────────────────────────────┐
//! │  classify  │──►│ drop aborted │──►│ prefill batch, then decode    │
//! └────────────┘   └──────────────┘   │  build ► forward ► sample     │
//!                                     │  ► (verify) ► commit ► draft  │
//!                                     └──────────────┬───────────────┘
//!                                                    ▼
//!                                     ┌──────────────────────────────┐
//!                                     │ init new requests,           │
//!                                     │ filter finished ones         │
//!                                     └──────────────────────────────┘
//! ```
//!
//! Requests added during tick N are initialized at the end of tick N and
//! first scheduled in tick N + 1. Prefill leaves enough free slots for the
//! decode rows of the same tick, so running requests keep decoding while a
//! long prompt is prefilled chunk by chunk.

use std::sync::Arc;

use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::core::request::{FinishReason, Request, RequestId};
use crate::core::slot_allocator::{SlotAllocator, SlotIndex};
use crate::engine::model::{DecodeMicroBatch, PrefillMicroBatch};
use crate::engine::runner::ModelRunner;
use crate::engine::sampler::Sampler;
use crate::engine::warmup::{warmup, warmup_overlap, WarmupStats};
use crate::error::{Error, Result};
use crate::scheduler::batch_builder::{BatchBuilder, PreparedBatch};
use crate::scheduler::lifecycle::ServingContext;
use crate::speculative::engine::SpeculativeEngine;
use crate::speculative::verifier::{align_verification_tokens, verify};

/// Output of a finished or aborted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOutput {
    pub request_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
    pub output_token_ids: Vec<u32>,
    pub finish_reason: Option<FinishReason>,
    /// Draft tokens accepted over the request's lifetime.
    pub total_accepted_len: usize,
}

impl From<&Request> for GenerationOutput {
    fn from(req: &Request) -> Self {
        Self {
            request_id: req.request_id(),
            prompt_token_ids: req.prompt_token_ids().to_vec(),
            output_token_ids: req.output_token_ids().to_vec(),
            finish_reason: req.finish_reason(),
            total_accepted_len: req.total_accepted_len(),
        }
    }
}

/// What one phase of a tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhaseOutcome {
    /// No request needed this phase.
    #[default]
    Skipped,
    /// A batch ran.
    Ran { batch_size: usize },
    /// Slots ran out; nothing was mutated and the batch retries next tick.
    Deferred { requested: usize, available: usize },
}

impl PhaseOutcome {
    pub fn ran(&self) -> bool {
        matches!(self, Self::Ran { .. })
    }
}

/// What a tick did. Prefill runs first, then decode, in the same tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickOutcome {
    pub prefill: PhaseOutcome,
    pub decode: PhaseOutcome,
}

impl TickOutcome {
    /// No request needed compute.
    pub fn is_idle(&self) -> bool {
        self.prefill == PhaseOutcome::Skipped && self.decode == PhaseOutcome::Skipped
    }

    pub fn made_progress(&self) -> bool {
        self.prefill.ran() || self.decode.ran()
    }

    /// Shortage reported by the first deferred phase.
    pub fn deferred(&self) -> Option<(usize, usize)> {
        [self.prefill, self.decode].into_iter().find_map(|phase| match phase {
            PhaseOutcome::Deferred { requested, available } => Some((requested, available)),
            _ => None,
        })
    }
}

/// Continuous-batching engine over one main model and optional draft models.
#[derive(Debug)]
pub struct ServingEngine {
    config: EngineConfig,
    ctx: ServingContext,
    builder: BatchBuilder,
    runner: ModelRunner,
    speculative: Option<SpeculativeEngine>,
    sampler: Sampler,
    finished: Vec<GenerationOutput>,
    next_request_id: RequestId,
}

impl ServingEngine {
    /// Create an engine with a fresh slot pool of `max_total_token_num` slots.
    pub fn new(
        config: EngineConfig,
        runner: ModelRunner,
        speculative: Option<SpeculativeEngine>,
        device: Device,
    ) -> Result<Self> {
        let allocator = Arc::new(SlotAllocator::new(config.max_total_token_num));
        Self::with_allocator(config, allocator, runner, speculative, device)
    }

    /// Create an engine over an existing allocator (e.g. one with a prefix cache).
    pub fn with_allocator(
        config: EngineConfig,
        allocator: Arc<SlotAllocator>,
        runner: ModelRunner,
        speculative: Option<SpeculativeEngine>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        match (&config.speculative, &speculative) {
            (None, None) => {}
            (Some(c), Some(s)) if c.spec_step == s.spec_step() => {}
            _ => {
                return Err(Error::Config(
                    "speculative engine does not match speculative config".into(),
                ))
            }
        }
        let ctx = ServingContext::new(allocator, config.max_req_num);
        let builder = BatchBuilder::new(device).with_chunk_size(config.prefill_chunk());
        info!(
            slots = config.max_total_token_num,
            max_req_num = config.max_req_num,
            spec_step = config.speculative.as_ref().map_or(0, |s| s.spec_step),
            "serving engine ready"
        );
        Ok(Self {
            config,
            ctx,
            builder,
            runner,
            speculative,
            sampler: Sampler::greedy(),
            finished: Vec::new(),
            next_request_id: 1,
        })
    }

    /// Replace the greedy sampler used for the main model.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &ServingContext {
        &self.ctx
    }

    pub fn runner(&self) -> &ModelRunner {
        &self.runner
    }

    pub fn speculative(&self) -> Option<&SpeculativeEngine> {
        self.speculative.as_ref()
    }

    /// Whether any request is still live.
    pub fn has_unfinished_requests(&self) -> bool {
        !self.ctx.is_empty()
    }

    /// Submit a prompt; returns the assigned request id.
    pub fn add_request(
        &mut self,
        prompt_token_ids: Vec<u32>,
        max_new_tokens: usize,
    ) -> Result<RequestId> {
        if prompt_token_ids.is_empty() {
            return Err(Error::Config("empty prompt".into()));
        }
        if prompt_token_ids.len() + max_new_tokens > self.config.max_seq_len {
            return Err(Error::Config(format!(
                "prompt of {} tokens plus {} new tokens exceeds max_seq_len {}",
                prompt_token_ids.len(),
                max_new_tokens,
                self.config.max_seq_len
            )));
        }
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let request = Request::new(request_id, prompt_token_ids, max_new_tokens)
            .with_eos(self.config.eos_token_id);
        self.ctx.add_request(request)?;
        debug!(request_id, "request added");
        Ok(request_id)
    }

    /// Flag a request for removal at the next tick.
    pub fn abort(&mut self, request_id: RequestId) -> Result<()> {
        self.ctx.abort(request_id)
    }

    /// Outputs of requests removed since the last call.
    pub fn take_finished(&mut self) -> Vec<GenerationOutput> {
        std::mem::take(&mut self.finished)
    }

    /// Capture decode graphs for the main model and every draft model.
    pub fn warmup(&mut self) -> Result<WarmupStats> {
        let device = self.builder.device().clone();
        let stats = if self.config.graph.enable_decode_microbatch_overlap {
            warmup_overlap(&mut self.runner, &mut self.ctx, &device)?
        } else {
            warmup(&mut self.runner, &mut self.ctx, &device, false)?
        };
        if let Some(spec) = self.speculative.as_mut() {
            for runner in spec.draft_runners_mut() {
                warmup(runner, &mut self.ctx, &device, true)?;
            }
        }
        Ok(stats)
    }

    /// Run one tick.
    pub fn step(&mut self) -> Result<TickOutcome> {
        let classified = self.ctx.classify();
        if !classified.aborted.is_empty() {
            let removed = self.ctx.filter(&classified.aborted)?;
            info!(count = removed.len(), "removed aborted requests");
            self.finished.extend(removed.iter().map(GenerationOutput::from));
        }

        let mut outcome = TickOutcome::default();
        if !classified.prefill.is_empty() {
            // Keep enough slots for this tick's decode rows.
            let reserve = classified.decode.len() * self.config.decode_stride();
            outcome.prefill = self.run_prefill(&classified.prefill, reserve)?;
            if let PhaseOutcome::Deferred { requested, available } = outcome.prefill {
                warn!(requested, available, "prefill deferred");
            }
        }
        if !classified.decode.is_empty() {
            outcome.decode = self.run_decode(&classified.decode)?;
        }

        self.end_of_tick(&classified.uninit)?;
        debug!(?outcome, live = self.ctx.num_requests(), "tick done");
        Ok(outcome)
    }

    /// Tick until every request has finished.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfSlots`] when two consecutive ticks are deferred without
    /// running any batch, since nothing can free slots any more.
    pub fn run_to_completion(&mut self) -> Result<Vec<GenerationOutput>> {
        let mut stalled = false;
        while self.has_unfinished_requests() {
            let outcome = self.step()?;
            match outcome.deferred() {
                Some((requested, available)) if !outcome.made_progress() => {
                    if stalled {
                        return Err(Error::OutOfSlots { requested, available });
                    }
                    stalled = true;
                }
                _ => stalled = false,
            }
        }
        Ok(self.take_finished())
    }

    /// Initialize requests first seen this tick and drop finished ones.
    fn end_of_tick(&mut self, uninit: &[RequestId]) -> Result<()> {
        self.ctx.init_requests(uninit)?;
        if let Some(spec) = self.speculative.as_mut() {
            for &id in uninit {
                if let Some(req_idx) = self.ctx.get(id)?.req_idx() {
                    spec.draft_map_mut().clear_row(req_idx);
                }
            }
        }
        let finished = self.ctx.classify().finished;
        if !finished.is_empty() {
            let removed = self.ctx.filter(&finished)?;
            self.finished.extend(removed.iter().map(GenerationOutput::from));
        }
        Ok(())
    }

    /// Prefill as many pending requests as the free slots allow, in order,
    /// leaving `reserve` slots for the decode phase.
    fn run_prefill(&mut self, pending: &[RequestId], reserve: usize) -> Result<PhaseOutcome> {
        let chunk = self.builder.chunk_size();
        let available = self.ctx.allocator().num_free().saturating_sub(reserve);
        let mut budget = available;
        let mut ids = Vec::new();
        for &id in pending {
            let req = self.ctx.get(id)?;
            let need = req.prefill_end(chunk) - req.cur_kv_len();
            if need > budget {
                if ids.is_empty() {
                    return Ok(PhaseOutcome::Deferred { requested: need, available });
                }
                break;
            }
            budget -= need;
            ids.push(id);
        }

        if self.config.graph.enable_decode_microbatch_overlap
            && self.speculative.is_none()
            && ids.len() >= 2
        {
            return self.run_overlap_prefill(&ids);
        }

        let batch = match self.builder.prepare_prefill_inputs(&mut self.ctx, &ids) {
            Ok(batch) => batch,
            Err(Error::OutOfSlots { requested, available }) => {
                return Ok(PhaseOutcome::Deferred { requested, available })
            }
            Err(e) => return Err(e),
        };
        let output = self.runner.forward(&batch.input)?;
        let next = self.sampler.sample(&output.logits)?;
        self.commit_prefill(&batch, &next)?;
        if let Some(spec) = self.speculative.as_mut() {
            spec.draft_prefill(&mut self.ctx, &batch, &output, &next)?;
        }
        Ok(PhaseOutcome::Ran {
            batch_size: batch.batch_size(),
        })
    }

    /// Split the admitted prefill set in two microbatches and run them overlapped.
    fn run_overlap_prefill(&mut self, ids: &[RequestId]) -> Result<PhaseOutcome> {
        let (left, right) = ids.split_at(ids.len().div_ceil(2));
        let first = match self.builder.prepare_prefill_inputs(&mut self.ctx, left) {
            Ok(batch) => batch,
            Err(Error::OutOfSlots { requested, available }) => {
                return Ok(PhaseOutcome::Deferred { requested, available })
            }
            Err(e) => return Err(e),
        };
        let second = match self.builder.prepare_prefill_inputs(&mut self.ctx, right) {
            Ok(batch) => batch,
            Err(Error::OutOfSlots { requested, available }) => {
                self.ctx.allocator().free(&first.mem_indexes)?;
                return Ok(PhaseOutcome::Deferred { requested, available });
            }
            Err(e) => return Err(e),
        };

        let (out0, out1) = self.runner.forward_overlap_prefill(
            &PrefillMicroBatch::new(first.input.clone())?,
            &PrefillMicroBatch::new(second.input.clone())?,
        )?;
        let next0 = self.sampler.sample(&out0.logits)?;
        let next1 = self.sampler.sample(&out1.logits)?;
        self.commit_prefill(&first, &next0)?;
        self.commit_prefill(&second, &next1)?;
        Ok(PhaseOutcome::Ran {
            batch_size: ids.len(),
        })
    }

    fn commit_prefill(&mut self, batch: &PreparedBatch, next: &[u32]) -> Result<()> {
        for (i, &id) in batch.run_reqs.iter().enumerate() {
            self.ctx.get_mut(id)?.commit_prefill(batch.kv_ends[i], next[i])?;
        }
        Ok(())
    }

    fn run_decode(&mut self, ids: &[RequestId]) -> Result<PhaseOutcome> {
        if self.speculative.is_some() {
            return self.run_verify_decode(ids);
        }
        if self.config.graph.enable_decode_microbatch_overlap && ids.len() >= 2 {
            return self.run_overlap_decode(ids);
        }

        let batch = match self.builder.prepare_decode_inputs(&mut self.ctx, ids) {
            Ok(batch) => batch,
            Err(Error::OutOfSlots { requested, available }) => {
                return Ok(PhaseOutcome::Deferred { requested, available })
            }
            Err(e) => return Err(e),
        };
        let output = self.runner.forward(&batch.input)?;
        let next = self.sampler.sample(&output.logits)?;
        self.commit_single(&batch, &next)?;
        Ok(PhaseOutcome::Ran {
            batch_size: batch.batch_size(),
        })
    }

    /// Split the decode set in two microbatches and run them overlapped.
    fn run_overlap_decode(&mut self, ids: &[RequestId]) -> Result<PhaseOutcome> {
        let (left, right) = ids.split_at(ids.len().div_ceil(2));
        let first = match self.builder.prepare_decode_inputs(&mut self.ctx, left) {
            Ok(batch) => batch,
            Err(Error::OutOfSlots { requested, available }) => {
                return Ok(PhaseOutcome::Deferred { requested, available })
            }
            Err(e) => return Err(e),
        };
        let second = match self.builder.prepare_decode_inputs(&mut self.ctx, right) {
            Ok(batch) => batch,
            Err(Error::OutOfSlots { requested, available }) => {
                self.ctx.allocator().free(&first.mem_indexes)?;
                return Ok(PhaseOutcome::Deferred { requested, available });
            }
            Err(e) => return Err(e),
        };

        let (out0, out1) = self.runner.forward_overlap_decode(
            &DecodeMicroBatch::new(first.input.clone())?,
            &DecodeMicroBatch::new(second.input.clone())?,
        )?;
        let next0 = self.sampler.sample(&out0.logits)?;
        let next1 = self.sampler.sample(&out1.logits)?;
        self.commit_single(&first, &next0)?;
        self.commit_single(&second, &next1)?;
        Ok(PhaseOutcome::Ran {
            batch_size: ids.len(),
        })
    }

    fn commit_single(&mut self, batch: &PreparedBatch, next: &[u32]) -> Result<()> {
        for (i, &id) in batch.run_reqs.iter().enumerate() {
            self.ctx.get_mut(id)?.commit_decode(&next[i..i + 1])?;
        }
        Ok(())
    }

    /// Verify the previous drafts, commit the accepted prefix, draft again.
    fn run_verify_decode(&mut self, ids: &[RequestId]) -> Result<PhaseOutcome> {
        let Some(spec) = self.speculative.as_mut() else {
            return Err(Error::Config("speculative engine missing".into()));
        };
        let stride = spec.stride();
        let batch = match self
            .builder
            .prepare_verify_decode_inputs(&mut self.ctx, ids, spec.draft_map())
        {
            Ok(batch) => batch,
            Err(Error::OutOfSlots { requested, available }) => {
                return Ok(PhaseOutcome::Deferred { requested, available })
            }
            Err(e) => return Err(e),
        };

        let output = self.runner.forward(&batch.input)?;
        let next = self.sampler.sample(&output.logits)?;
        let aligned = align_verification_tokens(&next, stride);
        let outcome = verify(
            &mut self.ctx,
            &batch.run_reqs,
            &aligned,
            &batch.mem_indexes,
            spec.draft_map(),
            stride,
        )?;

        let mut need_free: Vec<SlotIndex> = outcome.need_free_mem_indexes;
        for (r, &id) in batch.run_reqs.iter().enumerate() {
            let rows = r * stride..r * stride + outcome.accepted_len[r];
            let req = self.ctx.get_mut(id)?;
            let before = req.cur_kv_len();
            req.commit_decode(&next[rows.clone()])?;
            // A finish mid-cycle leaves later accepted rows without an owner.
            let committed = req.cur_kv_len() - before;
            need_free.extend_from_slice(&batch.mem_indexes[rows.start + committed..rows.end]);
        }

        spec.draft_decode(&mut self.ctx, &batch, &output, &next)?;

        if !need_free.is_empty() {
            let mut guard = self.ctx.allocator().lock();
            guard.free(&need_free)?;
        }
        debug!(
            batch_size = ids.len(),
            accepted = outcome.accepted_len.iter().sum::<usize>(),
            released = need_free.len(),
            "verified drafts"
        );
        Ok(PhaseOutcome::Ran {
            batch_size: batch.batch_size(),
        })
    }
}
