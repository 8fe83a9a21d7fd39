//! Batch input builder: turns scheduled requests into a packed [`ModelInput`].
//!
//! ## Layouts
//!
//! ```text
//! prefill   A: [a2 a3 a4]   B: [b0 b1]        new tokens past cur_kv_len
//! decode    A: [a5]         B: [b2]           last token only
//! verify    A: [a5 d0 d1]   B: [b2 d0 d1]     last token + drafts (stride rows)
//! ```
//!
//! Every packed token gets a freshly allocated KV slot. Allocation is
//! all-or-nothing and happens before any request table row is touched, so a
//! failed build leaves every request exactly as it was.

use candle_core::Device;
use tracing::{debug, warn};

use crate::core::request::{MultimodalParams, RequestId, RequestStatus};
use crate::core::slot_allocator::SlotIndex;
use crate::engine::model::ModelInput;
use crate::error::{Error, Result};
use crate::scheduler::lifecycle::ServingContext;
use crate::speculative::draft_map::DraftTokenMap;

/// A built batch plus the host-side data the engine needs to commit it.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
    pub input: ModelInput,
    /// Requests in batch order.
    pub run_reqs: Vec<RequestId>,
    /// Host copy of the packed input ids.
    pub input_ids: Vec<u32>,
    /// Host copy of the packed KV slots.
    pub mem_indexes: Vec<SlotIndex>,
    /// Per request, the KV length reached once this batch has run.
    pub kv_ends: Vec<usize>,
    /// Token rows per request (1 unless verifying drafts).
    pub rows_per_req: usize,
}

impl PreparedBatch {
    pub fn batch_size(&self) -> usize {
        self.run_reqs.len()
    }

    pub fn is_prefill(&self) -> bool {
        self.input.is_prefill
    }
}

/// Builds model inputs for prefill, decode and draft verification.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    device: Device,
    chunk_size: Option<usize>,
}

impl BatchBuilder {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            chunk_size: None,
        }
    }

    /// Limit each prefill step to `chunk_size` new tokens per request.
    pub fn with_chunk_size(mut self, chunk_size: Option<usize>) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn chunk_size(&self) -> Option<usize> {
        self.chunk_size
    }

    /// Pack the uncached prompt tokens of `ids`.
    ///
    /// Each request contributes `prefill_end - cur_kv_len` tokens; its
    /// recorded sequence length is `prefill_end` and its ready cache length
    /// is `cur_kv_len`.
    pub fn prepare_prefill_inputs(
        &self,
        ctx: &mut ServingContext,
        ids: &[RequestId],
    ) -> Result<PreparedBatch> {
        let mut input_ids = Vec::new();
        let mut b_req_idx = Vec::with_capacity(ids.len());
        let mut b_seq_len = Vec::with_capacity(ids.len());
        let mut b_ready_cache_len = Vec::with_capacity(ids.len());
        let mut new_lens = Vec::with_capacity(ids.len());
        let mut kv_ends = Vec::with_capacity(ids.len());
        let mut multimodal = Vec::with_capacity(ids.len());

        for &id in ids {
            let req = ctx.get(id)?;
            let req_idx = bound_row(id, req.req_idx(), req.status(), RequestStatus::Prefill)?;
            let tokens = req.input_token_ids(self.chunk_size);
            let end = req.prefill_end(self.chunk_size);
            input_ids.extend_from_slice(tokens);
            new_lens.push(tokens.len());
            b_req_idx.push(req_idx);
            b_seq_len.push(end as u32);
            b_ready_cache_len.push(req.cur_kv_len() as u32);
            kv_ends.push(end);
            multimodal.push(req.multimodal().clone());
        }
        let max_len_in_batch = new_lens.iter().copied().max().unwrap_or(0);

        let mem_indexes = self.alloc_and_assign(ctx, ids, &new_lens)?;
        let input = self.build_input(
            ctx,
            true,
            &input_ids,
            &mem_indexes,
            &b_req_idx,
            &b_seq_len,
            Some(&b_ready_cache_len),
            &new_lens,
            max_len_in_batch,
            multimodal,
        )?;
        debug!(
            batch_size = ids.len(),
            total_tokens = input_ids.len(),
            max_len_in_batch,
            "prepared prefill batch"
        );
        Ok(PreparedBatch {
            input,
            run_reqs: ids.to_vec(),
            input_ids,
            mem_indexes,
            kv_ends,
            rows_per_req: 1,
        })
    }

    /// Pack the last token of every request in `ids`.
    ///
    /// # Errors
    ///
    /// [`Error::DecodeInvariant`] if a request's KV length is not exactly one
    /// behind its sequence length.
    pub fn prepare_decode_inputs(
        &self,
        ctx: &mut ServingContext,
        ids: &[RequestId],
    ) -> Result<PreparedBatch> {
        self.prepare_strided(ctx, ids, 1, None)
    }

    /// Pack `stride` rows per request: the last token followed by the drafts
    /// recorded for it. Row `k` sees a sequence length of `seq_len + k`.
    pub fn prepare_verify_decode_inputs(
        &self,
        ctx: &mut ServingContext,
        ids: &[RequestId],
        draft_map: &DraftTokenMap,
    ) -> Result<PreparedBatch> {
        self.prepare_strided(ctx, ids, draft_map.spec_step() + 1, Some(draft_map))
    }

    fn prepare_strided(
        &self,
        ctx: &mut ServingContext,
        ids: &[RequestId],
        stride: usize,
        draft_map: Option<&DraftTokenMap>,
    ) -> Result<PreparedBatch> {
        let rows = ids.len() * stride;
        let mut input_ids = Vec::with_capacity(rows);
        let mut b_req_idx = Vec::with_capacity(rows);
        let mut b_seq_len = Vec::with_capacity(rows);
        let mut kv_ends = Vec::with_capacity(ids.len());
        let mut multimodal = Vec::with_capacity(rows);
        let mut max_len_in_batch = 0;

        for &id in ids {
            let req = ctx.get(id)?;
            let req_idx = bound_row(id, req.req_idx(), req.status(), RequestStatus::Decode)?;
            let seq_len = req.seq_len();
            if req.cur_kv_len() + 1 != seq_len {
                return Err(Error::DecodeInvariant {
                    request_id: id,
                    cur_kv_len: req.cur_kv_len(),
                    seq_len,
                });
            }
            let last = req.last_token_id().ok_or(Error::DecodeInvariant {
                request_id: id,
                cur_kv_len: req.cur_kv_len(),
                seq_len,
            })?;

            for k in 0..stride {
                let token = match (k, draft_map) {
                    (0, _) | (_, None) => last,
                    (k, Some(map)) => match map.get(req_idx, k - 1) {
                        DraftTokenMap::NONE => 0,
                        t => t,
                    },
                };
                input_ids.push(token);
                b_req_idx.push(req_idx);
                b_seq_len.push((seq_len + k) as u32);
                multimodal.push(MultimodalParams::default());
            }
            max_len_in_batch = max_len_in_batch.max(seq_len + stride - 1);
            kv_ends.push(req.cur_kv_len() + stride);
        }

        let new_lens = vec![stride; ids.len()];
        let mem_indexes = self.alloc_and_assign(ctx, ids, &new_lens)?;
        let row_lens = vec![1; rows];
        let input = self.build_input(
            ctx,
            false,
            &input_ids,
            &mem_indexes,
            &b_req_idx,
            &b_seq_len,
            None,
            &row_lens,
            max_len_in_batch,
            multimodal,
        )?;
        debug!(
            batch_size = ids.len(),
            stride,
            max_len_in_batch,
            "prepared decode batch"
        );
        Ok(PreparedBatch {
            input,
            run_reqs: ids.to_vec(),
            input_ids,
            mem_indexes,
            kv_ends,
            rows_per_req: stride,
        })
    }

    /// Allocate one slot per packed token and record them in the request
    /// table starting at each request's `cur_kv_len`.
    fn alloc_and_assign(
        &self,
        ctx: &mut ServingContext,
        ids: &[RequestId],
        new_lens: &[usize],
    ) -> Result<Vec<SlotIndex>> {
        let total: usize = new_lens.iter().sum();
        let mem_indexes = {
            let mut guard = ctx.allocator().lock();
            match guard.alloc(total) {
                Ok(slots) => slots,
                Err(e) => {
                    warn!(requested = total, batch_size = ids.len(), "batch allocation failed");
                    return Err(e);
                }
            }
        };

        let mut offset = 0;
        for (&id, &len) in ids.iter().zip(new_lens) {
            let req = ctx.get(id)?;
            let (start, req_idx) = (req.cur_kv_len(), req.req_idx());
            if let Some(req_idx) = req_idx {
                ctx.req_table_mut()
                    .assign(req_idx, start, &mem_indexes[offset..offset + len]);
            }
            offset += len;
        }
        Ok(mem_indexes)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_input(
        &self,
        ctx: &ServingContext,
        is_prefill: bool,
        input_ids: &[u32],
        mem_indexes: &[SlotIndex],
        b_req_idx: &[u32],
        b_seq_len: &[u32],
        b_ready_cache_len: Option<&[u32]>,
        new_lens: &[usize],
        max_len_in_batch: usize,
        multimodal: Vec<MultimodalParams>,
    ) -> Result<ModelInput> {
        let built = ModelInput::from_host(
            &self.device,
            is_prefill,
            input_ids,
            mem_indexes,
            b_req_idx,
            b_seq_len,
            b_ready_cache_len,
            new_lens,
            max_len_in_batch,
            multimodal,
        );
        if built.is_err() {
            ctx.allocator().free(mem_indexes)?;
        }
        built
    }
}

/// Request table row of a request that must be in `expected` status.
fn bound_row(
    id: RequestId,
    req_idx: Option<u32>,
    status: RequestStatus,
    expected: RequestStatus,
) -> Result<u32> {
    if status != expected {
        return Err(Error::InvalidStateTransition {
            from: status.as_str(),
            to: expected.as_str(),
        });
    }
    req_idx.ok_or(Error::RequestNotFound(id))
}
