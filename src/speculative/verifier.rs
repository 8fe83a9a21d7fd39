//! Verification of drafted tokens.
//!
//! A verification batch has `stride` rows per request:
//!
//! ```text
//! request:   A    A     A     B    B     B
//! offset:    0    1     2     0    1     2
//! input:     last d[0]  d[1]  last d[0]  d[1]
//! ```
//!
//! Offset 0 is always accepted. Offset `j + 1` is accepted iff the verified
//! token at that row equals draft `j` and every earlier draft of the cycle
//! was accepted, so acceptance is a contiguous prefix of each request's rows.

use crate::core::request::RequestId;
use crate::core::slot_allocator::SlotIndex;
use crate::error::{Error, Result};
use crate::scheduler::lifecycle::ServingContext;
use crate::speculative::draft_map::DraftTokenMap;

/// Result of verifying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// Per batch row, whether the row was accepted.
    pub accepted_index: Vec<bool>,
    /// Per request (batch order), number of accepted rows including offset 0.
    pub accepted_len: Vec<usize>,
    /// KV slots of rejected rows, to be returned to the allocator.
    pub need_free_mem_indexes: Vec<SlotIndex>,
}

/// Map the main model's per-row predictions to the token each row is checked against.
///
/// The draft at offset `j + 1` is correct iff it equals what the main model
/// predicted after the row before it, so those rows take the previous row's
/// prediction. Offset 0 keeps its own.
pub fn align_verification_tokens(next_token_ids: &[u32], stride: usize) -> Vec<u32> {
    (0..next_token_ids.len())
        .map(|i| {
            if i % stride == 0 {
                next_token_ids[i]
            } else {
                next_token_ids[i - 1]
            }
        })
        .collect()
}

/// Verify a stride-laid-out batch against the draft map.
///
/// Increments `cur_accepted_len` of each request for every accepted draft.
///
/// # Arguments
///
/// * `run_reqs` - Requests in batch order, one per `stride` rows
/// * `tokens` - Verified token per row
/// * `mem_indexes` - KV slot per row
pub fn verify(
    ctx: &mut ServingContext,
    run_reqs: &[RequestId],
    tokens: &[u32],
    mem_indexes: &[SlotIndex],
    draft_map: &DraftTokenMap,
    stride: usize,
) -> Result<VerifyOutcome> {
    let rows = run_reqs.len() * stride;
    if tokens.len() != rows || mem_indexes.len() != rows {
        return Err(Error::Config(format!(
            "verification batch of {} requests x {} expects {} rows, got {} tokens and {} slots",
            run_reqs.len(),
            stride,
            rows,
            tokens.len(),
            mem_indexes.len()
        )));
    }

    let mut outcome = VerifyOutcome {
        accepted_index: vec![false; rows],
        accepted_len: vec![0; run_reqs.len()],
        need_free_mem_indexes: Vec::new(),
    };
    for i in 0..rows {
        let r = i / stride;
        let offset = i % stride;
        let accepted = if offset == 0 {
            true
        } else {
            let req = ctx.get_mut(run_reqs[r])?;
            let req_idx = req.req_idx().ok_or(Error::InvalidStateTransition {
                from: req.status().as_str(),
                to: "Decode",
            })?;
            let j = offset - 1;
            if tokens[i] == draft_map.get(req_idx, j) && req.cur_accepted_len() == j {
                req.accept_draft();
                true
            } else {
                false
            }
        };
        outcome.accepted_index[i] = accepted;
        if accepted {
            outcome.accepted_len[r] += 1;
        } else {
            outcome.need_free_mem_indexes.push(mem_indexes[i]);
        }
    }
    Ok(outcome)
}
