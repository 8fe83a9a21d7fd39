//! Integration tests for the request lifecycle.

use std::sync::Arc;

use kvserve::core::{FinishReason, Request, RequestStatus, SlotAllocator};
use kvserve::scheduler::ServingContext;
use kvserve::Error;

fn context() -> (Arc<SlotAllocator>, ServingContext) {
    let allocator = Arc::new(SlotAllocator::new(16));
    let ctx = ServingContext::new(Arc::clone(&allocator), 2);
    (allocator, ctx)
}

#[test]
fn test_request_state_machine() {
    let mut req = Request::new(1, vec![1, 2], 2).with_eos(Some(0));
    assert_eq!(req.status(), RequestStatus::Uninitialized);
    assert!(req.commit_prefill(2, 3).is_err());

    req.init(0).unwrap();
    assert_eq!(req.status(), RequestStatus::Prefill);
    req.commit_prefill(2, 3).unwrap();
    assert_eq!(req.status(), RequestStatus::Decode);
    assert_eq!(req.cur_kv_len(), 2);

    req.commit_decode(&[4]).unwrap();
    assert_eq!(req.status(), RequestStatus::Finished);
    assert_eq!(req.finish_reason(), Some(FinishReason::MaxTokens));
    assert_eq!(req.output_token_ids(), &[3, 4]);
}

#[test]
fn test_commit_stops_at_eos() {
    let mut req = Request::new(1, vec![1], 8).with_eos(Some(0));
    req.init(0).unwrap();
    req.commit_prefill(1, 2).unwrap();
    req.commit_decode(&[0, 5, 6]).unwrap();
    assert_eq!(req.finish_reason(), Some(FinishReason::EndOfSequence));
    assert_eq!(req.output_token_ids(), &[2, 0]);
    assert_eq!(req.cur_kv_len(), 2);
}

#[test]
fn test_init_defers_when_table_full() {
    let (_, mut ctx) = context();
    for id in 1..=3 {
        ctx.add_request(Request::new(id, vec![1], 4)).unwrap();
    }
    assert_eq!(ctx.init_requests(&[1, 2, 3]).unwrap(), 2);
    let classified = ctx.classify();
    assert_eq!(classified.uninit, vec![3]);
    assert_eq!(classified.prefill, vec![1, 2]);
}

#[test]
fn test_abort_releases_slots_and_row() {
    let (allocator, mut ctx) = context();
    ctx.add_request(Request::new(1, vec![1, 2, 3], 4)).unwrap();
    ctx.init_requests(&[1]).unwrap();
    let slots = allocator.alloc(3).unwrap();
    ctx.req_table_mut().assign(0, 0, &slots);
    ctx.get_mut(1).unwrap().commit_prefill(3, 4).unwrap();
    assert_eq!(allocator.num_free(), 13);

    ctx.abort(1).unwrap();
    let aborted = ctx.classify().aborted;
    assert_eq!(aborted, vec![1]);
    let removed = ctx.filter(&aborted).unwrap();
    assert_eq!(removed[0].finish_reason(), Some(FinishReason::Aborted));
    assert_eq!(allocator.num_free(), 16);
    assert_eq!(ctx.req_table().num_free(), 2);
    assert!(ctx.is_empty());
}

#[test]
fn test_duplicate_and_missing_requests() {
    let (_, mut ctx) = context();
    ctx.add_request(Request::new(1, vec![1], 4)).unwrap();
    assert!(matches!(
        ctx.add_request(Request::new(1, vec![2], 4)),
        Err(Error::DuplicateRequest(1))
    ));
    assert!(matches!(ctx.abort(9), Err(Error::RequestNotFound(9))));
}

#[test]
fn test_draft_cycle_counters() {
    let mut req = Request::new(1, vec![1], 8);
    req.accept_draft();
    req.accept_draft();
    assert_eq!(req.cur_accepted_len(), 2);
    req.finish_draft_cycle();
    assert_eq!(req.cur_accepted_len(), 0);
    assert_eq!(req.total_accepted_len(), 2);
}
