//! Integration tests for speculative drafting and verification.

use std::sync::Arc;

use kvserve::core::{Request, SlotAllocator};
use kvserve::engine::ModelRunner;
use kvserve::scheduler::ServingContext;
use kvserve::speculative::{
    align_verification_tokens, verify, DraftTokenMap, SpeculativeConfig, SpeculativeEngine,
};
use kvserve::testing::ArithmeticModel;

/// Requests 1 (A) and 2 (B) in decode, on request table rows 0 and 1.
fn decoding_pair(allocator: &Arc<SlotAllocator>) -> ServingContext {
    let mut ctx = ServingContext::new(Arc::clone(allocator), 4);
    for id in [1, 2] {
        ctx.add_request(Request::new(id, vec![1, 2, 3], 32)).unwrap();
    }
    ctx.init_requests(&[1, 2]).unwrap();
    for id in [1, 2] {
        ctx.get_mut(id).unwrap().commit_prefill(3, 4).unwrap();
    }
    ctx
}

#[test]
fn test_two_request_verification_scenario() {
    let allocator = Arc::new(SlotAllocator::new(32));
    let mut ctx = decoding_pair(&allocator);
    let mut map = DraftTokenMap::new(4, 1);
    map.set(0, 0, 7);
    map.set(1, 0, 4);

    let slots = allocator.alloc(4).unwrap();
    let tokens = [5, 7, 9, 3];
    let out = verify(&mut ctx, &[1, 2], &tokens, &slots, &map, 2).unwrap();

    assert_eq!(out.accepted_index, vec![true, true, true, false]);
    assert_eq!(out.accepted_len, vec![2, 1]);
    assert_eq!(out.need_free_mem_indexes, vec![slots[3]]);
    assert_eq!(ctx.get(1).unwrap().cur_accepted_len(), 1);
    assert_eq!(ctx.get(2).unwrap().cur_accepted_len(), 0);
}

#[test]
fn test_spec_step_two_acceptance() {
    let allocator = Arc::new(SlotAllocator::new(32));
    let mut ctx = decoding_pair(&allocator);
    let mut map = DraftTokenMap::new(4, 2);
    map.set(0, 0, 10);
    map.set(0, 1, 11);
    map.set(1, 0, 20);
    map.set(1, 1, 21);

    // A: first draft right, second wrong. B: both right.
    let tokens = [0, 10, 99, 0, 20, 21];
    let slots: Vec<u32> = (0..6).collect();
    let out = verify(&mut ctx, &[1, 2], &tokens, &slots, &map, 3).unwrap();
    assert_eq!(out.accepted_len, vec![2, 3]);
    assert_eq!(out.need_free_mem_indexes, vec![2]);
    assert_eq!(ctx.get(1).unwrap().cur_accepted_len(), 1);
    assert_eq!(ctx.get(2).unwrap().cur_accepted_len(), 2);
}

#[test]
fn test_alignment_feeds_verification() {
    // Main model saw [last, d0] and predicted [p0, p1]; d0 is checked against p0.
    assert_eq!(align_verification_tokens(&[7, 8, 4, 5], 2), vec![7, 7, 4, 4]);
}

#[test]
fn test_cycle_reset_after_last_draft_step() {
    let allocator = Arc::new(SlotAllocator::new(32));
    let mut ctx = decoding_pair(&allocator);
    let drafts = (0..2)
        .map(|_| ModelRunner::new(Box::new(ArithmeticModel::new(32, 4))))
        .collect();
    let mut spec = SpeculativeEngine::new(SpeculativeConfig::new(2), drafts, 4).unwrap();

    ctx.get_mut(1).unwrap().accept_draft();
    ctx.get_mut(1).unwrap().accept_draft();
    ctx.get_mut(2).unwrap().accept_draft();

    // Decode layout: three rows per request; each request reads its own row.
    let step0 = [10, 11, 12, 20, 21, 22];
    spec.save_draft_tokens(&mut ctx, &[1, 2], &step0, 3, 0).unwrap();
    assert_eq!(spec.draft_map().get(0, 0), 12);
    assert_eq!(spec.draft_map().get(1, 0), 21);
    assert_eq!(ctx.get(1).unwrap().cur_accepted_len(), 2);

    let step1 = [30, 31, 32, 40, 41, 42];
    spec.save_draft_tokens(&mut ctx, &[1, 2], &step1, 3, 1).unwrap();
    assert_eq!(spec.draft_map().row(0), &[12, 32]);
    assert_eq!(spec.draft_map().row(1), &[21, 41]);
    for (id, total) in [(1, 2), (2, 1)] {
        let req = ctx.get(id).unwrap();
        assert_eq!(req.cur_accepted_len(), 0);
        assert_eq!(req.total_accepted_len(), total);
    }
}

#[test]
fn test_engine_requires_runner_per_step() {
    let drafts = vec![ModelRunner::new(Box::new(ArithmeticModel::new(32, 4)))];
    assert!(SpeculativeEngine::new(SpeculativeConfig::new(2), drafts, 4).is_err());
    assert_eq!(SpeculativeConfig::new(2).stride(), 3);
}
