//! Integration tests for BatchBuilder.

use std::sync::Arc;

use candle_core::Device;
use kvserve::core::{Request, SlotAllocator};
use kvserve::scheduler::{BatchBuilder, ServingContext};
use kvserve::speculative::DraftTokenMap;
use kvserve::Error;

fn context(slots: usize, rows: usize) -> ServingContext {
    ServingContext::new(Arc::new(SlotAllocator::new(slots)), rows)
}

fn add_initialized(ctx: &mut ServingContext, id: u64, prompt: Vec<u32>) {
    ctx.add_request(Request::new(id, prompt, 16)).unwrap();
    ctx.init_requests(&[id]).unwrap();
}

#[test]
fn test_prefill_then_decode_layout() {
    let mut ctx = context(32, 4);
    add_initialized(&mut ctx, 1, vec![1, 2, 3]);
    add_initialized(&mut ctx, 2, vec![4, 5]);
    let builder = BatchBuilder::new(Device::Cpu);

    let prefill = builder.prepare_prefill_inputs(&mut ctx, &[1, 2]).unwrap();
    assert!(prefill.is_prefill());
    assert_eq!(prefill.input.total_token_num, 5);
    assert_eq!(
        prefill.input.b_ready_cache_len.as_ref().unwrap().to_vec1::<u32>().unwrap(),
        vec![0, 0]
    );
    ctx.get_mut(1).unwrap().commit_prefill(3, 10).unwrap();
    ctx.get_mut(2).unwrap().commit_prefill(2, 20).unwrap();

    let decode = builder.prepare_decode_inputs(&mut ctx, &[1, 2]).unwrap();
    assert!(!decode.is_prefill());
    assert_eq!(decode.input_ids, vec![10, 20]);
    assert_eq!(decode.mem_indexes, vec![5, 6]);
    assert_eq!(decode.input.b_seq_len.to_vec1::<u32>().unwrap(), vec![4, 3]);
    assert_eq!(decode.input.max_len_in_batch, 4);
    assert_eq!(decode.input.b_req_idx.to_vec1::<u32>().unwrap(), vec![0, 1]);
}

#[test]
fn test_chunked_prefill_resumes_from_cache() {
    let mut ctx = context(32, 4);
    add_initialized(&mut ctx, 1, vec![1, 2, 3, 4, 5]);
    let builder = BatchBuilder::new(Device::Cpu).with_chunk_size(Some(3));

    let first = builder.prepare_prefill_inputs(&mut ctx, &[1]).unwrap();
    assert_eq!(first.input_ids, vec![1, 2, 3]);
    ctx.get_mut(1).unwrap().commit_prefill(first.kv_ends[0], 99).unwrap();
    assert_eq!(ctx.get(1).unwrap().seq_len(), 5);

    let second = builder.prepare_prefill_inputs(&mut ctx, &[1]).unwrap();
    assert_eq!(second.input_ids, vec![4, 5]);
    assert_eq!(
        second.input.b_ready_cache_len.as_ref().unwrap().to_vec1::<u32>().unwrap(),
        vec![3]
    );
    ctx.get_mut(1).unwrap().commit_prefill(second.kv_ends[0], 6).unwrap();
    assert_eq!(ctx.get(1).unwrap().token_ids(), &[1, 2, 3, 4, 5, 6]);
    assert_eq!(ctx.req_table().slots(0, 5), &[0, 1, 2, 3, 4]);
}

#[test]
fn test_failed_allocation_is_side_effect_free() {
    let mut ctx = context(4, 4);
    add_initialized(&mut ctx, 1, vec![1, 2, 3]);
    add_initialized(&mut ctx, 2, vec![4, 5]);
    let builder = BatchBuilder::new(Device::Cpu);

    let err = builder.prepare_prefill_inputs(&mut ctx, &[1, 2]).unwrap_err();
    assert!(matches!(err, Error::OutOfSlots { requested: 5, available: 4 }));
    assert_eq!(ctx.allocator().num_free(), 4);
    for id in [1, 2] {
        assert_eq!(ctx.get(id).unwrap().cur_kv_len(), 0);
    }

    // A smaller batch still fits.
    assert!(builder.prepare_prefill_inputs(&mut ctx, &[1]).is_ok());
}

#[test]
fn test_verify_layout_stride_rows() {
    let mut ctx = context(32, 4);
    add_initialized(&mut ctx, 1, vec![1, 2]);
    add_initialized(&mut ctx, 2, vec![3]);
    let builder = BatchBuilder::new(Device::Cpu);
    builder.prepare_prefill_inputs(&mut ctx, &[1, 2]).unwrap();
    ctx.get_mut(1).unwrap().commit_prefill(2, 5).unwrap();
    ctx.get_mut(2).unwrap().commit_prefill(1, 9).unwrap();

    let mut map = DraftTokenMap::new(4, 1);
    map.set(0, 0, 7);
    map.set(1, 0, 4);
    let batch = builder
        .prepare_verify_decode_inputs(&mut ctx, &[1, 2], &map)
        .unwrap();
    assert_eq!(batch.input_ids, vec![5, 7, 9, 4]);
    assert_eq!(batch.input.b_seq_len.to_vec1::<u32>().unwrap(), vec![3, 4, 2, 3]);
    assert_eq!(batch.input.b_req_idx.to_vec1::<u32>().unwrap(), vec![0, 0, 1, 1]);
    assert_eq!(batch.mem_indexes, vec![3, 4, 5, 6]);
    assert_eq!(batch.input.max_len_in_batch, 4);
}
