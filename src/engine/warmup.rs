//! Graph warmup: captures a decode graph for every batch size up front.
//!
//! For each batch size from the graph cap down to 1, a dummy one-token
//! prefill is run for that many requests, the greedy pick of every row is
//! fed back as a decode step (which captures the graph), and all KV slots
//! and request table rows are released again.

use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::engine::model::{DecodeMicroBatch, ModelInput};
use crate::engine::runner::ModelRunner;
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::scheduler::lifecycle::ServingContext;

/// Token id used for the dummy prefill.
const DUMMY_TOKEN_ID: u32 = 1;

/// Summary of a warmup run.
#[derive(Debug, Clone, Default)]
pub struct WarmupStats {
    /// Batch sizes warmed up, in the order they ran.
    pub batch_sizes: Vec<usize>,
    pub elapsed: Duration,
}

/// Capture single-stream decode graphs for batch sizes `max..=1`.
///
/// `with_hidden_states` feeds zero hidden states, as draft models expect.
/// The context must not hold any request.
pub fn warmup(
    runner: &mut ModelRunner,
    ctx: &mut ServingContext,
    device: &Device,
    with_hidden_states: bool,
) -> Result<WarmupStats> {
    let Some(max_batch_size) = runner.graph().map(|g| g.max_batch_size()) else {
        return Ok(WarmupStats::default());
    };
    ensure_idle(ctx)?;
    info!(max_batch_size, "begin decode graph capture");
    let start = Instant::now();
    let mut stats = WarmupStats::default();

    for batch_size in (1..=max_batch_size).rev() {
        let hidden = with_hidden_states.then_some(runner.hidden_size());
        let decode = dummy_decode_input(runner, ctx, device, batch_size, hidden);
        let result = decode.and_then(|input| runner.forward(&input));
        ctx.free_all();
        result?;
        stats.batch_sizes.push(batch_size);
    }

    stats.elapsed = start.elapsed();
    info!(
        max_batch_size,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "decode graphs captured"
    );
    Ok(stats)
}

/// Capture overlapped decode graphs: two microbatches of each size.
pub fn warmup_overlap(
    runner: &mut ModelRunner,
    ctx: &mut ServingContext,
    device: &Device,
) -> Result<WarmupStats> {
    let Some(max_batch_size) = runner.graph().map(|g| g.max_batch_size()) else {
        return Ok(WarmupStats::default());
    };
    ensure_idle(ctx)?;
    info!(max_batch_size, "begin overlap decode graph capture");
    let start = Instant::now();
    let mut stats = WarmupStats::default();

    for batch_size in (1..=max_batch_size).rev() {
        let result = (|| {
            let first = DecodeMicroBatch::new(dummy_decode_input(runner, ctx, device, batch_size, None)?)?;
            let second = DecodeMicroBatch::new(dummy_decode_input(runner, ctx, device, batch_size, None)?)?;
            runner.forward_overlap_decode(&first, &second)
        })();
        ctx.free_all();
        result?;
        stats.batch_sizes.push(batch_size);
    }

    stats.elapsed = start.elapsed();
    info!(
        max_batch_size,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "overlap decode graphs captured"
    );
    Ok(stats)
}

fn ensure_idle(ctx: &ServingContext) -> Result<()> {
    if ctx.is_empty() {
        Ok(())
    } else {
        Err(Error::GraphCapture(format!(
            "warmup needs an idle context, {} requests are live",
            ctx.num_requests()
        )))
    }
}

/// Run a one-token prefill for `batch_size` dummy requests and build the
/// decode step that follows it.
fn dummy_decode_input(
    runner: &mut ModelRunner,
    ctx: &mut ServingContext,
    device: &Device,
    batch_size: usize,
    hidden_size: Option<usize>,
) -> Result<ModelInput> {
    let b_req_idx = (0..batch_size)
        .map(|_| ctx.req_table_mut().alloc())
        .collect::<Result<Vec<u32>>>()?;
    let ones = vec![1u32; batch_size];

    let mem_indexes = ctx.allocator().alloc(batch_size)?;
    let mut prefill = ModelInput::from_host(
        device,
        true,
        &vec![DUMMY_TOKEN_ID; batch_size],
        &mem_indexes,
        &b_req_idx,
        &ones,
        Some(&vec![0u32; batch_size]),
        &vec![1; batch_size],
        1,
        Vec::new(),
    )?;
    if let Some(hidden) = hidden_size {
        prefill = prefill.with_hidden_states(Tensor::zeros((batch_size, hidden), DType::F32, device)?);
    }
    let output = runner.forward(&prefill)?;
    let predicted = Sampler::greedy().sample(&output.logits)?;

    let mem_indexes = ctx.allocator().alloc(batch_size)?;
    let mut decode = ModelInput::from_host(
        device,
        false,
        &predicted,
        &mem_indexes,
        &b_req_idx,
        &vec![2u32; batch_size],
        None,
        &vec![1; batch_size],
        2,
        Vec::new(),
    )?;
    if let Some(hidden) = hidden_size {
        decode = decode.with_hidden_states(Tensor::zeros((batch_size, hidden), DType::F32, device)?);
    }
    Ok(decode)
}
