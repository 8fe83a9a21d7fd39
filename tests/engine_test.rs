//! Integration tests for the serving engine.

use candle_core::Device;

use kvserve::config::{EngineConfig, GraphConfig};
use kvserve::core::FinishReason;
use kvserve::engine::{
    GenerationOutput, ModelRunner, PhaseOutcome, ReplayGraphCache, ServingEngine, TickOutcome,
};
use kvserve::speculative::{SpeculativeConfig, SpeculativeEngine};
use kvserve::testing::ArithmeticModel;
use kvserve::Error;

const VOCAB: usize = 64;
const HIDDEN: usize = 4;

fn config() -> EngineConfig {
    EngineConfig {
        max_total_token_num: 128,
        max_req_num: 8,
        max_seq_len: 64,
        vocab_size: VOCAB,
        hidden_size: HIDDEN,
        graph: GraphConfig::disabled(),
        ..Default::default()
    }
}

fn engine(config: EngineConfig) -> ServingEngine {
    let runner = ModelRunner::new(Box::new(ArithmeticModel::new(VOCAB, HIDDEN)));
    ServingEngine::new(config, runner, None, Device::Cpu).unwrap()
}

fn spec_engine(spec_step: usize, draft_offset: u32) -> ServingEngine {
    let mut cfg = config();
    cfg.speculative = Some(SpeculativeConfig::new(spec_step));
    let drafts = (0..spec_step)
        .map(|_| {
            let model = ArithmeticModel::new(VOCAB, HIDDEN).with_offset(draft_offset);
            ModelRunner::new(Box::new(model))
        })
        .collect();
    let spec = SpeculativeEngine::new(SpeculativeConfig::new(spec_step), drafts, cfg.max_req_num)
        .unwrap();
    let runner = ModelRunner::new(Box::new(ArithmeticModel::new(VOCAB, HIDDEN)));
    ServingEngine::new(cfg, runner, Some(spec), Device::Cpu).unwrap()
}

fn sorted(mut outputs: Vec<GenerationOutput>) -> Vec<GenerationOutput> {
    outputs.sort_by_key(|o| o.request_id);
    outputs
}

fn assert_all_slots_free(engine: &ServingEngine) {
    let allocator = engine.context().allocator();
    assert_eq!(allocator.num_free(), allocator.capacity());
}

#[test]
fn test_counting_generation() {
    let mut engine = engine(config());
    engine.add_request(vec![1, 2, 3], 5).unwrap();
    engine.add_request(vec![10, 11], 3).unwrap();

    let outputs = sorted(engine.run_to_completion().unwrap());
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].output_token_ids, vec![4, 5, 6, 7, 8]);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::MaxTokens));
    assert_eq!(outputs[1].output_token_ids, vec![12, 13, 14]);
    assert_eq!(outputs[1].total_accepted_len, 0);
    assert!(!engine.has_unfinished_requests());
    assert_all_slots_free(&engine);
}

#[test]
fn test_tick_sequence() {
    let mut engine = engine(config());
    engine.add_request(vec![1, 2, 3], 2).unwrap();

    // Added during this tick, initialized at its end.
    assert!(engine.step().unwrap().is_idle());
    assert_eq!(
        engine.step().unwrap(),
        TickOutcome {
            prefill: PhaseOutcome::Ran { batch_size: 1 },
            decode: PhaseOutcome::Skipped,
        }
    );
    assert_eq!(
        engine.step().unwrap(),
        TickOutcome {
            prefill: PhaseOutcome::Skipped,
            decode: PhaseOutcome::Ran { batch_size: 1 },
        }
    );
    assert!(!engine.has_unfinished_requests());
    assert_eq!(engine.take_finished()[0].output_token_ids, vec![4, 5]);
}

#[test]
fn test_eos_stops_generation() {
    let mut cfg = config();
    cfg.eos_token_id = Some(6);
    let mut engine = engine(cfg);
    engine.add_request(vec![1, 2, 3], 20).unwrap();

    let outputs = engine.run_to_completion().unwrap();
    assert_eq!(outputs[0].output_token_ids, vec![4, 5, 6]);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::EndOfSequence));
    assert_all_slots_free(&engine);
}

#[test]
fn test_abort_releases_request() {
    let mut engine = engine(config());
    let a = engine.add_request(vec![1, 2, 3], 10).unwrap();
    let b = engine.add_request(vec![20, 21], 2).unwrap();
    engine.step().unwrap();
    engine.step().unwrap();

    engine.abort(a).unwrap();
    let outputs = sorted(engine.run_to_completion().unwrap());
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].request_id, a);
    assert_eq!(outputs[0].finish_reason, Some(FinishReason::Aborted));
    assert_eq!(outputs[1].request_id, b);
    assert_eq!(outputs[1].output_token_ids, vec![22, 23]);
    assert_all_slots_free(&engine);
}

#[test]
fn test_rejects_invalid_prompts() {
    let mut engine = engine(config());
    assert!(engine.add_request(Vec::new(), 4).is_err());
    assert!(engine.add_request(vec![1; 60], 10).is_err());
}

#[test]
fn test_chunked_prefill_matches_unchunked() {
    let prompt: Vec<u32> = (1..=10).collect();
    let mut cfg = config();
    cfg.enable_chunked_prefill = true;
    cfg.chunk_size = 4;
    let mut chunked = engine(cfg);
    chunked.add_request(prompt.clone(), 3).unwrap();

    chunked.step().unwrap();
    let mut prefill_ticks = 0;
    while chunked.has_unfinished_requests() {
        if chunked.step().unwrap().prefill.ran() {
            prefill_ticks += 1;
        }
    }
    assert_eq!(prefill_ticks, 3);

    let mut plain = engine(config());
    plain.add_request(prompt, 3).unwrap();
    let expected = plain.run_to_completion().unwrap();
    let got = chunked.take_finished();
    assert_eq!(got[0].output_token_ids, expected[0].output_token_ids);
    assert_eq!(got[0].output_token_ids, vec![11, 12, 13]);
}

#[test]
fn test_decode_continues_during_chunked_prefill() {
    let mut cfg = config();
    cfg.enable_chunked_prefill = true;
    cfg.chunk_size = 2;
    let mut engine = engine(cfg);
    let a = engine.add_request(vec![1, 2], 30).unwrap();
    engine.step().unwrap();
    engine.step().unwrap();
    assert_eq!(engine.context().get(a).unwrap().output_token_ids(), &[3]);

    // Ten chunks of two tokens each.
    engine.add_request((1..=20).collect(), 4).unwrap();
    for tick in 1..=11 {
        let outcome = engine.step().unwrap();
        assert_eq!(outcome.decode, PhaseOutcome::Ran { batch_size: 1 }, "tick {tick}");
        if tick > 1 {
            assert_eq!(outcome.prefill, PhaseOutcome::Ran { batch_size: 1 }, "tick {tick}");
        }
        let output_len = engine.context().get(a).unwrap().output_token_ids().len();
        assert_eq!(output_len, 1 + tick, "tick {tick}");
    }
}

#[test]
fn test_prefill_leaves_room_for_decode() {
    let mut cfg = config();
    cfg.max_total_token_num = 12;
    let mut engine = engine(cfg);
    let a = engine.add_request(vec![1, 2], 8).unwrap();
    engine.step().unwrap();
    engine.step().unwrap();

    // 10 slots free, A needs one per tick: the 10-token prompt waits.
    engine.add_request((1..=10).collect(), 1).unwrap();
    engine.step().unwrap();
    let outcome = engine.step().unwrap();
    assert_eq!(
        outcome.prefill,
        PhaseOutcome::Deferred { requested: 10, available: 8 }
    );
    assert!(outcome.decode.ran());

    let outputs = sorted(engine.run_to_completion().unwrap());
    assert_eq!(outputs[0].request_id, a);
    assert_eq!(outputs[0].output_token_ids, (3..11).collect::<Vec<_>>());
    assert_eq!(outputs[1].output_token_ids, vec![11]);
    assert_all_slots_free(&engine);
}

#[test]
fn test_speculative_matches_plain_decode() {
    for spec_step in [1, 2] {
        let mut plain = engine(config());
        let mut spec = spec_engine(spec_step, 1);
        for e in [&mut plain, &mut spec] {
            e.add_request(vec![1, 2, 3], 7).unwrap();
            e.add_request(vec![30, 31, 32, 33], 4).unwrap();
        }
        let expected = sorted(plain.run_to_completion().unwrap());
        let got = sorted(spec.run_to_completion().unwrap());

        for (g, e) in got.iter().zip(&expected) {
            assert_eq!(g.output_token_ids, e.output_token_ids, "spec_step {spec_step}");
            assert!(g.total_accepted_len > 0, "spec_step {spec_step}");
        }
        assert_all_slots_free(&spec);
    }
}

#[test]
fn test_speculative_needs_fewer_ticks() {
    let mut spec = spec_engine(2, 1);
    spec.add_request(vec![1, 2, 3], 9).unwrap();
    let mut ticks = 0;
    while spec.has_unfinished_requests() {
        spec.step().unwrap();
        ticks += 1;
    }
    // init, prefill, then three tokens per decode tick after the first token.
    assert_eq!(ticks, 2 + 3);
    assert_eq!(spec.take_finished()[0].output_token_ids, (4..13).collect::<Vec<_>>());
}

#[test]
fn test_rejected_drafts_keep_output_and_slots() {
    let mut plain = engine(config());
    let mut spec = spec_engine(2, 3);
    for e in [&mut plain, &mut spec] {
        e.add_request(vec![5, 6], 6).unwrap();
    }
    let expected = plain.run_to_completion().unwrap();
    let got = spec.run_to_completion().unwrap();
    assert_eq!(got[0].output_token_ids, expected[0].output_token_ids);
    assert_eq!(got[0].total_accepted_len, 0);
    assert_all_slots_free(&spec);
}

#[test]
fn test_speculative_engine_must_match_config() {
    let mut cfg = config();
    cfg.speculative = Some(SpeculativeConfig::new(2));
    let runner = ModelRunner::new(Box::new(ArithmeticModel::new(VOCAB, HIDDEN)));
    assert!(ServingEngine::new(cfg, runner, None, Device::Cpu).is_err());
}

#[test]
fn test_warmup_captures_graphs_then_serves() {
    let mut cfg = config();
    cfg.graph = GraphConfig {
        max_batch_size: 4,
        max_len_in_batch: 64,
        ..GraphConfig::default()
    };
    let runner = ModelRunner::new(Box::new(ArithmeticModel::new(VOCAB, HIDDEN)))
        .with_graph(ReplayGraphCache::new(&cfg.graph, Device::Cpu));
    let mut engine = ServingEngine::new(cfg, runner, None, Device::Cpu).unwrap();

    let stats = engine.warmup().unwrap();
    assert_eq!(stats.batch_sizes, vec![4, 3, 2, 1]);
    let graph = engine.runner().graph().unwrap();
    assert_eq!(graph.captured_batch_sizes(), vec![1, 2, 3, 4]);
    assert_all_slots_free(&engine);

    for i in 0..3 {
        engine.add_request(vec![i + 1], 4).unwrap();
    }
    let outputs = sorted(engine.run_to_completion().unwrap());
    assert_eq!(outputs[2].output_token_ids, vec![4, 5, 6, 7]);
    assert_all_slots_free(&engine);
}

#[test]
fn test_overlap_decode_matches_plain() {
    let mut cfg = config();
    cfg.graph.enable_decode_microbatch_overlap = true;
    let model = ArithmeticModel::new(VOCAB, HIDDEN);
    let stats = model.stats();
    let mut overlap =
        ServingEngine::new(cfg, ModelRunner::new(Box::new(model)), None, Device::Cpu).unwrap();
    let mut plain = engine(config());
    for e in [&mut overlap, &mut plain] {
        for i in 0..3 {
            e.add_request(vec![10 * i + 1, 10 * i + 2], 4).unwrap();
        }
    }
    overlap.step().unwrap();
    assert_eq!(
        overlap.step().unwrap().prefill,
        PhaseOutcome::Ran { batch_size: 3 }
    );
    // The three prompts ran as two prefill microbatches.
    assert_eq!(stats.prefill_calls(), 2);

    assert_eq!(
        sorted(overlap.run_to_completion().unwrap()),
        sorted(plain.run_to_completion().unwrap())
    );
    assert_all_slots_free(&overlap);
}

#[test]
fn test_persistent_slot_shortage_is_an_error() {
    let mut cfg = config();
    cfg.max_total_token_num = 4;
    let mut engine = engine(cfg);
    engine.add_request((1..=8).collect(), 2).unwrap();

    match engine.run_to_completion() {
        Err(Error::OutOfSlots { requested, available }) => {
            assert_eq!(requested, 8);
            assert_eq!(available, 4);
        }
        other => panic!("expected OutOfSlots, got {other:?}"),
    }
    assert_all_slots_free(&engine);
}
