use std::path::PathBuf;

use candle_core::Device;
use clap::Parser;
use tracing::{error, info};

use kvserve::engine::{ModelRunner, ReplayGraphCache, Sampler, ServingEngine};
use kvserve::testing::ArithmeticModel;
use kvserve::{logging, EngineConfig, Result, SamplingConfig, SpeculativeConfig, SpeculativeEngine};

#[derive(Parser, Debug)]
#[command(name = "kvserve")]
#[command(about = "Serving core of an LLM inference engine, driven by a synthetic workload")]
struct Args {
    /// Engine configuration (JSON). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of synthetic requests.
    #[arg(long, default_value = "8")]
    num_requests: usize,

    /// Prompt length of every request.
    #[arg(long, default_value = "16")]
    prompt_len: usize,

    /// Maximum tokens to generate per request.
    #[arg(long, default_value = "32")]
    max_new_tokens: usize,

    /// Enable speculative decoding with this many draft steps.
    #[arg(long)]
    spec_step: Option<usize>,

    /// Offset of the draft models; 1 agrees with the main model.
    #[arg(long, default_value = "1")]
    draft_offset: u32,

    /// Sampling temperature (0 = greedy).
    #[arg(long, default_value = "0.0")]
    temperature: f32,

    /// Seed for non-greedy sampling.
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Skip decode graph capture.
    #[arg(long)]
    no_warmup: bool,
}

fn main() {
    let args = Args::parse();
    logging::init_with_level(&args.log_level);
    if let Err(e) = run(&args) {
        error!(error = %e, "simulation failed");
        std::process::exit(1);
    }
}

fn runner(config: &EngineConfig, model: ArithmeticModel, device: &Device) -> ModelRunner {
    let runner = ModelRunner::new(Box::new(model));
    if config.graph.enabled {
        runner.with_graph(ReplayGraphCache::new(&config.graph, device.clone()))
    } else {
        runner
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(spec_step) = args.spec_step {
        config.speculative = Some(SpeculativeConfig::new(spec_step));
    }
    config.validate()?;
    info!(version = env!("CARGO_PKG_VERSION"), "kvserve");

    let device = Device::Cpu;
    let main = runner(&config, ArithmeticModel::new(config.vocab_size, config.hidden_size), &device);
    let speculative = match &config.speculative {
        Some(spec) => {
            let drafts = (0..spec.spec_step)
                .map(|_| {
                    let model = ArithmeticModel::new(config.vocab_size, config.hidden_size)
                        .with_offset(args.draft_offset);
                    runner(&config, model, &device)
                })
                .collect();
            Some(SpeculativeEngine::new(spec.clone(), drafts, config.max_req_num)?)
        }
        None => None,
    };

    let sampling = SamplingConfig {
        temperature: args.temperature,
        ..Default::default()
    };
    let mut engine = ServingEngine::new(config.clone(), main, speculative, device)?
        .with_sampler(Sampler::with_seed(&sampling, args.seed));

    if !args.no_warmup {
        let stats = engine.warmup()?;
        info!(batch_sizes = stats.batch_sizes.len(), "warmup done");
    }

    for i in 0..args.num_requests {
        let prompt = (0..args.prompt_len)
            .map(|t| ((i * 31 + t) % config.vocab_size) as u32)
            .collect();
        engine.add_request(prompt, args.max_new_tokens)?;
    }

    let outputs = engine.run_to_completion()?;
    for out in &outputs {
        info!(
            request_id = out.request_id,
            output_len = out.output_token_ids.len(),
            accepted = out.total_accepted_len,
            finish_reason = ?out.finish_reason,
            output = ?out.output_token_ids,
            "request finished"
        );
    }
    info!(requests = outputs.len(), "simulation complete");
    Ok(())
}
