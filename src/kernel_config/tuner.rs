//! Configuration selection and search.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, info};

use super::cache::{cache_file_path, ConfigCache};
use super::{make_key, AutotuneLevel, KernelConfig};
use crate::engine::model::InferState;
use crate::error::Result;

/// Why a configuration could not be benchmarked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenchFailure {
    /// The configuration needs more shared memory or registers than available.
    OutOfResources,
    /// The kernel rejected the configuration at compile time.
    CompileAssertion,
}

/// Times a kernel under one configuration.
pub trait KernelBench {
    /// Median runtime in milliseconds after `warmup` untimed runs.
    fn bench(
        &mut self,
        config: &KernelConfig,
        warmup: usize,
        rep: usize,
    ) -> std::result::Result<f64, BenchFailure>;
}

impl<F> KernelBench for F
where
    F: FnMut(&KernelConfig) -> std::result::Result<f64, BenchFailure>,
{
    fn bench(
        &mut self,
        config: &KernelConfig,
        _warmup: usize,
        _rep: usize,
    ) -> std::result::Result<f64, BenchFailure> {
        self(config)
    }
}

/// Benchmark repetition counts for the two search phases.
#[derive(Debug, Clone)]
pub struct TuneParams {
    pub warmup: usize,
    pub rep: usize,
    pub init_warmup: usize,
    pub init_rep: usize,
    /// Candidates kept after the initial screening.
    pub top_k: usize,
}

impl Default for TuneParams {
    fn default() -> Self {
        Self {
            warmup: 25,
            rep: 100,
            init_warmup: 2,
            init_rep: 3,
            top_k: 10,
        }
    }
}

/// Picks kernel configurations for one kernel, searching on cache misses
/// when allowed.
#[derive(Debug)]
pub struct KernelTuner {
    kernel_name: String,
    configs: Vec<KernelConfig>,
    level: AutotuneLevel,
    search_enabled: bool,
    params: TuneParams,
    root: PathBuf,
    /// One cache per (static key, device) file.
    caches: HashMap<PathBuf, ConfigCache>,
}

impl KernelTuner {
    /// Create a tuner over `configs`, storing caches below `root`.
    pub fn new(
        kernel_name: impl Into<String>,
        configs: Vec<KernelConfig>,
        level: AutotuneLevel,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            configs,
            level,
            search_enabled: level == AutotuneLevel::Search,
            params: TuneParams::default(),
            root: root.into(),
            caches: HashMap::new(),
        }
    }

    pub fn with_params(mut self, params: TuneParams) -> Self {
        self.params = params;
        self
    }

    /// Only rank 0 searches; other ranks read the cache it writes.
    pub fn with_rank(mut self, rank: usize) -> Self {
        if rank != 0 {
            self.search_enabled = false;
        }
        self
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn level(&self) -> AutotuneLevel {
        self.level
    }

    /// Configuration for `dynamic_key` under `static_key` on `device_name`.
    ///
    /// Returns `None` when tuning is off or no configuration is known and
    /// searching is disabled; such misses are remembered as `null`.
    pub fn select(
        &mut self,
        static_key: &str,
        dynamic_key: &str,
        device_name: &str,
        bench: &mut dyn KernelBench,
    ) -> Result<Option<KernelConfig>> {
        if self.level == AutotuneLevel::Off {
            return Ok(None);
        }
        let path = cache_file_path(&self.root, &self.kernel_name, static_key, device_name);
        if !self.caches.contains_key(&path) {
            let cache = ConfigCache::load(&path)?;
            self.caches.insert(path.clone(), cache);
        }

        if let Some(hit) = self.caches.get(&path).and_then(|c| c.get(dynamic_key)) {
            return Ok(hit.cloned());
        }

        let selected = if self.search_enabled {
            let best = self.search_best_config(bench);
            info!(kernel = %self.kernel_name, key = dynamic_key, ?best, "tuned kernel config");
            best
        } else {
            None
        };
        if let Some(cache) = self.caches.get_mut(&path) {
            cache.insert(dynamic_key, selected.clone());
            if self.search_enabled {
                cache.save()?;
            }
        }
        Ok(selected)
    }

    /// Two-phase search: a cheap pass over every configuration, then a
    /// longer pass over the fastest `top_k`.
    pub fn search_best_config(&self, bench: &mut dyn KernelBench) -> Option<KernelConfig> {
        let mut initial: Vec<(&KernelConfig, f64)> = self
            .configs
            .iter()
            .map(|c| (c, time(bench, c, self.params.init_warmup, self.params.init_rep)))
            .collect();
        initial.sort_by(|a, b| a.1.total_cmp(&b.1));

        let top_k = self.params.top_k.min(initial.len());
        let mut fine: Vec<(&KernelConfig, f64)> = initial[..top_k]
            .iter()
            .map(|(c, _)| (*c, time(bench, c, self.params.warmup, self.params.rep)))
            .collect();
        fine.sort_by(|a, b| a.1.total_cmp(&b.1));
        debug!(kernel = %self.kernel_name, candidates = fine.len(), "fine screening done");

        fine.first().map(|(c, _)| (*c).clone())
    }
}

/// Benchmark failures rank behind every successful configuration.
fn time(bench: &mut dyn KernelBench, config: &KernelConfig, warmup: usize, rep: usize) -> f64 {
    bench.bench(config, warmup, rep).unwrap_or(f64::INFINITY)
}

/// Selects the kernel configuration injected into a forward pass.
pub trait ConfigSelector: Send {
    fn select_config(&mut self, state: &InferState) -> Result<Option<KernelConfig>>;
}

/// A tuner bound to one kernel's benchmark, static key and device.
///
/// The dynamic key is the batch size and the next power of two of the
/// packed token count.
pub struct TunedKernel<B> {
    tuner: KernelTuner,
    bench: B,
    static_key: String,
    device_name: String,
}

impl<B: KernelBench + Send> TunedKernel<B> {
    pub fn new(
        tuner: KernelTuner,
        bench: B,
        static_key: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            tuner,
            bench,
            static_key: static_key.into(),
            device_name: device_name.into(),
        }
    }

    pub fn dynamic_key(state: &InferState) -> String {
        make_key(&[state.batch_size, state.total_token_num.next_power_of_two()])
    }
}

impl<B: KernelBench + Send> ConfigSelector for TunedKernel<B> {
    fn select_config(&mut self, state: &InferState) -> Result<Option<KernelConfig>> {
        let key = Self::dynamic_key(state);
        self.tuner
            .select(&self.static_key, &key, &self.device_name, &mut self.bench)
    }
}
