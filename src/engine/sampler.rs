//! Token sampling.
//!
//! Turns a `[rows, vocab_size]` logits tensor into one token per row.
//!
//! ```text
//! Logits [rows, vocab]
//!     │
//!     ├── temperature == 0 ──► argmax per row (one tensor op)
//!     │
//!     ▼ / temperature, softmax
//! Probabilities
//!     │
//!     ▼ top-k, then top-p truncation (per row, on host)
//!     │
//!     ▼ renormalize + weighted draw
//! Token ids [rows]
//! ```

use candle_core::{DType, Tensor, D};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::SamplingConfig;
use crate::error::{Error, Result};

/// Batched token sampler.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    /// 0 disables top-k.
    top_k: usize,
    /// 1.0 disables top-p.
    top_p: f32,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: &SamplingConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Sampler with a fixed seed, for reproducible runs.
    pub fn with_seed(config: &SamplingConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &SamplingConfig, rng: StdRng) -> Self {
        Self {
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
            rng,
        }
    }

    /// Greedy sampler, as used for warmup and verification.
    pub fn greedy() -> Self {
        Self::with_seed(&SamplingConfig::default(), 0)
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Sample one token per row of `logits` (`[vocab]` or `[rows, vocab]`).
    pub fn sample(&mut self, logits: &Tensor) -> Result<Vec<u32>> {
        let logits = match logits.rank() {
            1 => logits.unsqueeze(0)?,
            2 => logits.clone(),
            r => {
                return Err(Error::Config(format!(
                    "expected 1D or 2D logits, got {r}D"
                )))
            }
        };
        if logits.dim(0)? == 0 {
            return Ok(Vec::new());
        }
        if self.is_greedy() {
            return Ok(logits.argmax(D::Minus1)?.to_vec1::<u32>()?);
        }

        let scaled = (logits.to_dtype(DType::F32)? / self.temperature as f64)?;
        let probs = candle_nn::ops::softmax(&scaled, D::Minus1)?.to_vec2::<f32>()?;
        probs.iter().map(|row| self.sample_row(row)).collect()
    }

    /// Draw from one probability row after top-k / top-p truncation.
    fn sample_row(&mut self, probs: &[f32]) -> Result<u32> {
        let mut candidates: Vec<(u32, f32)> = probs
            .iter()
            .enumerate()
            .map(|(i, &p)| (i as u32, p))
            .collect();
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.top_k > 0 && self.top_k < candidates.len() {
            candidates.truncate(self.top_k);
        }
        if self.top_p > 0.0 && self.top_p < 1.0 {
            let mut cumulative = 0.0f32;
            let cutoff = candidates
                .iter()
                .position(|&(_, p)| {
                    cumulative += p;
                    cumulative > self.top_p
                })
                .map_or(candidates.len(), |i| i + 1);
            candidates.truncate(cutoff);
        }

        let weights: Vec<f64> = candidates.iter().map(|&(_, p)| p as f64).collect();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| Error::Config(format!("cannot sample from distribution: {e}")))?;
        Ok(candidates[dist.sample(&mut self.rng)].0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use std::collections::HashSet;

    fn config(temperature: f32, top_k: usize, top_p: f32) -> SamplingConfig {
        SamplingConfig {
            temperature,
            top_k,
            top_p,
            ..Default::default()
        }
    }

    #[test]
    fn test_greedy_batch() {
        let mut sampler = Sampler::greedy();
        let logits = Tensor::new(
            &[[0.1f32, 0.2, 0.3, 10.0, 0.4], [0.1, 10.0, 0.3, 0.4, 0.5]],
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(sampler.sample(&logits).unwrap(), vec![3, 1]);
    }

    #[test]
    fn test_single_row_promoted() {
        let mut sampler = Sampler::greedy();
        let logits = Tensor::new(&[0.0f32, 5.0, 1.0], &Device::Cpu).unwrap();
        assert_eq!(sampler.sample(&logits).unwrap(), vec![1]);
    }

    #[test]
    fn test_top_k_excludes_tail() {
        let mut sampler = Sampler::with_seed(&config(1.0, 2, 1.0), 42);
        let logits = Tensor::new(&[[0.1f32, 0.2, 0.3, 10.0, 9.0]], &Device::Cpu).unwrap();
        let mut seen = HashSet::new();
        for _ in 0..50 {
            seen.insert(sampler.sample(&logits).unwrap()[0]);
        }
        assert!(seen.iter().all(|t| *t == 3 || *t == 4));
    }

    #[test]
    fn test_top_p_keeps_dominant_token() {
        let mut sampler = Sampler::with_seed(&config(1.0, 0, 0.5), 42);
        let logits = Tensor::new(&[[0.0f32, 0.0, 0.0, 10.0, 0.0]], &Device::Cpu).unwrap();
        for _ in 0..10 {
            assert_eq!(sampler.sample(&logits).unwrap(), vec![3]);
        }
    }

    #[test]
    fn test_seed_reproducibility() {
        let logits = Tensor::new(&[[1.0f32, 1.0, 1.0, 1.0, 1.0]], &Device::Cpu).unwrap();
        let mut a = Sampler::with_seed(&config(1.0, 0, 1.0), 12345);
        let mut b = Sampler::with_seed(&config(1.0, 0, 1.0), 12345);
        let draws_a: Vec<u32> = (0..10).map(|_| a.sample(&logits).unwrap()[0]).collect();
        let draws_b: Vec<u32> = (0..10).map(|_| b.sample(&logits).unwrap()[0]).collect();
        assert_eq!(draws_a, draws_b);
    }
}
