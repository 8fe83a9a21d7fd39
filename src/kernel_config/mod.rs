//! Kernel configuration cache.
//!
//! Compute kernels take a launch configuration (tile sizes, warp counts and
//! so on). The best one depends on the kernel's static shape (e.g. head
//! dimension), the device, and the dynamic shape of the batch. Selected
//! configurations are cached on disk as JSON:
//!
//! ```text
//! <root>/configs/<kernel>/<static_key>,<device_name>.json
//! {
//!     "8,512": {"BLOCK_M": 64, "num_warps": 4},
//!     "16,1024": null
//! }
//! ```
//!
//! A `null` entry records a dynamic key for which no configuration was
//! tuned; the kernel then runs with its built-in default.

pub mod cache;
pub mod tuner;

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use cache::{cache_file_path, ConfigCache};
pub use tuner::{BenchFailure, ConfigSelector, KernelBench, KernelTuner, TuneParams, TunedKernel};

/// Environment variable selecting the [`AutotuneLevel`].
pub const AUTOTUNE_LEVEL_ENV: &str = "AUTOTUNE_LEVEL";

/// One launch configuration: parameter name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelConfig(pub BTreeMap<String, i64>);

impl KernelConfig {
    pub fn get(&self, name: &str) -> Option<i64> {
        self.0.get(name).copied()
    }
}

impl<const N: usize> From<[(&str, i64); N]> for KernelConfig {
    fn from(params: [(&str, i64); N]) -> Self {
        Self(params.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// How kernel configurations are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutotuneLevel {
    /// Never use a tuned configuration.
    Off,
    /// Use cached configurations; unknown keys run with the default.
    #[default]
    UseCached,
    /// Search for a configuration on a cache miss.
    Search,
}

impl AutotuneLevel {
    /// Parse `"0"`, `"1"` or `"2"`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim() {
            "0" => Ok(Self::Off),
            "1" => Ok(Self::UseCached),
            "2" => Ok(Self::Search),
            other => Err(Error::Config(format!(
                "invalid {AUTOTUNE_LEVEL_ENV} value {other:?}, expected 0, 1 or 2"
            ))),
        }
    }

    /// Read the level from [`AUTOTUNE_LEVEL_ENV`], defaulting to `UseCached`.
    pub fn from_env() -> Result<Self> {
        match std::env::var(AUTOTUNE_LEVEL_ENV) {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Expand a parameter grid into every combination, first parameter slowest.
///
/// # Example
///
/// ```
/// use kvserve::kernel_config::generate_configs;
///
/// let configs = generate_configs(&[("BLOCK_M", &[32, 64]), ("num_warps", &[4, 8])]);
/// assert_eq!(configs.len(), 4);
/// assert_eq!(configs[1].get("BLOCK_M"), Some(32));
/// assert_eq!(configs[1].get("num_warps"), Some(8));
/// ```
pub fn generate_configs(grid: &[(&str, &[i64])]) -> Vec<KernelConfig> {
    let mut configs = vec![KernelConfig::default()];
    for (name, values) in grid {
        configs = configs
            .into_iter()
            .flat_map(|base| {
                values.iter().map(move |&v| {
                    let mut next = base.clone();
                    next.0.insert(name.to_string(), v);
                    next
                })
            })
            .collect();
    }
    configs
}

/// Join key parts with commas, the format used in cache files.
pub fn make_key<T: Display>(parts: &[T]) -> String {
    parts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
