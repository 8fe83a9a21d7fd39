//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

/// Configuration for multi-token speculative decoding.
///
/// A chain of `spec_step` draft models proposes that many tokens per request
/// after every main-model step; the main model verifies all of them in the
/// next decode pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeculativeConfig {
    /// Number of chained draft models, and of draft tokens per request.
    pub spec_step: usize,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self { spec_step: 1 }
    }
}

impl SpeculativeConfig {
    pub fn new(spec_step: usize) -> Self {
        Self { spec_step }
    }

    /// Token rows per request in a verification batch (main token + drafts).
    pub fn stride(&self) -> usize {
        self.spec_step + 1
    }
}
