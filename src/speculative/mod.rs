//! Speculative multi-token decoding.
//!
//! ## How it works
//!
//! 1. **Draft**: after each main-model pass, a chain of `spec_step` draft
//!    models proposes one token each per request.
//!
//! 2. **Verify**: the next decode pass runs the main model on
//!    `stride = spec_step + 1` rows per request: the last committed token
//!    followed by the drafts.
//!
//! 3. **Accept**: drafts are accepted while they match the main model's own
//!    predictions; the first mismatch rejects the rest of the cycle and the
//!    rejected rows' KV slots are released.
//!
//! ```text
//! spec_step = 2, stride = 3
//! rows:     [last, d0, d1]
//! main:     [  t0, t1, t2]
//! accept:   d0 == t0 ?  then d1 == t1 ?
//! commit:   t0 (+ t1 if d0 ok) (+ t2 if d1 ok)
//! ```

pub mod config;
pub mod draft_map;
pub mod engine;
pub mod verifier;

pub use config::SpeculativeConfig;
pub use draft_map::DraftTokenMap;
pub use engine::SpeculativeEngine;
pub use verifier::{align_verification_tokens, verify, VerifyOutcome};
