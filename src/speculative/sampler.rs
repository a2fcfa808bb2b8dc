//! Rejection sampling for speculative decoding.
//!
//! For each draft token `x` drawn from the draft distribution `p`, with the
//! target distribution `q` for the same position:
//!
//! ```text
//! r ~ U[0, 1)
//! accept x        iff r < min(1, q[x] / p[x])
//! otherwise       resample from max(q - p, 0) / Σ max(q - p, 0)
//! all accepted    sample one bonus token from q at position k
//! ```
//!
//! Accepted tokens are distributed exactly as if the target model had
//! produced them itself.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SamplingConfig;
use crate::error::Result;
use crate::probs::Distribution;
use crate::Token;

/// Decision for one draft position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Draft token kept.
    Accepted,
    /// Draft token discarded, together with the rest of its block.
    Rejected,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Rejection sampler.
///
/// Owns the RNG used for every random decision of a run: draft sampling, the
/// acceptance test, and residual or bonus sampling. Seeding it makes a run
/// fully reproducible.
#[derive(Debug, Clone)]
pub struct RejectionSampler {
    rng: StdRng,
}

impl Default for RejectionSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl RejectionSampler {
    /// Create a sampler seeded from entropy.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Create with a fixed seed for reproducibility.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Seeded when the config carries a seed, entropy otherwise.
    pub fn from_config(config: &SamplingConfig) -> Self {
        match config.seed {
            Some(seed) => Self::with_seed(seed),
            None => Self::new(),
        }
    }

    /// Uniform draw in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// `min(1, q[x] / p[x])`.
    ///
    /// A token the draft assigned no mass to is accepted whenever the target
    /// gives it any.
    pub fn acceptance_probability(token: Token, p: &Distribution, q: &Distribution) -> f64 {
        let px = p.prob(token as usize) as f64;
        let qx = q.prob(token as usize) as f64;
        if px <= 0.0 {
            return if qx > 0.0 { 1.0 } else { 0.0 };
        }
        (qx / px).min(1.0)
    }

    /// Run the acceptance test for one draft token.
    pub fn accept(&mut self, token: Token, p: &Distribution, q: &Distribution) -> Verdict {
        let r = self.uniform();
        if r < Self::acceptance_probability(token, p, q) {
            Verdict::Accepted
        } else {
            Verdict::Rejected
        }
    }

    /// Draw a token from `dist`.
    pub fn sample(&mut self, dist: &Distribution) -> Token {
        let r = self.uniform();
        dist.sample(r) as Token
    }

    /// Draw the replacement for a rejected token from the residual of `q`
    /// over `p`.
    pub fn resample(&mut self, q: &Distribution, p: &Distribution) -> Result<Token> {
        let residual = Distribution::residual(q, p)?;
        Ok(self.sample(&residual))
    }
}
