//! Probability utilities.
//!
//! Everything the decoding loop needs to turn raw logits into decisions:
//!
//! ```text
//! Logits [vocab_size]
//!     │
//!     ▼ (optional) temperature scaling
//!     ▼ softmax (max-subtracted)
//! Distribution
//!     │
//!     ├─▶ argmax              greedy pick, lowest index wins ties
//!     ├─▶ sample_categorical  inverse-CDF walk with a caller-supplied uniform draw
//!     └─▶ residual(q, p)      max(q - p, 0), renormalized
//! ```
//!
//! Nothing here owns an RNG; callers pass the uniform draw in.

use crate::error::{Error, Result};

/// Residual mass at or below this is treated as "q and p coincide".
const RESIDUAL_EPSILON: f64 = f32::EPSILON as f64;

/// Smallest temperature that still samples; anything below decodes greedily.
pub const MIN_TEMPERATURE: f32 = 1e-3;

/// A dense probability distribution over the vocabulary.
///
/// Invariant: every entry is finite and `>= 0`, and the entries sum to 1
/// within floating tolerance.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    probs: Vec<f32>,
}

impl Distribution {
    /// Build a distribution from non-negative weights, renormalizing them.
    pub fn from_weights(weights: Vec<f32>) -> Result<Self> {
        if weights.is_empty() {
            return Err(Error::Numeric("empty distribution".to_string()));
        }
        if let Some(bad) = weights.iter().find(|w| !w.is_finite() || **w < 0.0) {
            return Err(Error::Numeric(format!("invalid probability weight {bad}")));
        }
        let sum: f64 = weights.iter().map(|&w| w as f64).sum();
        if sum <= 0.0 {
            return Err(Error::Numeric("distribution has no mass".to_string()));
        }
        let probs = weights.iter().map(|&w| (w as f64 / sum) as f32).collect();
        Ok(Self { probs })
    }

    /// All mass on `index`.
    pub fn one_hot(len: usize, index: usize) -> Result<Self> {
        if index >= len {
            return Err(Error::Numeric(format!(
                "one-hot index {index} out of range for size {len}"
            )));
        }
        let mut probs = vec![0.0; len];
        probs[index] = 1.0;
        Ok(Self { probs })
    }

    /// Vocabulary size.
    pub fn len(&self) -> usize {
        self.probs.len()
    }

    /// Always false for a constructed distribution.
    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    /// Raw probabilities.
    pub fn as_slice(&self) -> &[f32] {
        &self.probs
    }

    /// Probability of `index`, zero when out of range.
    pub fn prob(&self, index: usize) -> f32 {
        self.probs.get(index).copied().unwrap_or(0.0)
    }

    /// Sum of all entries.
    pub fn sum(&self) -> f64 {
        self.probs.iter().map(|&p| p as f64).sum()
    }

    /// See [`argmax`].
    pub fn argmax(&self) -> usize {
        argmax(&self.probs)
    }

    /// See [`sample_categorical`].
    pub fn sample(&self, random_unit: f64) -> usize {
        sample_categorical(&self.probs, random_unit)
    }

    /// Unnormalized mass of `max(q - p, 0)`.
    pub fn residual_mass(q: &Distribution, p: &Distribution) -> Result<f64> {
        check_same_size(q, p)?;
        Ok(q.probs
            .iter()
            .zip(&p.probs)
            .map(|(&qi, &pi)| (qi as f64 - pi as f64).max(0.0))
            .sum())
    }

    /// Residual distribution `max(q - p, 0) / sum`, used after a rejection.
    ///
    /// When `q` and `p` coincide on all the relevant mass the residual is
    /// empty and `q` itself is returned.
    pub fn residual(q: &Distribution, p: &Distribution) -> Result<Distribution> {
        let mass = Self::residual_mass(q, p)?;
        if mass <= RESIDUAL_EPSILON {
            return Ok(q.clone());
        }
        let probs = q
            .probs
            .iter()
            .zip(&p.probs)
            .map(|(&qi, &pi)| ((qi as f64 - pi as f64).max(0.0) / mass) as f32)
            .collect();
        Ok(Distribution { probs })
    }
}

fn check_same_size(q: &Distribution, p: &Distribution) -> Result<()> {
    if q.len() != p.len() {
        return Err(Error::Numeric(format!(
            "vocabulary mismatch: target has {} entries, draft has {}",
            q.len(),
            p.len()
        )));
    }
    Ok(())
}

/// Numerically stable softmax.
///
/// Fails with [`Error::Numeric`] on empty input or any non-finite logit.
pub fn softmax(logits: &[f32]) -> Result<Distribution> {
    check_logits(logits)?;
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f64> = logits.iter().map(|&l| ((l - max) as f64).exp()).collect();
    let sum: f64 = exps.iter().sum();
    let probs = exps.iter().map(|&e| (e / sum) as f32).collect();
    Ok(Distribution { probs })
}

/// Softmax over `logits / temperature`.
///
/// A temperature below [`MIN_TEMPERATURE`] collapses to the one-hot
/// distribution at the argmax, i.e. greedy decoding.
pub fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Result<Distribution> {
    check_logits(logits)?;
    if temperature < MIN_TEMPERATURE {
        return Distribution::one_hot(logits.len(), argmax(logits));
    }
    if temperature == 1.0 {
        return softmax(logits);
    }
    // Scale after subtracting the max so large logits cannot overflow
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let t = temperature as f64;
    let exps: Vec<f64> = logits
        .iter()
        .map(|&l| ((l as f64 - max) / t).exp())
        .collect();
    let sum: f64 = exps.iter().sum();
    let probs = exps.iter().map(|&e| (e / sum) as f32).collect();
    Ok(Distribution { probs })
}

fn check_logits(logits: &[f32]) -> Result<()> {
    if logits.is_empty() {
        return Err(Error::Numeric("softmax of empty logits".to_string()));
    }
    if let Some((i, l)) = logits.iter().enumerate().find(|(_, l)| !l.is_finite()) {
        return Err(Error::Numeric(format!("non-finite logit {l} at index {i}")));
    }
    Ok(())
}

/// First index attaining the maximum.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Inverse-CDF sampling with an externally drawn `random_unit` in `[0, 1)`.
///
/// Returns the first index with nonzero mass whose cumulative mass reaches
/// `random_unit`. If rounding leaves mass unconsumed, the last index with
/// nonzero mass is returned, so any input in `[0, 1)` yields a valid index.
pub fn sample_categorical(probs: &[f32], random_unit: f64) -> usize {
    let mut cumulative = 0.0f64;
    let mut last_nonzero = probs.len().saturating_sub(1);
    let mut seen_mass = false;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumulative += p as f64;
        last_nonzero = i;
        seen_mass = true;
        if cumulative >= random_unit {
            return i;
        }
    }
    if seen_mass {
        last_nonzero
    } else {
        probs.len().saturating_sub(1)
    }
}
