//! Inference backends.
//!
//! The decoding loop only needs one capability from a model: given the full
//! token history, return next-token logits for every position. This module
//! defines that boundary:
//!
//! - [`ModelBackend`]: async forward pass, batch size 1, no cache
//! - [`Logits`]: validated per-position logit rows
//! - [`CandleBackend`]: adapter for candle models implementing [`CausalLm`]
//! - [`BigramLm`]: a tiny candle model used by the demo binary and tests

pub mod bigram;
pub mod candle;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::Token;

pub use self::bigram::BigramLm;
pub use self::candle::{CandleBackend, CausalLm};

/// Logits for every position of one sequence: `[seq_len][vocab_size]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    rows: Vec<Vec<f32>>,
}

impl Logits {
    /// Wrap per-position rows, rejecting empty or ragged shapes.
    pub fn new(rows: Vec<Vec<f32>>) -> Result<Self> {
        let vocab_size = match rows.first() {
            Some(row) if !row.is_empty() => row.len(),
            Some(_) => return Err(Error::Inference("logit rows are empty".to_string())),
            None => return Err(Error::Inference("backend returned no positions".to_string())),
        };
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != vocab_size) {
            return Err(Error::Inference(format!(
                "ragged logits: row {i} has {} entries, expected {vocab_size}",
                row.len()
            )));
        }
        Ok(Self { rows })
    }

    /// Number of positions.
    pub fn num_positions(&self) -> usize {
        self.rows.len()
    }

    /// Vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.rows[0].len()
    }

    /// Logits predicting the token after `position`.
    pub fn position(&self, position: usize) -> Result<&[f32]> {
        self.rows.get(position).map(Vec::as_slice).ok_or_else(|| {
            Error::Inference(format!(
                "position {position} out of range for {} positions",
                self.rows.len()
            ))
        })
    }

    /// Logits predicting the token after the last position.
    pub fn last(&self) -> &[f32] {
        &self.rows[self.rows.len() - 1]
    }

    /// Fail unless there is exactly one row per input token.
    pub fn expect_positions(&self, expected: usize, backend: &str) -> Result<()> {
        if self.rows.len() != expected {
            return Err(Error::Inference(format!(
                "{backend} returned {} positions for {expected} input tokens",
                self.rows.len()
            )));
        }
        Ok(())
    }
}

/// A causal language model backend.
///
/// Each call is one full forward pass over `tokens`; nothing is cached
/// between calls. `attention_mask` is all ones and has the same length as
/// `tokens`.
#[async_trait]
pub trait ModelBackend: Send {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Logits for every position of `tokens`.
    async fn forward(&mut self, tokens: &[Token], attention_mask: &[u32]) -> Result<Logits>;
}

/// Check the shape contract shared by all backends.
pub fn check_input(tokens: &[Token], attention_mask: &[u32]) -> Result<()> {
    if tokens.is_empty() {
        return Err(Error::Inference("forward pass over empty input".to_string()));
    }
    if attention_mask.len() != tokens.len() {
        return Err(Error::Inference(format!(
            "attention mask has {} entries for {} tokens",
            attention_mask.len(),
            tokens.len()
        )));
    }
    Ok(())
}
