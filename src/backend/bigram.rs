//! Bigram language model.
//!
//! The smallest possible causal LM: an embedding table of shape
//! `[vocab, vocab]` where row `t` holds the logits for the token following
//! `t`. It is enough to exercise the whole draft/verify/sample loop without
//! loading real weights, and two tables that differ by a little noise behave
//! like a draft/target pair with a tunable acceptance rate.

use candle_core::{Device, Tensor};
use candle_nn::{Embedding, Module};

use super::candle::CausalLm;
use crate::error::{Error, Result};

/// Bigram model backed by a `[vocab, vocab]` logit table.
#[derive(Debug, Clone)]
pub struct BigramLm {
    table: Tensor,
    embedding: Embedding,
    vocab_size: usize,
    device: Device,
}

impl BigramLm {
    /// Build from an explicit logit table.
    pub fn from_table(table: Tensor) -> Result<Self> {
        let (rows, cols) = table.dims2()?;
        if rows != cols {
            return Err(Error::Config(format!(
                "bigram table must be square, got {rows}x{cols}"
            )));
        }
        let device = table.device().clone();
        let embedding = Embedding::new(table.clone(), cols);
        Ok(Self {
            table,
            embedding,
            vocab_size: cols,
            device,
        })
    }

    /// Random table with logits drawn from `N(0, scale)`.
    pub fn random(vocab_size: usize, scale: f32, device: &Device) -> Result<Self> {
        let table = Tensor::randn(0f32, scale, (vocab_size, vocab_size), device)?;
        Self::from_table(table)
    }

    /// Same table plus `N(0, noise)` logit noise. Used to derive a draft
    /// model that mostly agrees with this one.
    pub fn perturbed(&self, noise: f32) -> Result<Self> {
        let delta = self.table.randn_like(0.0, noise as f64)?;
        Self::from_table(self.table.add(&delta)?)
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn table(&self) -> &Tensor {
        &self.table
    }
}

impl CausalLm for BigramLm {
    fn forward_all(&mut self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        self.embedding.forward(input_ids)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
