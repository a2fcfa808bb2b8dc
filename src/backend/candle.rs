//! Candle adapter.

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use tracing::debug;

use super::{check_input, Logits, ModelBackend};
use crate::error::{Error, Result};
use crate::Token;

/// A candle causal LM that returns logits for every input position.
pub trait CausalLm: Send {
    /// `input_ids` is `[1, seq_len]`; returns `[1, seq_len, vocab]` or
    /// `[seq_len, vocab]`.
    fn forward_all(&mut self, input_ids: &Tensor) -> candle_core::Result<Tensor>;

    /// Device the model's weights live on.
    fn device(&self) -> &Device;
}

/// Exposes a [`CausalLm`] as a [`ModelBackend`].
pub struct CandleBackend<M> {
    name: String,
    model: M,
}

impl<M: CausalLm> CandleBackend<M> {
    pub fn new(name: impl Into<String>, model: M) -> Self {
        Self {
            name: name.into(),
            model,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn run(&mut self, tokens: &[Token]) -> candle_core::Result<Vec<Vec<f32>>> {
        let input_ids = Tensor::new(tokens, self.model.device())?.unsqueeze(0)?;
        let logits = self.model.forward_all(&input_ids)?;
        let logits = match logits.rank() {
            3 => logits.squeeze(0)?,
            2 => logits,
            rank => {
                return Err(candle_core::Error::Msg(format!(
                    "expected 2D or 3D logits, got {rank}D"
                )))
            }
        };
        logits.to_dtype(DType::F32)?.to_vec2::<f32>()
    }
}

#[async_trait]
impl<M: CausalLm> ModelBackend for CandleBackend<M> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&mut self, tokens: &[Token], attention_mask: &[u32]) -> Result<Logits> {
        check_input(tokens, attention_mask)?;
        debug!(backend = %self.name, seq_len = tokens.len(), "forward");
        let rows = self
            .run(tokens)
            .map_err(|e| Error::Inference(format!("{}: {e}", self.name)))?;
        Logits::new(rows)
    }
}
