//! Configuration types for nano-specdec.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::probs::MIN_TEMPERATURE;
use crate::speculative::SpeculativeConfig;
use crate::tokenizer::ChatTokenizer;

/// Gemma-3 `<end_of_turn>` token id.
pub const GEMMA_EOT_TOKEN_ID: u32 = 106;

/// Sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature applied to both draft and target logits (1.0 = no change,
    /// 0.0 = greedy).
    pub temperature: f32,
    /// Maximum tokens to generate per turn.
    pub max_new_tokens: usize,
    /// End-of-turn sentinel token.
    pub eot_token_id: u32,
    /// RNG seed. `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_new_tokens: 128,
            eot_token_id: GEMMA_EOT_TOKEN_ID,
            seed: None,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Draft/verify window settings.
    pub speculative: SpeculativeConfig,
    /// Sampling settings.
    pub sampling: SamplingConfig,
    /// Optional system preamble prepended to every prompt.
    pub system_prompt: Option<String>,
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.speculative.num_speculative_tokens == 0 {
            return Err(Error::Config(
                "num_speculative_tokens must be at least 1".to_string(),
            ));
        }
        if self.sampling.max_new_tokens == 0 {
            return Err(Error::Config("max_new_tokens must be at least 1".to_string()));
        }
        let t = self.sampling.temperature;
        if !t.is_finite() || t < 0.0 {
            return Err(Error::Config(format!(
                "temperature must be finite and non-negative, got {t}"
            )));
        }
        if t > 0.0 && t < MIN_TEMPERATURE {
            return Err(Error::Config(format!(
                "temperature must be 0 (greedy) or at least {MIN_TEMPERATURE}, got {t}"
            )));
        }
        Ok(())
    }

    /// Set the lookahead window.
    pub fn lookahead(mut self, k: usize) -> Self {
        self.speculative.num_speculative_tokens = k;
        self
    }

    /// Set the end-of-turn token.
    pub fn eot_token_id(mut self, token: u32) -> Self {
        self.sampling.eot_token_id = token;
        self
    }

    /// Take the end-of-turn token from `tokenizer` when its vocabulary
    /// defines one; otherwise keep the configured id.
    pub fn eot_from(self, tokenizer: &impl ChatTokenizer) -> Self {
        match tokenizer.eot_token_id() {
            Some(token) => self.eot_token_id(token),
            None => self,
        }
    }

    /// Set the generation budget.
    pub fn max_new_tokens(mut self, n: usize) -> Self {
        self.sampling.max_new_tokens = n;
        self
    }

    /// Set the sampling temperature.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.sampling.temperature = temperature;
        self
    }

    /// Seed the RNG for reproducible runs.
    pub fn seed(mut self, seed: u64) -> Self {
        self.sampling.seed = Some(seed);
        self
    }

    /// Set the system preamble.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}
