//! Speculative decoding configuration.

use serde::{Deserialize, Serialize};

/// Configuration for speculative decoding.
///
/// Speculative decoding uses a small draft model to generate K tokens,
/// then verifies them with the larger target model in a single forward pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    /// Number of tokens to speculate per block (K, the lookahead).
    /// Higher values can improve throughput if acceptance rate is high,
    /// but waste draft passes when many tokens are rejected.
    pub num_speculative_tokens: usize,

    /// Draft model HuggingFace ID.
    /// Must share the target's vocabulary.
    pub draft_model_id: String,

    /// Target model HuggingFace ID.
    pub target_model_id: String,

    /// Revision (branch, tag, or commit hash) for both models.
    pub revision: String,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            num_speculative_tokens: 3,
            draft_model_id: "onnx-community/gemma-3-270m-it-ONNX".to_string(),
            target_model_id: "onnx-community/gemma-3-1b-it-ONNX".to_string(),
            revision: "main".to_string(),
        }
    }
}

impl SpeculativeConfig {
    /// Create a new speculative config with the given draft model.
    pub fn new(draft_model_id: impl Into<String>) -> Self {
        Self {
            draft_model_id: draft_model_id.into(),
            ..Default::default()
        }
    }

    /// Set the number of speculative tokens.
    pub fn num_tokens(mut self, k: usize) -> Self {
        self.num_speculative_tokens = k;
        self
    }

    /// Set the target model.
    pub fn target(mut self, target_model_id: impl Into<String>) -> Self {
        self.target_model_id = target_model_id.into();
        self
    }

    /// Set the model revision.
    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }
}
