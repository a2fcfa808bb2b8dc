//! nano-specdec: a steppable speculative decoding engine in Rust.
//!
//! A small draft model proposes a block of tokens, a larger target model
//! verifies the whole block in one forward pass, and rejection sampling keeps
//! the output distributed exactly as the target model alone would produce:
//! - Probability utilities (softmax, categorical sampling, residuals)
//! - Draft/target model backends behind one async trait
//! - A Draft → Verify → Sample state machine that can be paused and stepped
//! - A command/event protocol served by a tokio worker

/// Token identifier in the model vocabulary.
pub type Token = u32;

pub mod config;
pub mod error;

pub mod backend;
pub mod engine;
pub mod hub;
pub mod probs;
pub mod speculative;
pub mod tokenizer;

pub use backend::{BigramLm, CandleBackend, CausalLm, Logits, ModelBackend};
pub use config::{EngineConfig, SamplingConfig, GEMMA_EOT_TOKEN_ID};
pub use engine::{
    spawn_worker, Command, CommandSender, Event, EventKind, EventSink, GenerationMachine,
    GenerationSession, SessionId, Stage, StepOutcome, UpdateStage, WorkerHandle,
};
pub use error::{Error, Result};
pub use probs::{
    argmax, sample_categorical, softmax, softmax_with_temperature, Distribution, MIN_TEMPERATURE,
};
pub use speculative::{RejectionSampler, SpeculativeConfig, Verdict};
pub use tokenizer::{ChatTokenizer, ChatTurn, HfChatTokenizer, Role, WordTokenizer};
