//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nano_specdec::backend::check_input;
use nano_specdec::engine::CancelToken;
use nano_specdec::{
    ChatTokenizer, ChatTurn, EngineConfig, Error, Event, EventKind, GenerationMachine, Logits,
    ModelBackend, Result, Token, UpdateStage, WordTokenizer,
};

/// Logit of the scripted token; every other entry is 0. Large enough that
/// softmax puts all but ~1e-22 of the mass on it.
pub const PEAK: f32 = 50.0;

pub const EOT: Token = WordTokenizer::END_OF_TURN;

// Ids in `tokenizer()`
pub const TWO_PLUS_TWO: Token = 5;
pub const FOUR: Token = 6;
pub const FIVE: Token = 7;
pub const A: Token = 8;
pub const B: Token = 9;
pub const C: Token = 10;
pub const D: Token = 11;
pub const E: Token = 12;

pub const VOCAB: usize = 15;

type Rule = Arc<dyn Fn(&[Token]) -> Token + Send + Sync>;

/// Token a test fills in once the session exists.
pub type CancelSlot = Arc<Mutex<Option<CancelToken>>>;

/// Backend whose next token is a function of the context.
pub struct ScriptedBackend {
    name: String,
    rule: Rule,
    calls: Arc<Mutex<Vec<usize>>>,
    fail_on_call: Option<usize>,
    cancel_on_call: Option<(usize, CancelSlot)>,
    vocab: usize,
}

impl ScriptedBackend {
    pub fn new(name: &str, rule: impl Fn(&[Token]) -> Token + Send + Sync + 'static) -> Self {
        Self {
            name: name.to_string(),
            rule: Arc::new(rule),
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_on_call: None,
            cancel_on_call: None,
            vocab: VOCAB,
        }
    }

    /// Follows `script` after `prompt_len` tokens, then ends the turn.
    pub fn scripted(name: &str, prompt_len: usize, script: Vec<Token>) -> Self {
        Self::new(name, move |ctx| {
            script
                .get(ctx.len().saturating_sub(prompt_len))
                .copied()
                .unwrap_or(EOT)
        })
    }

    /// Cycles through the word ids forever.
    pub fn endless(name: &str) -> Self {
        Self::new(name, |ctx| A + (ctx.len() % 7) as Token)
    }

    /// Fail the `n`th forward call (0-based).
    pub fn failing_on(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    /// Cancel the token in `slot` during the `n`th forward call; the call
    /// itself still succeeds.
    pub fn cancelling_on(mut self, n: usize, slot: CancelSlot) -> Self {
        self.cancel_on_call = Some((n, slot));
        self
    }

    /// Emit rows over `vocab` entries instead of [`VOCAB`].
    pub fn with_vocab(mut self, vocab: usize) -> Self {
        self.vocab = vocab;
        self
    }

    /// Input lengths of every forward call so far.
    pub fn calls(&self) -> Arc<Mutex<Vec<usize>>> {
        self.calls.clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn forward(&mut self, tokens: &[Token], attention_mask: &[u32]) -> Result<Logits> {
        check_input(tokens, attention_mask)?;
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(tokens.len());
            calls.len() - 1
        };
        if self.fail_on_call == Some(call) {
            return Err(Error::Inference(format!("{}: scripted failure", self.name)));
        }
        if let Some((n, slot)) = &self.cancel_on_call {
            if *n == call {
                if let Some(token) = slot.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
        }
        let rows = (1..=tokens.len())
            .map(|end| peaked_over(self.vocab, (self.rule)(&tokens[..end])))
            .collect();
        Logits::new(rows)
    }
}

pub fn peaked(token: Token) -> Vec<f32> {
    peaked_over(VOCAB, token)
}

pub fn peaked_over(vocab: usize, token: Token) -> Vec<f32> {
    let mut row = vec![0.0; vocab];
    row[token as usize % vocab] = PEAK;
    row
}

pub fn tokenizer() -> WordTokenizer {
    WordTokenizer::new(["2+2=", "4", "5", "a", "b", "c", "d", "e", "f", "g"])
}

/// Template length of a single user turn.
pub fn prompt_len(prompt: &str) -> usize {
    tokenizer()
        .apply_chat_template(&[ChatTurn::user(prompt)])
        .unwrap()
        .len()
}

pub fn config() -> EngineConfig {
    EngineConfig::default()
        .lookahead(3)
        .eot_token_id(EOT)
        .max_new_tokens(64)
        .seed(42)
}

pub type ScriptedMachine = GenerationMachine<ScriptedBackend, ScriptedBackend, WordTokenizer>;

pub fn machine(draft: ScriptedBackend, target: ScriptedBackend, config: EngineConfig) -> ScriptedMachine {
    GenerationMachine::new(draft, target, tokenizer(), config).unwrap()
}

pub fn stage_updates(events: &[Event]) -> Vec<(UpdateStage, String)> {
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StageUpdate { stage, token } => Some((*stage, token.clone())),
            _ => None,
        })
        .collect()
}

pub fn count_done(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::SessionDone))
        .count()
}
