//! Generation session state.
//!
//! A session is one run of speculative decoding for one prompt. It is owned
//! by [`GenerationMachine`](super::GenerationMachine) and only mutated as the
//! last action of a successful step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::protocol::{Event, EventKind, SessionId};
use crate::probs::Distribution;
use crate::Token;

/// State machine stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Extend the draft block by one token.
    Draft,
    /// Check the draft token at `verify_index`.
    Verify,
    /// Commit the residual or bonus token and close the block.
    Sample,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Verify => "verify",
            Self::Sample => "sample",
        }
    }
}

/// The in-flight speculative window.
#[derive(Debug, Clone, Default)]
pub struct DraftBlock {
    tokens: Vec<Token>,
    probs: Vec<Distribution>,
}

impl DraftBlock {
    pub fn push(&mut self, token: Token, dist: Distribution) {
        self.tokens.push(token);
        self.probs.push(dist);
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Draft distribution `token(i)` was sampled from.
    pub fn dist(&self, i: usize) -> Option<&Distribution> {
        self.probs.get(i)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
        self.probs.clear();
    }
}

/// Target distributions for the current block plus the verify cursor.
///
/// `targets` holds `len(block) + 1` entries once computed: one per draft
/// position and the bonus position after the block.
#[derive(Debug, Clone, Default)]
pub struct VerificationState {
    targets: Option<Vec<Distribution>>,
    verify_index: usize,
}

impl VerificationState {
    pub fn targets(&self) -> Option<&[Distribution]> {
        self.targets.as_deref()
    }

    pub fn verify_index(&self) -> usize {
        self.verify_index
    }

    pub(crate) fn set_targets(&mut self, targets: Vec<Distribution>) {
        self.targets = Some(targets);
    }

    pub(crate) fn advance(&mut self) {
        self.verify_index += 1;
    }

    pub fn reset(&mut self) {
        self.targets = None;
        self.verify_index = 0;
    }
}

/// Cooperative cancellation flag for one session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-session speculation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeculationStats {
    /// Draft tokens proposed.
    pub drafted: usize,
    /// Draft tokens accepted.
    pub accepted: usize,
    /// Draft tokens rejected (at most one per block).
    pub rejected: usize,
    /// Bonus tokens taken after a fully accepted block.
    pub bonus: usize,
    /// Target model forward passes.
    pub target_passes: usize,
}

impl SpeculationStats {
    /// Fraction of verified draft tokens that were accepted.
    pub fn acceptance_rate(&self) -> f64 {
        let verified = self.accepted + self.rejected;
        if verified == 0 {
            0.0
        } else {
            self.accepted as f64 / verified as f64
        }
    }
}

/// Aggregate root of one generation run.
#[derive(Debug)]
pub struct GenerationSession {
    id: SessionId,
    pub(crate) tokens: Vec<Token>,
    prompt_len: usize,
    pub(crate) block: DraftBlock,
    pub(crate) verification: VerificationState,
    pub(crate) stage: Stage,
    pub(crate) active: bool,
    pub(crate) stats: SpeculationStats,
    cancel: CancelToken,
    next_seq: u64,
}

impl GenerationSession {
    pub fn new(id: SessionId, prompt_tokens: Vec<Token>) -> Self {
        Self {
            id,
            prompt_len: prompt_tokens.len(),
            tokens: prompt_tokens,
            block: DraftBlock::default(),
            verification: VerificationState::default(),
            stage: Stage::Draft,
            active: true,
            stats: SpeculationStats::default(),
            cancel: CancelToken::default(),
            next_seq: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Prompt plus committed tokens.
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    /// Committed tokens after the prompt.
    pub fn generated(&self) -> &[Token] {
        &self.tokens[self.prompt_len..]
    }

    pub fn block(&self) -> &DraftBlock {
        &self.block
    }

    pub fn verification(&self) -> &VerificationState {
        &self.verification
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// False once the session finished, failed, or was cancelled. A paused
    /// session is still active.
    pub fn is_active(&self) -> bool {
        self.active && !self.cancel.is_cancelled()
    }

    pub fn stats(&self) -> SpeculationStats {
        self.stats
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub(crate) fn cancel(&mut self) {
        self.cancel.cancel();
        self.active = false;
    }

    /// Close the current block and go back to drafting.
    pub(crate) fn clear_block(&mut self) {
        self.block.clear();
        self.verification.reset();
        self.stage = Stage::Draft;
    }

    /// Build the next event for this session.
    pub(crate) fn event(&mut self, kind: EventKind) -> Event {
        let seq = self.next_seq;
        self.next_seq += 1;
        Event {
            session_id: self.id,
            seq,
            kind,
        }
    }
}
