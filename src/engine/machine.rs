//! Generation state machine.
//!
//! Drives speculative decoding one transition at a time:
//!
//! ```text
//!            block < K and not EOT
//!              ┌──────────┐
//!              ▼          │
//!  start ──▶ Draft ───────┘
//!              │ block == K or EOT drafted
//!              ▼
//!           Verify ◀──┐  accepted, more positions left
//!              │──────┘
//!              │ rejected, or every position accepted
//!              ▼
//!           Sample ──▶ Draft   (residual or bonus token committed)
//! ```
//!
//! Every commit is followed by the terminal check: an end-of-turn token or a
//! spent token budget finishes the session. [`GenerationMachine::step`] runs
//! exactly one transition; [`GenerationMachine::run`] loops over it until the
//! session finishes, is cancelled, or a step limit is reached.
//!
//! Each step computes everything fallible first (forward passes, sampling,
//! decoding) and only then mutates the session, so a failed step leaves the
//! committed sequence untouched.

use tracing::{debug, info, warn};

use super::protocol::{Event, EventKind, EventSink, SessionId, UpdateStage};
use super::session::{CancelToken, GenerationSession, Stage};
use crate::backend::{Logits, ModelBackend};
use crate::config::{EngineConfig, SamplingConfig};
use crate::error::{Error, Result};
use crate::probs::{softmax_with_temperature, Distribution};
use crate::speculative::{RejectionSampler, Verdict};
use crate::tokenizer::{ChatTokenizer, ChatTurn};
use crate::Token;

/// Result of one [`GenerationMachine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// No active session; nothing happened.
    Idle,
    /// One transition ran; the session is now in this stage.
    Advanced(Stage),
    /// The transition committed a terminal token and the session is done.
    Finished,
}

/// Owns the generation session and everything needed to advance it.
pub struct GenerationMachine<D, T, K> {
    draft: D,
    target: T,
    tokenizer: K,
    sampler: RejectionSampler,
    config: EngineConfig,
    session: Option<GenerationSession>,
}

impl<D, T, K> GenerationMachine<D, T, K>
where
    D: ModelBackend,
    T: ModelBackend,
    K: ChatTokenizer,
{
    /// Create a machine. The RNG is seeded from `config.sampling.seed` when
    /// present.
    pub fn new(draft: D, target: T, tokenizer: K, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            draft,
            target,
            tokenizer,
            sampler: RejectionSampler::from_config(&config.sampling),
            config,
            session: None,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Current (or last) session.
    pub fn session(&self) -> Option<&GenerationSession> {
        self.session.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(GenerationSession::is_active)
    }

    pub fn draft_backend(&self) -> &D {
        &self.draft
    }

    pub fn target_backend(&self) -> &T {
        &self.target
    }

    /// Start a new session, superseding any active one.
    ///
    /// The session starts paused at [`Stage::Draft`]. Returns its
    /// cancellation token.
    pub fn start<S: EventSink>(
        &mut self,
        prompt: &str,
        session_id: SessionId,
        sink: &mut S,
    ) -> Result<CancelToken> {
        if let Some(previous) = self.session.as_mut() {
            if previous.is_active() {
                info!(
                    session_id = previous.id(),
                    superseded_by = session_id,
                    "cancelling active session"
                );
            }
            previous.cancel();
        }
        self.session = None;

        let mut turns = Vec::with_capacity(2);
        if let Some(system) = &self.config.system_prompt {
            turns.push(ChatTurn::system(system.clone()));
        }
        turns.push(ChatTurn::user(prompt));

        let prompt_tokens = match self.tokenizer.apply_chat_template(&turns) {
            Ok(tokens) if !tokens.is_empty() => tokens,
            Ok(_) => {
                let error = Error::Tokenization("Empty prompt".to_string());
                return Err(reject_start(session_id, error, sink));
            }
            Err(e) => return Err(reject_start(session_id, e, sink)),
        };

        let mut session = GenerationSession::new(session_id, prompt_tokens);
        let token = session.cancel_token();
        sink.emit(session.event(EventKind::SessionStarted));
        info!(
            session_id,
            prompt_tokens = session.prompt_len(),
            lookahead = self.config.speculative.num_speculative_tokens,
            "session started"
        );
        self.session = Some(session);
        Ok(token)
    }

    /// Cancel the active session. Returns whether there was one.
    pub fn stop(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) if session.is_active() => {
                info!(session_id = session.id(), "session stopped");
                session.cancel();
                true
            }
            _ => false,
        }
    }

    /// Execute exactly one state transition.
    ///
    /// Without an active session this is a no-op returning
    /// [`StepOutcome::Idle`], including when the session is cancelled while a
    /// forward pass is in flight. A failing step emits `sessionError`, leaves
    /// the session inactive, and returns the error.
    pub async fn step<S: EventSink>(&mut self, sink: &mut S) -> Result<StepOutcome> {
        let stage = match active(&self.session) {
            Ok(session) => session.stage(),
            Err(e) => {
                debug!(%e, "step ignored");
                return Ok(StepOutcome::Idle);
            }
        };

        let result = match stage {
            Stage::Draft => self.draft_step(sink).await,
            Stage::Verify => self.verify_step(sink).await,
            Stage::Sample => self.sample_step(sink).await,
        };

        match result {
            Err(error) if !error.is_fatal() => {
                debug!(%error, "step abandoned");
                Ok(StepOutcome::Idle)
            }
            Err(error) => {
                self.fail(&error, sink);
                Err(error)
            }
            outcome => outcome,
        }
    }

    /// Step until the session finishes, is cancelled, or `max_steps`
    /// transitions have run. Returns the number of transitions executed.
    pub async fn run<S: EventSink>(
        &mut self,
        sink: &mut S,
        max_steps: Option<usize>,
    ) -> Result<usize> {
        let mut steps = 0;
        while max_steps.map_or(true, |max| steps < max) {
            if !self.is_active() {
                break;
            }
            match self.step(sink).await? {
                StepOutcome::Idle => break,
                StepOutcome::Finished => {
                    steps += 1;
                    break;
                }
                StepOutcome::Advanced(_) => steps += 1,
            }
        }
        Ok(steps)
    }

    async fn draft_step<S: EventSink>(&mut self, sink: &mut S) -> Result<StepOutcome> {
        let input = {
            let session = active(&self.session)?;
            let mut input = session.tokens.clone();
            input.extend_from_slice(session.block.tokens());
            input
        };

        let logits = forward(&mut self.draft, &input).await?;
        let dist = softmax_with_temperature(logits.last(), self.config.sampling.temperature)?;
        let token = self.sampler.sample(&dist);
        let text = self.tokenizer.decode(&[token], true)?;

        let lookahead = self.config.speculative.num_speculative_tokens;
        let eot = self.config.sampling.eot_token_id;
        let session = active_mut(&mut self.session)?;
        session.block.push(token, dist);
        session.stats.drafted += 1;
        if session.block.len() >= lookahead || token == eot {
            session.stage = Stage::Verify;
        }
        debug!(
            session_id = session.id(),
            token,
            block_len = session.block.len(),
            "drafted"
        );
        let stage = session.stage;
        sink.emit(session.event(EventKind::StageUpdate {
            stage: UpdateStage::Draft,
            token: text,
        }));
        Ok(StepOutcome::Advanced(stage))
    }

    async fn verify_step<S: EventSink>(&mut self, sink: &mut S) -> Result<StepOutcome> {
        let temperature = self.config.sampling.temperature;
        let pending = {
            let session = active(&self.session)?;
            if session.block.is_empty() {
                return Err(Error::StateInvariant(
                    "verify with an empty draft block".to_string(),
                ));
            }
            if session.verification.targets().is_none() {
                let mut input = session.tokens.clone();
                input.extend_from_slice(session.block.tokens());
                Some((input, session.tokens.len(), session.block.len()))
            } else {
                None
            }
        };

        // One target pass per block, on the first verify step.
        let computed = match pending {
            Some((input, context_len, k)) => {
                let targets =
                    target_distributions(&mut self.target, &input, context_len, k, temperature)
                        .await?;
                Some(targets)
            }
            None => None,
        };

        let session = active(&self.session)?;
        let targets = computed
            .as_deref()
            .or(session.verification.targets())
            .ok_or_else(|| Error::StateInvariant("missing target distributions".to_string()))?;
        let k = session.block.len();
        let i = session.verification.verify_index();
        if i >= k {
            return Err(Error::StateInvariant(format!(
                "verify cursor {i} past block of {k}"
            )));
        }
        let token = session.block.tokens()[i];
        let p = session
            .block
            .dist(i)
            .ok_or_else(|| Error::StateInvariant(format!("no draft distribution at {i}")))?;
        let q = &targets[i];

        let acceptance = RejectionSampler::acceptance_probability(token, p, q);
        let verdict = self.sampler.accept(token, p, q);
        let text = match verdict {
            Verdict::Accepted => self.tokenizer.decode(&[token], true)?,
            Verdict::Rejected => self.tokenizer.decode(&session.block.tokens()[i..], true)?,
        };

        let session = active_mut(&mut self.session)?;
        if let Some(targets) = computed {
            session.verification.set_targets(targets);
            session.stats.target_passes += 1;
        }
        debug!(
            session_id = session.id(),
            position = i,
            token,
            acceptance,
            accepted = verdict.is_accepted(),
            "verified"
        );

        match verdict {
            Verdict::Accepted => {
                session.tokens.push(token);
                session.verification.advance();
                session.stats.accepted += 1;
                if session.verification.verify_index() == k {
                    session.stage = Stage::Sample;
                }
                sink.emit(session.event(EventKind::StageUpdate {
                    stage: UpdateStage::Verify,
                    token: text,
                }));
                if finish_if_terminal(session, &self.config.sampling, token, sink) {
                    return Ok(StepOutcome::Finished);
                }
                Ok(StepOutcome::Advanced(session.stage))
            }
            Verdict::Rejected => {
                session.stats.rejected += 1;
                session.stage = Stage::Sample;
                sink.emit(session.event(EventKind::StageUpdate {
                    stage: UpdateStage::Reject,
                    token: text,
                }));
                Ok(StepOutcome::Advanced(Stage::Sample))
            }
        }
    }

    async fn sample_step<S: EventSink>(&mut self, sink: &mut S) -> Result<StepOutcome> {
        let session = active(&self.session)?;
        if session.block.is_empty() {
            return Err(Error::StateInvariant(
                "sample with an empty draft block".to_string(),
            ));
        }
        let targets = session
            .verification
            .targets()
            .ok_or_else(|| Error::StateInvariant("sample before verification".to_string()))?;
        let k = session.block.len();
        let i = session.verification.verify_index();
        let q = targets
            .get(i)
            .ok_or_else(|| Error::StateInvariant(format!("no target distribution at {i}")))?;

        // Full acceptance takes the bonus token one past the block; a
        // rejection resamples from the residual at the rejected position.
        let bonus = i == k;
        let token = if bonus {
            self.sampler.sample(q)
        } else {
            let p = session
                .block
                .dist(i)
                .ok_or_else(|| Error::StateInvariant(format!("no draft distribution at {i}")))?;
            self.sampler.resample(q, p)?
        };
        let text = self.tokenizer.decode(&[token], true)?;

        let session = active_mut(&mut self.session)?;
        session.tokens.push(token);
        if bonus {
            session.stats.bonus += 1;
        }
        session.clear_block();
        debug!(session_id = session.id(), token, bonus, "sampled");
        sink.emit(session.event(EventKind::StageUpdate {
            stage: UpdateStage::Sample,
            token: text,
        }));
        if finish_if_terminal(session, &self.config.sampling, token, sink) {
            return Ok(StepOutcome::Finished);
        }
        Ok(StepOutcome::Advanced(Stage::Draft))
    }

    fn fail<S: EventSink>(&mut self, error: &Error, sink: &mut S) {
        if let Some(session) = self.session.as_mut() {
            warn!(session_id = session.id(), %error, "step failed");
            session.active = false;
            sink.emit(session.event(EventKind::SessionError {
                message: error.to_string(),
            }));
        }
    }
}

fn no_session() -> Error {
    Error::Protocol("no active session".to_string())
}

fn active(slot: &Option<GenerationSession>) -> Result<&GenerationSession> {
    slot.as_ref().filter(|s| s.is_active()).ok_or_else(no_session)
}

fn active_mut(slot: &mut Option<GenerationSession>) -> Result<&mut GenerationSession> {
    slot.as_mut().filter(|s| s.is_active()).ok_or_else(no_session)
}

/// Report a start that failed before the session existed.
fn reject_start<S: EventSink>(session_id: SessionId, error: Error, sink: &mut S) -> Error {
    warn!(session_id, %error, "failed to start session");
    sink.emit(Event {
        session_id,
        seq: 0,
        kind: EventKind::SessionError {
            message: error.to_string(),
        },
    });
    error
}

/// One forward pass with an all-ones mask, checked for one row per token.
async fn forward<B: ModelBackend>(backend: &mut B, input: &[Token]) -> Result<Logits> {
    let mask = vec![1u32; input.len()];
    let logits = backend.forward(input, &mask).await?;
    logits.expect_positions(input.len(), backend.name())?;
    Ok(logits)
}

/// Target distributions for a block of `k` draft tokens appended to a
/// context of `context_len` tokens.
///
/// Row `context_len - 1 + t` predicts draft position `t`; the last of the
/// `k + 1` rows is the bonus position.
async fn target_distributions<B: ModelBackend>(
    target: &mut B,
    input: &[Token],
    context_len: usize,
    k: usize,
    temperature: f32,
) -> Result<Vec<Distribution>> {
    if context_len == 0 {
        return Err(Error::StateInvariant(
            "verification needs a non-empty context".to_string(),
        ));
    }
    let logits = forward(target, input).await?;
    (0..=k)
        .map(|t| softmax_with_temperature(logits.position(context_len - 1 + t)?, temperature))
        .collect()
}

/// End the session if `token` ends the turn or the budget is spent.
fn finish_if_terminal<S: EventSink>(
    session: &mut GenerationSession,
    sampling: &SamplingConfig,
    token: Token,
    sink: &mut S,
) -> bool {
    let reason = if token == sampling.eot_token_id {
        "end_of_turn"
    } else if session.generated().len() >= sampling.max_new_tokens {
        "max_tokens"
    } else {
        return false;
    };

    session.active = false;
    session.clear_block();
    let stats = session.stats;
    info!(
        session_id = session.id(),
        reason,
        generated = session.generated().len(),
        drafted = stats.drafted,
        accepted = stats.accepted,
        target_passes = stats.target_passes,
        acceptance_rate = stats.acceptance_rate(),
        "session done"
    );
    sink.emit(session.event(EventKind::SessionDone));
    true
}
