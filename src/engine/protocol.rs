//! Controller protocol.
//!
//! Commands flow from a controller to the engine, events flow back. Both are
//! serde types with a `type` tag, so the same values travel over an
//! in-process channel or as JSON lines.
//!
//! ```json
//! {"type":"start","prompt":"2+2=","sessionId":1}
//! {"type":"stageUpdate","sessionId":1,"seq":3,"stage":"draft","token":" 4"}
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;

/// Identifier correlating a generation run with controller requests.
pub type SessionId = u64;

/// Session id carried by events that belong to no session.
pub const NO_SESSION: SessionId = 0;

/// Controller → engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    /// Begin a new session, cancelling any active one. The new session
    /// starts paused.
    #[serde(rename_all = "camelCase")]
    Start { prompt: String, session_id: SessionId },
    /// Stop the run loop after the current step.
    Pause,
    /// Restart the run loop from the current stage.
    Resume,
    /// Execute exactly one transition.
    Step,
    /// Cancel the active session.
    Stop,
    /// Anything else. Ignored.
    #[serde(other)]
    Unknown,
}

impl Command {
    /// Parse one JSON command.
    pub fn from_json(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// What a `stageUpdate` event shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStage {
    /// A provisional draft token.
    Draft,
    /// A draft token accepted and committed.
    Verify,
    /// A resampled or bonus token committed.
    Sample,
    /// Discarded draft tokens, for display only.
    Reject,
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    /// The worker is up and accepting commands.
    Ready,
    SessionStarted,
    StageUpdate {
        stage: UpdateStage,
        token: String,
    },
    SessionDone,
    SessionError {
        message: String,
    },
    ModelLoadProgress {
        component: String,
        percent: f32,
    },
}

/// Engine → controller.
///
/// `seq` increases monotonically within a session, so a controller can order
/// events and drop stale ones from superseded sessions. Events outside any
/// session carry [`NO_SESSION`] and `seq == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub session_id: SessionId,
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    /// An event that belongs to no session.
    pub fn global(kind: EventKind) -> Self {
        Self {
            session_id: NO_SESSION,
            seq: 0,
            kind,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SessionDone | EventKind::SessionError { .. }
        )
    }
}

/// Where the engine writes events.
pub trait EventSink {
    fn emit(&mut self, event: Event);
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: Event) {
        (**self).emit(event);
    }
}

impl EventSink for Vec<Event> {
    fn emit(&mut self, event: Event) {
        self.push(event);
    }
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn emit(&mut self, event: Event) {
        if self.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}
