//! Generation engine.
//!
//! This module contains:
//! - GenerationSession: tokens, draft block, verification cursor
//! - GenerationMachine: the stepped Draft → Verify → Sample state machine
//! - Command/Event protocol and the worker task that serves it

pub mod machine;
pub mod protocol;
pub mod session;
pub mod worker;

pub use machine::{GenerationMachine, StepOutcome};
pub use protocol::{Command, Event, EventKind, EventSink, SessionId, UpdateStage, NO_SESSION};
pub use session::{
    CancelToken, DraftBlock, GenerationSession, SpeculationStats, Stage, VerificationState,
};
pub use worker::{spawn_worker, CommandSender, WorkerHandle};
