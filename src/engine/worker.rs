//! Engine worker.
//!
//! Runs a [`GenerationMachine`] on its own tokio task. The controller talks
//! to it through a [`CommandSender`] and reads events from a channel:
//!
//! ```text
//! controller ──Command──▶ ┌────────────────────────┐
//!                         │ worker_loop            │
//!                         │  drain commands        │
//!                         │  running? step() once  │
//!                         │  idle?    wait command │
//!                         └────────────────────────┘ ──Event──▶ controller
//! ```
//!
//! Commands are only applied between steps, so a pause or a superseding
//! start takes effect once the in-flight forward pass has resolved.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::debug;

use super::machine::GenerationMachine;
use super::protocol::{Command, Event, EventKind, EventSink, SessionId};
use crate::backend::ModelBackend;
use crate::error::{Error, Result};
use crate::tokenizer::ChatTokenizer;

/// Cloneable sending half of the command channel.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    pub fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| Error::Protocol("engine worker has shut down".to_string()))
    }

    pub fn start(&self, prompt: impl Into<String>, session_id: SessionId) -> Result<()> {
        self.send(Command::Start {
            prompt: prompt.into(),
            session_id,
        })
    }

    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn step(&self) -> Result<()> {
        self.send(Command::Step)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle {
    commands: CommandSender,
    events: mpsc::UnboundedReceiver<Event>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn commands(&self) -> &CommandSender {
        &self.commands
    }

    /// Next event, or `None` once the worker has exited.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn into_parts(self) -> (CommandSender, mpsc::UnboundedReceiver<Event>, JoinHandle<()>) {
        (self.commands, self.events, self.task)
    }

    /// Close the command channel and wait for the worker to exit.
    pub async fn shutdown(self) -> Result<()> {
        let Self { commands, events, task } = self;
        drop(commands);
        drop(events);
        task.await
            .map_err(|e| Error::Protocol(format!("engine worker failed: {e}")))
    }
}

/// Spawn a worker for `machine` on the current tokio runtime.
pub fn spawn_worker<D, T, K>(machine: GenerationMachine<D, T, K>) -> WorkerHandle
where
    D: ModelBackend + 'static,
    T: ModelBackend + 'static,
    K: ChatTokenizer + 'static,
{
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(worker_loop(machine, command_rx, event_tx));
    WorkerHandle {
        commands: CommandSender { tx: command_tx },
        events: event_rx,
        task,
    }
}

async fn worker_loop<D, T, K>(
    mut machine: GenerationMachine<D, T, K>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedSender<Event>,
) where
    D: ModelBackend,
    T: ModelBackend,
    K: ChatTokenizer,
{
    events.emit(Event::global(EventKind::Ready));
    let mut running = false;

    loop {
        // Phase 1: apply every pending command
        loop {
            match commands.try_recv() {
                Ok(command) => handle_command(&mut machine, command, &mut running, &mut events).await,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("command channel closed, worker exiting");
                    return;
                }
            }
        }

        // Phase 2: one transition of the run loop
        if running && machine.is_active() {
            if let Err(error) = machine.step(&mut events).await {
                debug!(%error, "run loop stopped");
            }
            if !machine.is_active() {
                running = false;
            }
            tokio::task::yield_now().await;
            continue;
        }
        running = false;

        // Phase 3: idle or paused, wait for the controller
        match commands.recv().await {
            Some(command) => handle_command(&mut machine, command, &mut running, &mut events).await,
            None => {
                debug!("command channel closed, worker exiting");
                return;
            }
        }
    }
}

async fn handle_command<D, T, K>(
    machine: &mut GenerationMachine<D, T, K>,
    command: Command,
    running: &mut bool,
    events: &mut mpsc::UnboundedSender<Event>,
) where
    D: ModelBackend,
    T: ModelBackend,
    K: ChatTokenizer,
{
    debug!(?command, "command");
    match command {
        Command::Start { prompt, session_id } => {
            *running = false;
            if let Err(error) = machine.start(&prompt, session_id, events) {
                debug!(session_id, %error, "start rejected");
            }
        }
        Command::Pause => {
            if !machine.is_active() {
                debug!("pause without an active session");
            }
            *running = false;
        }
        Command::Resume => {
            if machine.is_active() {
                *running = true;
            } else {
                debug!("resume without an active session");
            }
        }
        Command::Step => {
            if let Err(error) = machine.step(events).await {
                debug!(%error, "single step failed");
            }
        }
        Command::Stop => {
            machine.stop();
            *running = false;
        }
        Command::Unknown => debug!("ignoring unknown command"),
    }
}
