//! The worker runtime: owns one [`EngineSlot`] and answers commands strictly
//! one at a time, in arrival order.

use crate::config::WorkerConfig;
use crate::error::Failure;
use crate::lifecycle::{EngineLibrary, EngineSlot, InitOutcome, SqliteLibrary};
use crate::protocol::{Command, Envelope, Reply, WorkerMessage};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

pub struct WorkerRuntime {
    slot: EngineSlot,
}

/// Channels and thread of a runtime started with [`WorkerRuntime::spawn`].
pub struct WorkerHandle {
    pub commands: Sender<Envelope>,
    pub messages: Receiver<WorkerMessage>,
    pub thread: JoinHandle<()>,
}

impl WorkerRuntime {
    pub fn new(library: impl EngineLibrary + 'static) -> Self {
        Self {
            slot: EngineSlot::new(library),
        }
    }

    pub fn sqlite() -> Self {
        Self::new(SqliteLibrary)
    }

    pub fn is_ready(&self) -> bool {
        self.slot.is_ready()
    }

    /// Warms the engine before any command is read. Produces the id-less
    /// init message.
    pub fn startup(&mut self) -> WorkerMessage {
        self.initialize(None)
    }

    /// Answers one command. Always yields exactly one message.
    pub fn handle(&mut self, envelope: Envelope) -> WorkerMessage {
        let Envelope { id, command } = envelope;
        debug!(id = ?id, command = command.name(), "dispatching command");
        match command {
            Command::Initialize => self.initialize(id),
            command => {
                let outcome = guarded(|| self.dispatch(command));
                if let Err(failure) = &outcome {
                    warn!(id = ?id, kind = %failure.kind, error = %failure.message, "command failed");
                }
                WorkerMessage::Response { id, outcome }
            }
        }
    }

    fn initialize(&mut self, id: Option<crate::protocol::RequestId>) -> WorkerMessage {
        let outcome = guarded(|| self.slot.initialize()).map(|state| {
            if state == InitOutcome::AlreadyReady {
                debug!("engine already initialized");
            }
        });
        WorkerMessage::Init { id, outcome }
    }

    fn dispatch(&mut self, command: Command) -> Result<Reply, Failure> {
        match command {
            Command::Initialize => self.slot.initialize().map(|_| Reply::Initialized),
            Command::Execute { sql, params } => self.slot.execute(&sql, &params).map(Reply::Rows),
            Command::ExportSnapshot => self.slot.export().map(Reply::Snapshot),
            Command::ImportSnapshot { data } => self.slot.import(&data).map(|()| Reply::Imported),
        }
    }

    /// Processes commands until the command channel closes or nobody listens
    /// for messages any more.
    pub fn run(
        mut self,
        commands: Receiver<Envelope>,
        messages: Sender<WorkerMessage>,
        auto_initialize: bool,
    ) {
        if auto_initialize && messages.send(self.startup()).is_err() {
            return;
        }
        while let Ok(envelope) = commands.recv() {
            let message = self.handle(envelope);
            if messages.send(message).is_err() {
                warn!("message channel closed; stopping worker");
                break;
            }
        }
        debug!("worker runtime stopped");
    }

    /// Runs the runtime on its own thread behind bounded queues.
    pub fn spawn(self, config: &WorkerConfig) -> io::Result<WorkerHandle> {
        let (command_tx, command_rx) = bounded::<Envelope>(config.max_queue);
        let (message_tx, message_rx) = bounded::<WorkerMessage>(config.max_queue);
        let auto_initialize = config.auto_initialize;
        let thread = thread::Builder::new()
            .name("sqlrelay-worker".to_string())
            .spawn(move || self.run(command_rx, message_tx, auto_initialize))?;
        Ok(WorkerHandle {
            commands: command_tx,
            messages: message_rx,
            thread,
        })
    }
}

// A panic inside the engine must not cost the caller its response.
fn guarded<T>(f: impl FnOnce() -> Result<T, Failure>) -> Result<T, Failure> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(outcome) => outcome,
        Err(payload) => Err(Failure::new(
            crate::error::ErrorKind::EngineError,
            format!("worker panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return (*msg).to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "unknown panic".to_string()
}
