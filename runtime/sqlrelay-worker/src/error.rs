use crate::protocol::RequestId;
use serde::{Deserialize, Serialize};
use sqlrelay_db::EngineError;
use std::fmt;
use thiserror::Error;

/// Failure taxonomy shared by both sides of the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// A data command arrived before the engine was ready.
    NotInitialized,
    /// The engine library could not be loaded.
    LoadError,
    /// The engine rejected a statement or a snapshot.
    EngineError,
    /// The command type is not part of the protocol.
    UnknownCommand,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotInitialized => "NotInitialized",
            ErrorKind::LoadError => "LoadError",
            ErrorKind::EngineError => "EngineError",
            ErrorKind::UnknownCommand => "UnknownCommand",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed command as reported by the worker.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_initialized() -> Self {
        Self::new(ErrorKind::NotInitialized, "Database not initialized")
    }

    pub fn unknown_command(command_type: &str) -> Self {
        Self::new(
            ErrorKind::UnknownCommand,
            format!("Unknown command type '{command_type}'"),
        )
    }

    pub fn malformed(reason: impl fmt::Display) -> Self {
        Self::new(ErrorKind::UnknownCommand, format!("Malformed command: {reason}"))
    }
}

impl From<EngineError> for Failure {
    fn from(err: EngineError) -> Self {
        let kind = match err {
            EngineError::Load(_) => ErrorKind::LoadError,
            EngineError::Sqlite(_) | EngineError::MalformedSnapshot(_) => ErrorKind::EngineError,
        };
        Self::new(kind, err.to_string())
    }
}

/// Errors surfaced to callers of [`crate::Controller`].
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The worker processed the command and reported a failure.
    #[error("{0}")]
    Worker(#[from] Failure),

    /// The worker side of the channel is gone.
    #[error("worker channel closed")]
    ChannelClosed,

    #[error("request {id} timed out after {millis} ms")]
    Timeout { id: RequestId, millis: u64 },

    /// The worker answered with a reply of the wrong shape.
    #[error("unexpected {reply} reply to {command}")]
    UnexpectedReply {
        command: &'static str,
        reply: &'static str,
    },

    #[error("worker I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ControllerError {
    /// The worker-side failure kind, when there is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ControllerError::Worker(failure) => Some(failure.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_keep_their_kind() {
        let load = Failure::from(EngineError::Load("no sqlite".into()));
        assert_eq!(load.kind, ErrorKind::LoadError);
        assert_eq!(load.message, "no sqlite");

        let snapshot = Failure::from(EngineError::MalformedSnapshot("bad header".into()));
        assert_eq!(snapshot.kind, ErrorKind::EngineError);
        assert!(snapshot.message.contains("bad header"));
    }

    #[test]
    fn controller_error_exposes_worker_kind() {
        let err = ControllerError::from(Failure::not_initialized());
        assert_eq!(err.kind(), Some(ErrorKind::NotInitialized));
        assert_eq!(err.to_string(), "Database not initialized");
        assert_eq!(ControllerError::ChannelClosed.kind(), None);
    }
}
