//! Typed messages exchanged between the controller and the worker runtime.

use crate::error::Failure;
use serde::{Deserialize, Serialize};
use sqlrelay_db::{QueryOutput, Value};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Correlation id pairing a command with its response.
///
/// The controller hands out non-negative numbers. Foreign hosts may use any
/// scalar; the worker echoes it back unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Signed(i64),
    Float(FloatId),
    Bool(bool),
    Text(String),
}

/// A floating-point id, compared and hashed by its bit pattern.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FloatId(pub f64);

impl PartialEq for FloatId {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatId {}

impl Hash for FloatId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        Self::Number(id)
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        match u64::try_from(id) {
            Ok(id) => Self::Number(id),
            Err(_) => Self::Signed(id),
        }
    }
}

impl From<f64> for RequestId {
    fn from(id: f64) -> Self {
        Self::Float(FloatId(id))
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::Text(id)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(id) => write!(f, "{id}"),
            Self::Signed(id) => write!(f, "{id}"),
            Self::Float(FloatId(id)) => write!(f, "{id}"),
            Self::Bool(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Initialize,
    Execute { sql: String, params: Vec<Value> },
    ExportSnapshot,
    ImportSnapshot { data: Vec<u8> },
}

impl Command {
    pub fn execute(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Execute {
            sql: sql.into(),
            params,
        }
    }

    /// Wire name of the command type.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialize => "init",
            Self::Execute { .. } => "exec",
            Self::ExportSnapshot => "export",
            Self::ImportSnapshot { .. } => "import",
        }
    }
}

/// A command together with its (optional) correlation id.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub id: Option<RequestId>,
    pub command: Command,
}

impl Envelope {
    pub fn new(id: impl Into<RequestId>, command: Command) -> Self {
        Self {
            id: Some(id.into()),
            command,
        }
    }

    pub fn uncorrelated(command: Command) -> Self {
        Self { id: None, command }
    }
}

/// Successful result of a command.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Initialized,
    Rows(QueryOutput),
    Snapshot(Vec<u8>),
    Imported,
}

impl Reply {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "init",
            Self::Rows(_) => "rows",
            Self::Snapshot(_) => "snapshot",
            Self::Imported => "imported",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMessage {
    /// Answer to an execute/export/import command.
    Response {
        id: Option<RequestId>,
        outcome: Result<Reply, Failure>,
    },
    /// Outcome of an initialize pass. Id-less when the worker initialized
    /// itself at startup.
    Init {
        id: Option<RequestId>,
        outcome: Result<(), Failure>,
    },
}

impl WorkerMessage {
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Response { id, .. } | Self::Init { id, .. } => id.as_ref(),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Self::Response { outcome, .. } => outcome.is_ok(),
            Self::Init { outcome, .. } => outcome.is_ok(),
        }
    }
}
