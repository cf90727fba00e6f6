//! Request/response bridge to a single embedded SQLite worker.
//!
//! A [`WorkerRuntime`] owns the engine and answers commands one at a time.
//! A [`Controller`] sits on the other side of a [`Link`], tags each command
//! with a fresh [`RequestId`] and resolves the matching caller when the
//! response arrives, in whatever order responses come back.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod link;
pub mod protocol;
pub mod runtime;

pub use client::Controller;
pub use codec::WireCodec;
pub use config::{ClientConfig, WorkerConfig};
pub use error::{ControllerError, ErrorKind, Failure};
pub use lifecycle::{EngineLibrary, SqliteLibrary};
pub use link::{Link, ProcessLink, ThreadLink};
pub use protocol::{Command, Envelope, Reply, RequestId, WorkerMessage};
pub use runtime::{WorkerHandle, WorkerRuntime};
pub use sqlrelay_db::{QueryOutput, ResultSet, Value};
