//! Embedded SQLite engine for the sqlrelay worker.
//!
//! The worker owns exactly one [`SqliteEngine`] at a time. Everything here is
//! synchronous and single-owner; sequencing and messaging live in
//! `sqlrelay-worker`.

mod error;
mod sqlite;
mod value;

pub use error::EngineError;
pub use sqlite::{MIN_SQLITE_VERSION, SqliteEngine, check_library, sqlite_version};
pub use value::{QueryOutput, ResultSet, Value};
