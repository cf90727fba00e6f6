use thiserror::Error;

/// Failures raised by the embedded engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The linked SQLite library is unusable.
    #[error("{0}")]
    Load(String),

    /// SQLite rejected a statement or an operation.
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A snapshot blob is not a valid database image.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
}
