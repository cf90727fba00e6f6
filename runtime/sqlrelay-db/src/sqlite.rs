//! SQLite engine handle for the sqlrelay worker.

use crate::{EngineError, QueryOutput, ResultSet, Value};
use fallible_iterator::FallibleIterator;
use rusqlite::{Batch, Connection, MAIN_DB, Statement, params_from_iter};
use std::io::Cursor;

/// Oldest SQLite release with serialize/deserialize compiled in by default.
pub const MIN_SQLITE_VERSION: i32 = 3_036_000;

/// Checks that the linked SQLite library can back an engine.
pub fn check_library() -> Result<(), EngineError> {
    let found = rusqlite::version_number();
    if found < MIN_SQLITE_VERSION {
        return Err(EngineError::Load(format!(
            "SQLite {} is older than the required 3.36.0",
            rusqlite::version()
        )));
    }
    Ok(())
}

/// Version string of the linked SQLite, e.g. `3.46.0`.
pub fn sqlite_version() -> &'static str {
    rusqlite::version()
}

/// One in-memory database.
pub struct SqliteEngine {
    conn: Connection,
}

impl SqliteEngine {
    /// Opens an in-memory database, seeded from a snapshot when `seed` is
    /// non-empty. A seed that is not a valid database image is rejected.
    pub fn open(seed: Option<&[u8]>) -> Result<Self, EngineError> {
        let mut conn = Connection::open_in_memory()?;
        if let Some(bytes) = seed.filter(|bytes| !bytes.is_empty()) {
            conn.deserialize_read_exact(MAIN_DB, Cursor::new(bytes), bytes.len(), false)
                .map_err(|err| EngineError::MalformedSnapshot(err.to_string()))?;
            verify_image(&conn)?;
        }
        Ok(Self { conn })
    }

    pub fn open_empty() -> Result<Self, EngineError> {
        Self::open(None)
    }

    /// Runs a script of one or more statements.
    ///
    /// `params` bind to the first statement only. Statements run in order and
    /// execution stops at the first failing one; earlier statements stay
    /// applied.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryOutput, EngineError> {
        let mut output = QueryOutput::default();
        let mut batch = Batch::new(&self.conn, sql);
        let mut bound = params;
        while let Some(mut stmt) = batch.next()? {
            if let Some(set) = run_statement(&mut stmt, bound)? {
                output.results.push(set);
            }
            bound = &[];
        }
        output.changes = self.conn.changes() as u64;
        output.last_insert_rowid = self.conn.last_insert_rowid();
        Ok(output)
    }

    /// Serializes the whole main database. A database that has never been
    /// written has no pages and yields an empty image.
    pub fn snapshot(&self) -> Result<Vec<u8>, EngineError> {
        let pages: i64 = self
            .conn
            .query_row("PRAGMA page_count", [], |row| row.get(0))?;
        if pages == 0 {
            return Ok(Vec::new());
        }
        let data = self.conn.serialize(MAIN_DB)?;
        Ok(data.to_vec())
    }

}

fn verify_image(conn: &Connection) -> Result<(), EngineError> {
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|err| EngineError::MalformedSnapshot(err.to_string()))?;
    if verdict != "ok" {
        return Err(EngineError::MalformedSnapshot(verdict));
    }
    Ok(())
}

fn run_statement(
    stmt: &mut Statement<'_>,
    params: &[Value],
) -> Result<Option<ResultSet>, EngineError> {
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();
    let width = columns.len();
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    let mut values = Vec::new();
    // Stepping is what executes the statement, so drain even when there are
    // no columns.
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(width);
        for idx in 0..width {
            record.push(Value::from(row.get_ref(idx)?));
        }
        values.push(record);
    }
    if values.is_empty() {
        return Ok(None);
    }
    Ok(Some(ResultSet { columns, values }))
}
