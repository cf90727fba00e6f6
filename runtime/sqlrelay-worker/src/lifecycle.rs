//! Engine lifecycle: absent until the first successful initialize, then
//! ready for good. Imports swap the handle without touching readiness.

use crate::error::Failure;
use sqlrelay_db::{EngineError, QueryOutput, SqliteEngine, Value, check_library, sqlite_version};
use tracing::{debug, info, warn};

/// The embedded engine library as seen by the worker.
pub trait EngineLibrary: Send {
    /// Makes the library usable. Not called again once it has succeeded.
    fn load(&mut self) -> Result<(), EngineError>;

    /// Builds a new engine, empty or seeded from a snapshot.
    fn construct(&self, seed: Option<&[u8]>) -> Result<SqliteEngine, EngineError>;
}

/// The bundled SQLite library.
#[derive(Clone, Copy, Debug, Default)]
pub struct SqliteLibrary;

impl EngineLibrary for SqliteLibrary {
    fn load(&mut self) -> Result<(), EngineError> {
        check_library()?;
        debug!(version = sqlite_version(), "sqlite library loaded");
        Ok(())
    }

    fn construct(&self, seed: Option<&[u8]>) -> Result<SqliteEngine, EngineError> {
        SqliteEngine::open(seed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitOutcome {
    Started,
    AlreadyReady,
}

/// Owns the engine handle and the readiness flag.
pub struct EngineSlot {
    library: Box<dyn EngineLibrary>,
    loaded: bool,
    ready: bool,
    engine: Option<SqliteEngine>,
}

impl EngineSlot {
    pub fn new(library: impl EngineLibrary + 'static) -> Self {
        Self {
            library: Box::new(library),
            loaded: false,
            ready: false,
            engine: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Loads the library and creates an empty engine. A no-op once ready;
    /// on failure the slot stays absent and a later call retries.
    pub fn initialize(&mut self) -> Result<InitOutcome, Failure> {
        if self.ready {
            return Ok(InitOutcome::AlreadyReady);
        }
        if !self.loaded {
            self.library.load().map_err(|err| {
                warn!(error = %err, "engine library failed to load");
                Failure::from(EngineError::Load(err.to_string()))
            })?;
            self.loaded = true;
        }
        let engine = self.library.construct(None).map_err(|err| {
            warn!(error = %err, "engine construction failed");
            Failure::from(err)
        })?;
        self.engine = Some(engine);
        self.ready = true;
        info!("engine ready");
        Ok(InitOutcome::Started)
    }

    fn engine(&self) -> Result<&SqliteEngine, Failure> {
        match (&self.engine, self.ready) {
            (Some(engine), true) => Ok(engine),
            _ => Err(Failure::not_initialized()),
        }
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryOutput, Failure> {
        Ok(self.engine()?.execute(sql, params)?)
    }

    pub fn export(&self) -> Result<Vec<u8>, Failure> {
        Ok(self.engine()?.snapshot()?)
    }

    /// Replaces the engine with one built from `data`. The current engine is
    /// only dropped once the new one exists.
    pub fn import(&mut self, data: &[u8]) -> Result<(), Failure> {
        self.engine()?;
        let fresh = self.library.construct(Some(data))?;
        self.engine = Some(fresh);
        info!(bytes = data.len(), "engine replaced from snapshot");
        Ok(())
    }
}
