//! Embedded SQL handle for SQL-needing callers.
//!
//! Storage backends expose a `SqliteHandle` so gateways that keep relational
//! metadata (the object store) can share the backend's database file. The
//! handle is a cloneable, mutex-guarded connection initialized with the
//! usual write-ahead-log pragmas for on-disk databases.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::{KumoError, Result};

const FILE_PRAGMAS: &str = concat!(
    "PRAGMA journal_mode=WAL;",
    "PRAGMA synchronous=NORMAL;",
    "PRAGMA temp_store=memory;",
);

/// Cloneable handle to an embedded SQL database.
///
/// Statements run while holding the connection mutex; callers keep their
/// closures short. Multi-statement atomicity goes through [`Self::with`]
/// with an explicit transaction inside the closure.
#[derive(Clone)]
pub struct SqliteHandle {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteHandle {
    /// Opens a private `:memory:` database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(KumoError::io)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Opens (creating if needed) a database file, creating parent
    /// directories and applying the WAL pragmas.
    pub fn at_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(KumoError::io)?;
        }
        let conn = Connection::open(&path).map_err(KumoError::io)?;
        conn.execute_batch(FILE_PRAGMAS).map_err(KumoError::io)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(KumoError::from)
    }

    /// Runs a batch of statements, typically table initializers.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with(|conn| conn.execute_batch(sql))
    }

    /// Path of the backing file, or `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
