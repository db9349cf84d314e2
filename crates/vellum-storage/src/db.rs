//! Async facade over the embedded SQLite connection.
//!
//! SQLite statements are cheap but blocking, so every operation runs on
//! the blocking thread pool under a connection mutex. The [`Database`]
//! handle is `Clone` and shared by all stores.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use rusqlite::Connection;
use tracing::info;

use crate::error::{StorageError, StorageResult};
use crate::schema;

/// Shared handle to the embedded database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database file at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened or the
    /// schema cannot be applied.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Open(format!("{}: {e}", parent.display())))?;
            }
            let conn = Connection::open(&path)
                .map_err(|e| StorageError::Open(format!("{}: {e}", path.display())))?;
            schema::init(&conn)?;
            info!(path = %path.display(), "database opened");
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Open an in-memory database (tests and ephemeral deployments).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection cannot be created.
    pub async fn open_memory() -> StorageResult<Self> {
        tokio::task::spawn_blocking(|| {
            let conn = Connection::open_in_memory()
                .map_err(|e| StorageError::Open(format!("in-memory: {e}")))?;
            schema::init(&conn)?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }

    /// Run a closure against the connection on the blocking pool.
    ///
    /// # Errors
    ///
    /// Propagates the closure's error, or [`StorageError::Task`] if the
    /// blocking task is cancelled.
    pub async fn call<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_memory_applies_schema() {
        let db = Database::open_memory().await.unwrap();
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(names)
            })
            .await
            .unwrap();

        for table in ["deltas", "jobs", "queue", "snapshots"] {
            assert!(tables.iter().any(|t| t == table), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/data/vellum.db");
        let _db = Database::open(&path).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vellum.db");
        drop(Database::open(&path).await.unwrap());
        // Second open re-applies the schema without error.
        let _db = Database::open(&path).await.unwrap();
    }
}
