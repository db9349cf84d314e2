//! Schema bootstrap.
//!
//! Executed on every open; all statements are idempotent.

use rusqlite::Connection;

use crate::error::StorageResult;

/// The full schema, applied with `IF NOT EXISTS` throughout.
const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS deltas (
    doc_key    TEXT    NOT NULL,
    version    INTEGER NOT NULL,
    payload    BLOB    NOT NULL,
    principal  TEXT    NOT NULL,
    client_id  TEXT    NOT NULL,
    created_at TEXT    NOT NULL,
    byte_size  INTEGER NOT NULL,
    PRIMARY KEY (doc_key, version)
);
CREATE INDEX IF NOT EXISTS deltas_by_age ON deltas (created_at);

CREATE TABLE IF NOT EXISTS snapshots (
    doc_key      TEXT    NOT NULL,
    version      INTEGER NOT NULL,
    snapshot     BLOB    NOT NULL,
    state_vector BLOB    NOT NULL,
    update_count INTEGER NOT NULL,
    created_at   TEXT    NOT NULL,
    PRIMARY KEY (doc_key, version)
);

CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT    PRIMARY KEY,
    project      TEXT    NOT NULL,
    doc_name     TEXT    NOT NULL,
    principal    TEXT    NOT NULL,
    engine       TEXT    NOT NULL,
    entry        TEXT    NOT NULL,
    fingerprint  TEXT    NOT NULL,
    priority     INTEGER NOT NULL DEFAULT 0,
    status       TEXT    NOT NULL,
    created_at   TEXT    NOT NULL,
    started_at   TEXT,
    completed_at TEXT,
    duration_ms  INTEGER,
    result_key   TEXT,
    log_key      TEXT,
    error        TEXT,
    cached       INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS jobs_by_project     ON jobs (project, created_at DESC);
CREATE INDEX IF NOT EXISTS jobs_by_principal   ON jobs (principal, status);
CREATE INDEX IF NOT EXISTS jobs_by_fingerprint ON jobs (fingerprint, status, created_at DESC);

CREATE TABLE IF NOT EXISTS queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id      TEXT    NOT NULL,
    enqueued_at TEXT    NOT NULL,
    claimed_by  TEXT,
    claimed_at  TEXT
);
";

/// Apply the schema and connection pragmas.
///
/// # Errors
///
/// Returns the underlying [`rusqlite::Error`] if any statement fails.
pub fn init(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}
