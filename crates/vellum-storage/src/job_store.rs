//! Persistent compilation job records and the fingerprint lookup that
//! backs the cache index.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension as _, Row};
use vellum_core::{DocumentKey, JobId, PrincipalId};

use crate::db::Database;
use crate::error::{StorageError, StorageResult};
use crate::records::{JobRecord, JobStatus};

/// Store for [`JobRecord`]s.
#[derive(Debug, Clone)]
pub struct JobStore {
    db: Database,
}

const JOB_COLUMNS: &str = "id, project, doc_name, principal, engine, entry, fingerprint, priority,
     status, created_at, started_at, completed_at, duration_ms, result_key, log_key, error, cached";

impl JobStore {
    /// Create a store over the shared database handle.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persist a new job record.
    ///
    /// # Errors
    ///
    /// Any underlying query error (including id collisions).
    pub async fn insert(&self, job: JobRecord) -> StorageResult<()> {
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (id, project, doc_name, principal, engine, entry, fingerprint,
                                       priority, status, created_at, started_at, completed_at,
                                       duration_ms, result_key, log_key, error, cached)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                    params![
                        job.id.to_string(),
                        job.doc.project,
                        job.doc.name,
                        job.principal.as_str(),
                        job.engine,
                        job.entry,
                        job.fingerprint,
                        job.priority,
                        job.status.as_str(),
                        job.created_at,
                        job.started_at,
                        job.completed_at,
                        job.duration_ms.map(duration_to_db),
                        job.result_key,
                        job.log_key,
                        job.error,
                        i64::from(job.cached),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Rewrite a job's mutable fields (status machine persistence).
    ///
    /// # Errors
    ///
    /// [`StorageError::NotFound`] if the id does not exist; otherwise any
    /// underlying query error.
    pub async fn update(&self, job: JobRecord) -> StorageResult<()> {
        self.db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE jobs SET status = ?2, started_at = ?3, completed_at = ?4,
                                     duration_ms = ?5, result_key = ?6, log_key = ?7,
                                     error = ?8, cached = ?9
                     WHERE id = ?1",
                    params![
                        job.id.to_string(),
                        job.status.as_str(),
                        job.started_at,
                        job.completed_at,
                        job.duration_ms.map(duration_to_db),
                        job.result_key,
                        job.log_key,
                        job.error,
                        i64::from(job.cached),
                    ],
                )?;
                if changed == 0 {
                    return Err(StorageError::NotFound(format!("job {}", job.id)));
                }
                Ok(())
            })
            .await
    }

    /// Fetch one job by id.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn get(&self, id: JobId) -> StorageResult<Option<JobRecord>> {
        let id = id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                    params![id],
                    row_to_job,
                )
                .optional()?
                .transpose()
            })
            .await
    }

    /// Number of non-terminal (queued or running) jobs for `principal`.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn count_active_for(&self, principal: &PrincipalId) -> StorageResult<usize> {
        let principal = principal.as_str().to_owned();
        self.db
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM jobs
                     WHERE principal = ?1 AND status IN ('queued', 'running')",
                    params![principal],
                    |row| row.get(0),
                )?;
                Ok(usize::try_from(n).unwrap_or(0))
            })
            .await
    }

    /// Most recent `completed` job with `fingerprint`, no older than
    /// `max_age` when given. This is the cache index's backing query.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn latest_completed_by_fingerprint(
        &self,
        fingerprint: &str,
        max_age: Option<chrono::Duration>,
    ) -> StorageResult<Option<JobRecord>> {
        let fingerprint = fingerprint.to_owned();
        let floor: Option<DateTime<Utc>> = max_age.map(|age| Utc::now() - age);
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM jobs
                         WHERE fingerprint = ?1 AND status = 'completed'
                               AND (?2 IS NULL OR completed_at >= ?2)
                         ORDER BY created_at DESC LIMIT 1"
                    ),
                    params![fingerprint, floor],
                    row_to_job,
                )
                .optional()?
                .transpose()
            })
            .await
    }

    /// Recent jobs for one project, newest first.
    ///
    /// # Errors
    ///
    /// Any underlying query error.
    pub async fn list_for_project(
        &self,
        project: &str,
        limit: usize,
    ) -> StorageResult<Vec<JobRecord>> {
        let project = project.to_owned();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE project = ?1 ORDER BY created_at DESC LIMIT ?2"
                ))?;
                let rows = stmt.query_map(params![project, limit], row_to_job)?;
                let mut jobs = Vec::new();
                for row in rows {
                    jobs.push(row??);
                }
                Ok(jobs)
            })
            .await
    }
}

/// Durations are `u64` milliseconds in the API, `INTEGER` in SQLite.
#[allow(clippy::cast_possible_wrap)]
fn duration_to_db(ms: u64) -> i64 {
    ms as i64
}

#[allow(clippy::cast_sign_loss)]
fn row_to_job(row: &Row<'_>) -> rusqlite::Result<StorageResult<JobRecord>> {
    let id: String = row.get(0)?;
    let project: String = row.get(1)?;
    let doc_name: String = row.get(2)?;
    let principal: String = row.get(3)?;
    let engine: String = row.get(4)?;
    let entry: String = row.get(5)?;
    let fingerprint: String = row.get(6)?;
    let priority: i64 = row.get(7)?;
    let status: String = row.get(8)?;
    let created_at: DateTime<Utc> = row.get(9)?;
    let started_at: Option<DateTime<Utc>> = row.get(10)?;
    let completed_at: Option<DateTime<Utc>> = row.get(11)?;
    let duration_ms: Option<i64> = row.get(12)?;
    let result_key: Option<String> = row.get(13)?;
    let log_key: Option<String> = row.get(14)?;
    let error: Option<String> = row.get(15)?;
    let cached: i64 = row.get(16)?;

    Ok(build_job(
        id, project, doc_name, principal, engine, entry, fingerprint, priority, status, created_at,
        started_at, completed_at, duration_ms.map(|d| d as u64), result_key, log_key, error,
        cached != 0,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_job(
    id: String,
    project: String,
    doc_name: String,
    principal: String,
    engine: String,
    entry: String,
    fingerprint: String,
    priority: i64,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<u64>,
    result_key: Option<String>,
    log_key: Option<String>,
    error: Option<String>,
    cached: bool,
) -> StorageResult<JobRecord> {
    let id = JobId::parse(&id)
        .map_err(|_| StorageError::Corrupt(format!("bad job id: {id}")))?;
    let doc = DocumentKey::new(project, doc_name)
        .map_err(|_| StorageError::Corrupt(format!("bad document key for job {id}")))?;
    let status = JobStatus::parse(&status)
        .ok_or_else(|| StorageError::Corrupt(format!("bad job status: {status}")))?;

    Ok(JobRecord {
        id,
        doc,
        principal: PrincipalId::new(principal),
        engine,
        entry,
        fingerprint,
        priority,
        status,
        created_at,
        started_at,
        completed_at,
        duration_ms,
        result_key,
        log_key,
        error,
        cached,
    })
}
