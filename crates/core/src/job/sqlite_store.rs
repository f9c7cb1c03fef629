//! SQLite-backed job store implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{CreateJobRequest, Job, JobError, JobFilter, JobMetadata, JobStatus, JobStore, Transition};
use crate::fingerprint::Fingerprint;

const JOB_COLUMNS: &str = "id, fingerprint, status, metadata, attempt_count, max_attempts, \
     submitted_at, started_at, finished_at, heartbeat_at, retry_at, last_error, updated_at";

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Create a new SQLite job store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, JobError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite job store (useful for testing).
    pub fn in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                status TEXT NOT NULL,
                metadata TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                heartbeat_at TEXT,
                retry_at TEXT,
                last_error TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_fingerprint ON jobs(fingerprint);
            CREATE INDEX IF NOT EXISTS idx_jobs_submitted_at ON jobs(submitted_at);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, JobError> {
        self.conn
            .lock()
            .map_err(|_| JobError::Database("job store lock poisoned".to_string()))
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(ref fingerprint) = filter.fingerprint {
            conditions.push("fingerprint = ?");
            params.push(Box::new(fingerprint.as_str().to_string()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status_str: String = row.get(2)?;
        let status = status_str
            .parse::<JobStatus>()
            .map_err(|e| conversion_err(2, e))?;

        let metadata_json: String = row.get(3)?;
        let metadata: JobMetadata =
            serde_json::from_str(&metadata_json).map_err(|e| conversion_err(3, e))?;

        Ok(Job {
            id: row.get(0)?,
            fingerprint: Fingerprint::new_unchecked(row.get::<_, String>(1)?),
            status,
            metadata,
            attempt_count: row.get(4)?,
            max_attempts: row.get(5)?,
            submitted_at: parse_ts(row, 6)?,
            started_at: parse_opt_ts(row, 7)?,
            finished_at: parse_opt_ts(row, 8)?,
            heartbeat_at: parse_opt_ts(row, 9)?,
            retry_at: parse_opt_ts(row, 10)?,
            last_error: row.get(11)?,
            updated_at: parse_ts(row, 12)?,
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<Job>, JobError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_err)
    }

    /// Check a transition against the current row and compute the new row.
    fn apply(current: &Job, transition: &Transition, now: DateTime<Utc>) -> Result<Job, JobError> {
        let reject = |reason: String| JobError::InvalidTransition {
            job_id: current.id.clone(),
            from: current.status,
            to: transition.to,
            reason,
        };

        if current.status.is_terminal() {
            return Err(reject("job is already terminal".to_string()));
        }

        if current.status != transition.from {
            return Err(reject(format!("expected {}", transition.from)));
        }

        if !current.status.can_transition_to(transition.to) {
            return Err(reject("not a permitted transition".to_string()));
        }

        if let Some(attempt) = transition.attempt {
            if attempt != current.attempt_count {
                return Err(reject(format!(
                    "stale report for attempt {} (job is on attempt {})",
                    attempt, current.attempt_count
                )));
            }
        }

        let mut next = current.clone();
        next.status = transition.to;
        next.updated_at = now;
        if transition.last_error.is_some() {
            next.last_error = transition.last_error.clone();
        }

        match transition.to {
            JobStatus::Running => {
                if current.attempt_count >= current.max_attempts {
                    return Err(reject("retry budget exhausted".to_string()));
                }
                next.attempt_count += 1;
                next.started_at = Some(now);
                next.heartbeat_at = Some(now);
                next.retry_at = None;
            }
            JobStatus::Retrying => {
                next.retry_at = transition.retry_at.map(|at| at.trunc_subsecs(6));
            }
            JobStatus::Queued => {
                next.retry_at = None;
            }
            JobStatus::Failed => {
                if current.attempt_count < current.max_attempts {
                    return Err(reject(format!(
                        "{} of {} attempts used",
                        current.attempt_count, current.max_attempts
                    )));
                }
            }
            _ => {}
        }

        if next.status.is_terminal() {
            next.finished_at = Some(now);
            next.retry_at = None;
        }

        Ok(next)
    }
}

impl JobStore for SqliteJobStore {
    fn create(&self, request: CreateJobRequest) -> Result<Job, JobError> {
        let conn = self.lock()?;

        let now = now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            fingerprint: request.fingerprint,
            status: JobStatus::Queued,
            metadata: request.metadata,
            attempt_count: 0,
            max_attempts: request.max_attempts,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            heartbeat_at: None,
            retry_at: None,
            last_error: None,
            updated_at: now,
        };

        let metadata_json =
            serde_json::to_string(&job.metadata).map_err(|e| JobError::Database(e.to_string()))?;

        conn.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                JOB_COLUMNS
            ),
            params![
                job.id,
                job.fingerprint.as_str(),
                job.status.as_str(),
                metadata_json,
                job.attempt_count,
                job.max_attempts,
                ts(&job.submitted_at),
                Option::<String>::None,
                Option::<String>::None,
                Option::<String>::None,
                Option::<String>::None,
                Option::<String>::None,
                ts(&job.updated_at),
            ],
        )
        .map_err(db_err)?;

        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobError> {
        let conn = self.lock()?;
        Self::fetch(&conn, id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let conn = self.lock()?;

        let (where_clause, params) = Self::build_where_clause(filter);
        let order = if filter.oldest_first { "ASC" } else { "DESC" };

        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY submitted_at {order}, rowid {order} LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;

        let mut all_params: Vec<Box<dyn rusqlite::ToSql>> = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));

        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_err)?;

        let mut jobs = Vec::new();
        for row_result in rows {
            jobs.push(row_result.map_err(db_err)?);
        }

        Ok(jobs)
    }

    fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>, JobError> {
        let conn = self.lock()?;

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?;

        let mut counts = HashMap::new();
        for row_result in rows {
            let (status, count) = row_result.map_err(db_err)?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobError::Database(e.to_string()))?;
            counts.insert(status, count as u64);
        }

        Ok(counts)
    }

    fn compare_and_transition(&self, id: &str, transition: Transition) -> Result<Job, JobError> {
        let conn = self.lock()?;

        let current = Self::fetch(&conn, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let next = Self::apply(&current, &transition, now())?;

        // The connection lock already serializes writers; the guard keeps the
        // update honest if the file is shared with another process.
        let updated = conn
            .execute(
                "UPDATE jobs SET status = ?, attempt_count = ?, started_at = ?, finished_at = ?, \
                 heartbeat_at = ?, retry_at = ?, last_error = ?, updated_at = ? \
                 WHERE id = ? AND status = ? AND attempt_count = ?",
                params![
                    next.status.as_str(),
                    next.attempt_count,
                    next.started_at.as_ref().map(ts),
                    next.finished_at.as_ref().map(ts),
                    next.heartbeat_at.as_ref().map(ts),
                    next.retry_at.as_ref().map(ts),
                    next.last_error,
                    ts(&next.updated_at),
                    id,
                    current.status.as_str(),
                    current.attempt_count,
                ],
            )
            .map_err(db_err)?;

        if updated == 0 {
            return Err(JobError::InvalidTransition {
                job_id: id.to_string(),
                from: current.status,
                to: transition.to,
                reason: "concurrent modification".to_string(),
            });
        }

        Ok(next)
    }

    fn record_heartbeat(&self, id: &str, attempt: u32) -> Result<bool, JobError> {
        let conn = self.lock()?;
        let now = ts(&now());

        let updated = conn
            .execute(
                "UPDATE jobs SET heartbeat_at = ?, updated_at = ? \
                 WHERE id = ? AND status = 'running' AND attempt_count = ?",
                params![now, now, id, attempt],
            )
            .map_err(db_err)?;

        Ok(updated > 0)
    }
}

fn db_err(e: rusqlite::Error) -> JobError {
    JobError::Database(e.to_string())
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Current time at the precision the table stores.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so that stored timestamps sort lexicographically.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn parse_opt_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint_bytes;

    fn create_test_store() -> SqliteJobStore {
        SqliteJobStore::in_memory().unwrap()
    }

    fn create_test_request(content: &[u8]) -> CreateJobRequest {
        CreateJobRequest {
            fingerprint: fingerprint_bytes(content),
            metadata: JobMetadata::new("readings.csv").with_size(content.len() as u64),
            max_attempts: 3,
        }
    }

    fn start(store: &SqliteJobStore, id: &str) -> Job {
        store
            .compare_and_transition(id, Transition::new(JobStatus::Queued, JobStatus::Running))
            .unwrap()
    }

    #[test]
    fn test_create_job() {
        let store = create_test_store();
        let job = store.create(create_test_request(b"abc")).unwrap();

        assert!(!job.id.is_empty());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.started_at.is_none());

        let fetched = store.get(&job.id).unwrap().unwrap();
        assert_eq!(fetched, job);
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        assert!(store.get("nonexistent-id").unwrap().is_none());
    }

    #[test]
    fn test_start_increments_attempt() {
        let store = create_test_store();
        let job = store.create(create_test_request(b"abc")).unwrap();

        let running = start(&store, &job.id);
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.attempt_count, 1);
        assert!(running.started_at.is_some());
        assert!(running.heartbeat_at.is_some());

        assert_eq!(store.get(&job.id).unwrap().unwrap(), running);
    }

    #[test]
    fn test_stale_from_rejected() {
        let store = create_test_store();
        let job = store.create(create_test_request(b"abc")).unwrap();
        start(&store, &job.id);

        let result =
            store.compare_and_transition(&job.id, Transition::new(JobStatus::Queued, JobStatus::Running));
        match result {
            Err(JobError::InvalidTransition { from, to, .. }) => {
                assert_eq!(from, JobStatus::Running);
                assert_eq!(to, JobStatus::Running);
            }
            other => panic!("expected InvalidTransition, got {:?}", other),
        }
    }

    #[test]
    fn test_terminal_job_is_frozen() {
        let store = create_test_store();
        let job = store.create(create_test_request(b"abc")).unwrap();
        start(&store, &job.id);

        let done = store
            .compare_and_transition(&job.id, Transition::new(JobStatus::Running, JobStatus::Done))
            .unwrap();
        assert!(done.finished_at.is_some());

        let result = store
            .compare_and_transition(&job.id, Transition::new(JobStatus::Done, JobStatus::Cancelled));
        match result {
            Err(JobError::InvalidTransition { reason, .. }) => {
                assert!(reason.contains("terminal"));
            }
            other => panic!("expected InvalidTransition, got {:?}", other),
        }
        assert_eq!(store.get(&job.id).unwrap().unwrap().status, JobStatus::Done);
    }

    #[test]
    fn test_attempt_guard() {
        let store = create_test_store();
        let job = store.create(create_test_request(b"abc")).unwrap();
        start(&store, &job.id);

        let stale = Transition::new(JobStatus::Running, JobStatus::Done).for_attempt(2);
        assert!(store.compare_and_transition(&job.id, stale).is_err());

        let current = Transition::new(JobStatus::Running, JobStatus::Done).for_attempt(1);
        assert!(store.compare_and_transition(&job.id, current).is_ok());
    }

    #[test]
    fn test_retry_cycle_keeps_error() {
        let store = create_test_store();
        let job = store.create(create_test_request(b"abc")).unwrap();
        start(&store, &job.id);

        let retry_at = Utc::now() + chrono::Duration::seconds(30);
        let retrying = store
            .compare_and_transition(
                &job.id,
                Transition::new(JobStatus::Running, JobStatus::Retrying)
                    .with_error("upstream timeout")
                    .with_retry_at(retry_at),
            )
            .unwrap();
        assert_eq!(retrying.retry_at, Some(retry_at.trunc_subsecs(6)));
        assert_eq!(store.get(&job.id).unwrap().unwrap(), retrying);
        assert_eq!(retrying.last_error.as_deref(), Some("upstream timeout"));

        let queued = store
            .compare_and_transition(&job.id, Transition::new(JobStatus::Retrying, JobStatus::Queued))
            .unwrap();
        assert!(queued.retry_at.is_none());
        assert_eq!(queued.last_error.as_deref(), Some("upstream timeout"));

        let running = start(&store, &job.id);
        assert_eq!(running.attempt_count, 2);
    }

    #[test]
    fn test_failed_requires_exhausted_budget() {
        let store = create_test_store();
        let mut request = create_test_request(b"abc");
        request.max_attempts = 1;
        let job = store.create(request).unwrap();
        start(&store, &job.id);

        let failed = store
            .compare_and_transition(
                &job.id,
                Transition::new(JobStatus::Running, JobStatus::Failed).with_error("boom"),
            )
            .unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempt_count, 1);

        let other = store.create(create_test_request(b"def")).unwrap();
        start(&store, &other.id);
        assert!(store
            .compare_and_transition(&other.id, Transition::new(JobStatus::Running, JobStatus::Failed))
            .is_err());
    }

    #[test]
    fn test_running_blocked_when_budget_spent() {
        let store = create_test_store();
        let mut request = create_test_request(b"abc");
        request.max_attempts = 1;
        let job = store.create(request).unwrap();
        start(&store, &job.id);

        store
            .compare_and_transition(&job.id, Transition::new(JobStatus::Running, JobStatus::Retrying))
            .unwrap();
        store
            .compare_and_transition(&job.id, Transition::new(JobStatus::Retrying, JobStatus::Queued))
            .unwrap();

        let result =
            store.compare_and_transition(&job.id, Transition::new(JobStatus::Queued, JobStatus::Running));
        assert!(matches!(result, Err(JobError::InvalidTransition { .. })));
    }

    #[test]
    fn test_transition_not_found() {
        let store = create_test_store();
        let result = store.compare_and_transition(
            "missing",
            Transition::new(JobStatus::Queued, JobStatus::Cancelled),
        );
        assert!(matches!(result, Err(JobError::NotFound(_))));
    }

    #[test]
    fn test_heartbeat_only_for_current_attempt() {
        let store = create_test_store();
        let job = store.create(create_test_request(b"abc")).unwrap();
        assert!(!store.record_heartbeat(&job.id, 0).unwrap());

        start(&store, &job.id);
        assert!(store.record_heartbeat(&job.id, 1).unwrap());
        assert!(!store.record_heartbeat(&job.id, 2).unwrap());
    }

    #[test]
    fn test_list_filters_and_order() {
        let store = create_test_store();
        let first = store.create(create_test_request(b"a")).unwrap();
        let second = store.create(create_test_request(b"b")).unwrap();
        let third = store.create(create_test_request(b"c")).unwrap();
        start(&store, &second.id);

        let recent = store.list_recent(10).unwrap();
        let ids: Vec<_> = recent.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![third.id.as_str(), second.id.as_str(), first.id.as_str()]);

        let queued = store
            .list(&JobFilter::new().with_status(JobStatus::Queued).oldest_first())
            .unwrap();
        let ids: Vec<_> = queued.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![first.id.as_str(), third.id.as_str()]);

        let by_fp = store.list_by_fingerprint(&fingerprint_bytes(b"b"), 5).unwrap();
        assert_eq!(by_fp.len(), 1);
        assert_eq!(by_fp[0].id, second.id);

        let page = store.list(&JobFilter::new().with_limit(1).with_offset(1)).unwrap();
        assert_eq!(page[0].id, second.id);
    }

    #[test]
    fn test_count_by_status() {
        let store = create_test_store();
        let a = store.create(create_test_request(b"a")).unwrap();
        store.create(create_test_request(b"b")).unwrap();
        start(&store, &a.id);

        let counts = store.count_by_status().unwrap();
        assert_eq!(counts.get(&JobStatus::Queued), Some(&1));
        assert_eq!(counts.get(&JobStatus::Running), Some(&1));
        assert_eq!(counts.get(&JobStatus::Done), None);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");

        let id = {
            let store = SqliteJobStore::new(&path).unwrap();
            let job = store.create(create_test_request(b"abc")).unwrap();
            start(&store, &job.id);
            job.id
        };

        let store = SqliteJobStore::new(&path).unwrap();
        let job = store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.metadata.original_filename, "readings.csv");
    }

    #[test]
    fn test_unknown_stored_status_is_a_database_error() {
        let store = create_test_store();
        let job = store.create(create_test_request(b"abc")).unwrap();
        store
            .lock()
            .unwrap()
            .execute("UPDATE jobs SET status = 'paused' WHERE id = ?1", params![job.id])
            .unwrap();

        let err = store.get(&job.id).unwrap_err();
        assert!(matches!(err, JobError::Database(ref msg) if msg.contains("paused")));
        assert!(matches!(
            store.count_by_status(),
            Err(JobError::Database(ref msg)) if msg.contains("unknown job status: paused")
        ));
    }
}
