//! SQLite-backed deduplication index.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{DedupError, DedupIndex, DedupRecord};
use crate::fingerprint::Fingerprint;

const RECORD_COLUMNS: &str =
    "fingerprint, original_job_id, job_id, original_name, usage_count, first_seen_at, last_used_at";

/// SQLite-backed deduplication index.
pub struct SqliteDedupIndex {
    conn: Mutex<Connection>,
}

impl SqliteDedupIndex {
    /// Open (or create) the index at `path`.
    pub fn new(path: &Path) -> Result<Self, DedupError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory index (useful for testing).
    pub fn in_memory() -> Result<Self, DedupError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), DedupError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS dedup_records (
                fingerprint TEXT PRIMARY KEY,
                original_job_id TEXT NOT NULL,
                job_id TEXT NOT NULL,
                original_name TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 1,
                first_seen_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dedup_job_id ON dedup_records(job_id);
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DedupError> {
        self.conn
            .lock()
            .map_err(|_| DedupError::Database("dedup index lock poisoned".to_string()))
    }

    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DedupRecord> {
        Ok(DedupRecord {
            fingerprint: Fingerprint::new_unchecked(row.get::<_, String>(0)?),
            original_job_id: row.get(1)?,
            job_id: row.get(2)?,
            original_name: row.get(3)?,
            usage_count: row.get::<_, i64>(4)? as u64,
            first_seen_at: parse_ts(row, 5)?,
            last_used_at: parse_ts(row, 6)?,
        })
    }

    fn fetch(conn: &Connection, fingerprint: &Fingerprint) -> Result<Option<DedupRecord>, DedupError> {
        conn.query_row(
            &format!(
                "SELECT {} FROM dedup_records WHERE fingerprint = ?",
                RECORD_COLUMNS
            ),
            params![fingerprint.as_str()],
            Self::row_to_record,
        )
        .optional()
        .map_err(db_err)
    }

    /// Run an update and return the record afterwards.
    fn update(
        &self,
        fingerprint: &Fingerprint,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<DedupRecord, DedupError> {
        let conn = self.lock()?;

        let updated = conn.execute(sql, params).map_err(db_err)?;
        if updated == 0 {
            return Err(DedupError::NotFound(fingerprint.to_string()));
        }

        Self::fetch(&conn, fingerprint)?.ok_or_else(|| DedupError::NotFound(fingerprint.to_string()))
    }
}

impl DedupIndex for SqliteDedupIndex {
    fn get(&self, fingerprint: &Fingerprint) -> Result<Option<DedupRecord>, DedupError> {
        let conn = self.lock()?;
        Self::fetch(&conn, fingerprint)
    }

    fn insert(
        &self,
        fingerprint: &Fingerprint,
        job_id: &str,
        original_name: &str,
    ) -> Result<DedupRecord, DedupError> {
        let conn = self.lock()?;
        let now = Utc::now().trunc_subsecs(6);

        let result = conn.execute(
            &format!(
                "INSERT INTO dedup_records ({}) VALUES (?, ?, ?, ?, 1, ?, ?)",
                RECORD_COLUMNS
            ),
            params![
                fingerprint.as_str(),
                job_id,
                job_id,
                original_name,
                ts(&now),
                ts(&now)
            ],
        );

        match result {
            Ok(_) => Ok(DedupRecord {
                fingerprint: fingerprint.clone(),
                original_job_id: job_id.to_string(),
                job_id: job_id.to_string(),
                original_name: original_name.to_string(),
                usage_count: 1,
                first_seen_at: now,
                last_used_at: now,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(DedupError::AlreadyExists(fingerprint.to_string()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    fn point_to(&self, fingerprint: &Fingerprint, job_id: &str) -> Result<DedupRecord, DedupError> {
        let now = ts(&Utc::now());
        self.update(
            fingerprint,
            "UPDATE dedup_records SET job_id = ?, usage_count = usage_count + 1, last_used_at = ? \
             WHERE fingerprint = ?",
            params![job_id, now, fingerprint.as_str()],
        )
    }

    fn record_reuse(&self, fingerprint: &Fingerprint) -> Result<DedupRecord, DedupError> {
        let now = ts(&Utc::now());
        self.update(
            fingerprint,
            "UPDATE dedup_records SET usage_count = usage_count + 1, last_used_at = ? \
             WHERE fingerprint = ?",
            params![now, fingerprint.as_str()],
        )
    }
}

fn db_err(e: rusqlite::Error) -> DedupError {
    DedupError::Database(e.to_string())
}

fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}
