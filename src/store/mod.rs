//! SQLite storage for the core.
//!
//! # Write pattern
//!
//! One writer pool with a single connection (all mutations are serialized
//! through it; `synchronous=FULL` so audit appends are durable the moment
//! their transaction commits) and one reader pool (`synchronous=NORMAL`).
//! Every mutation that spans more than one table runs in a transaction on
//! the writer connection. Timestamps are stored as RFC 3339 TEXT.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions,
    SqliteSynchronous,
};
use sqlx::SqlitePool;
use thiserror::Error;

/// Storage-layer errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Filesystem error while preparing the database location.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    /// A stored value could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// Minimum busy timeout the core tolerates under WAL contention.
const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Negative value = KiB of page cache (64 MiB).
const CACHE_SIZE_PRAGMA: &str = "-65536";

/// 256 MiB of mmap'd database pages.
const MMAP_SIZE_PRAGMA: &str = "268435456";

// ── Schema ──────────────────────────────────────────────────────

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    status        TEXT NOT NULL CHECK (status IN (
                      'pending','planning','validating','awaiting_approval',
                      'executing','completed','failed','cancelled')),
    priority      TEXT NOT NULL CHECK (priority IN ('low','normal','high')),
    source_type   TEXT NOT NULL CHECK (source_type IN ('user','schedule','sub_job')),
    worker_id     TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    metadata_json TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_priority ON jobs(status, priority);
CREATE INDEX IF NOT EXISTS idx_jobs_worker ON jobs(worker_id) WHERE worker_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS execution_log (
    execution_id TEXT PRIMARY KEY,
    job_id       TEXT NOT NULL REFERENCES jobs(id),
    step_id      TEXT NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('started','completed','failed')),
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    result_json  TEXT,
    error        TEXT
);

CREATE INDEX IF NOT EXISTS idx_execution_log_job ON execution_log(job_id);

CREATE TABLE IF NOT EXISTS schedules (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    cron_expression   TEXT NOT NULL,
    job_template_json TEXT NOT NULL,
    enabled           INTEGER NOT NULL DEFAULT 1,
    last_run_at       TEXT,
    next_run_at       TEXT,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS decisions (
    id            TEXT PRIMARY KEY,
    action_type   TEXT NOT NULL,
    scope         TEXT NOT NULL,
    verdict       TEXT NOT NULL CHECK (verdict IN ('allow','deny')),
    job_id        TEXT,
    created_at    TEXT NOT NULL,
    expires_at    TEXT,
    conditions    TEXT,
    metadata_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_decisions_action_scope ON decisions(action_type, scope);
CREATE INDEX IF NOT EXISTS idx_decisions_expires ON decisions(expires_at)
    WHERE expires_at IS NOT NULL;
"#;

// ── Store ───────────────────────────────────────────────────────

/// Handle to the core's SQLite database: a single-connection writer pool and
/// a wider reader pool over the same file.
#[derive(Debug, Clone)]
pub struct Store {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the file cannot be opened or the
    /// schema cannot be applied.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let base = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT)
            .auto_vacuum(SqliteAutoVacuum::Incremental)
            .pragma("cache_size", CACHE_SIZE_PRAGMA)
            .pragma("mmap_size", MMAP_SIZE_PRAGMA);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(base.clone().synchronous(SqliteSynchronous::Full))
            .await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(base.synchronous(SqliteSynchronous::Normal))
            .await?;

        let store = Self { writer, reader };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database (tests). Writer and reader share the single
    /// connection so both see the same data.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            writer: pool.clone(),
            reader: pool,
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Apply the schema. Idempotent; every statement is `IF NOT EXISTS`.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.writer).await?;
        Ok(())
    }

    /// Pool carrying the single write connection.
    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    /// Pool for read-only queries.
    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }
}

// ── Timestamp helpers ───────────────────────────────────────────

/// Render a timestamp for TEXT storage.
pub fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

/// Parse a stored timestamp.
///
/// # Errors
///
/// Returns [`StoreError::CorruptRow`] when the text is not RFC 3339.
pub fn ts_from_sql(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_in_memory_and_migrate() {
        let store = Store::open_in_memory().await.expect("open");
        // Migration is idempotent.
        store.migrate().await.expect("second migrate");

        // Schema tables exist.
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN
             ('jobs','execution_log','schedules','decisions')",
        )
        .fetch_one(store.reader())
        .await
        .expect("query");
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_status_check_constraint() {
        let store = Store::open_in_memory().await.expect("open");
        let result = sqlx::query(
            "INSERT INTO jobs (id, status, priority, source_type, created_at, updated_at)
             VALUES ('j1', 'bogus', 'normal', 'user', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
        )
        .execute(store.writer())
        .await;
        assert!(result.is_err(), "invalid status must violate CHECK");
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let now = Utc::now();
        let parsed = ts_from_sql(&ts_to_sql(now)).expect("parse");
        assert_eq!(parsed, now);
    }

    #[test]
    fn test_timestamp_garbage_is_corrupt_row() {
        assert!(matches!(
            ts_from_sql("not-a-time"),
            Err(StoreError::CorruptRow(_))
        ));
    }
}
