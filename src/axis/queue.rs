//! Persistent job queue.
//!
//! Jobs are durable rows; claiming one is a single atomic UPDATE that moves
//! `pending -> planning` and assigns the worker in the same statement.
//! Ordering: `high > normal > low`, FIFO (by UUIDv7 id) within a priority.
//! Terminal rows are guarded by status preconditions on every transition.

use chrono::Utc;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::store::{ts_from_sql, ts_to_sql, Store, StoreError};
use crate::types::{
    ExecutionStatus, Job, JobPriority, JobSource, JobStatus,
};

/// Fields for a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub priority: JobPriority,
    pub source: JobSource,
    pub metadata: serde_json::Value,
}

impl NewJob {
    /// A normal-priority user job carrying the request text.
    pub fn user_request(request: impl Into<String>) -> Self {
        Self {
            priority: JobPriority::Normal,
            source: JobSource::User,
            metadata: serde_json::json!({ "request": request.into() }),
        }
    }
}

/// Store-backed queue over the `jobs` and `execution_log` tables.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Store,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Insert a new `pending` job. Ids are UUIDv7, so id order is creation
    /// order.
    pub async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::now_v7(),
            status: JobStatus::Pending,
            priority: new.priority,
            source: new.source,
            worker_id: None,
            created_at: now,
            updated_at: now,
            metadata: new.metadata,
        };

        sqlx::query(
            "INSERT INTO jobs
                (id, status, priority, source_type, worker_id, created_at, updated_at, metadata_json)
             VALUES (?, ?, ?, ?, NULL, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.status.to_string())
        .bind(job.priority.to_string())
        .bind(job.source.to_string())
        .bind(ts_to_sql(job.created_at))
        .bind(ts_to_sql(job.updated_at))
        .bind(job.metadata.to_string())
        .execute(self.store.writer())
        .await?;

        tracing::info!(
            job_id = %job.id,
            priority = %job.priority,
            source = %job.source,
            "job created"
        );
        Ok(job)
    }

    /// Fetch one job.
    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "SELECT id, status, priority, source_type, worker_id, created_at,
                    updated_at, metadata_json
             FROM jobs WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.store.reader())
        .await?;
        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Atomically claim the next `pending` job for a worker.
    ///
    /// The pick and the `pending -> planning` transition happen in one
    /// UPDATE on the write connection, so two workers can never claim the
    /// same job.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs
             SET status = 'planning', worker_id = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM jobs WHERE status = 'pending'
                 ORDER BY CASE priority
                     WHEN 'high' THEN 2
                     WHEN 'normal' THEN 1
                     ELSE 0 END DESC,
                     id ASC
                 LIMIT 1
             )
             RETURNING id, status, priority, source_type, worker_id, created_at,
                       updated_at, metadata_json",
        )
        .bind(worker_id)
        .bind(ts_to_sql(Utc::now()))
        .fetch_optional(self.store.writer())
        .await?;

        row.map(|r| row_to_job(&r)).transpose()
    }

    /// Guarded status transition on the caller's connection.
    ///
    /// Returns `false` when the job is not in `from` (already claimed,
    /// cancelled, or terminal); the row is untouched in that case. The
    /// worker lease is kept only for working statuses.
    pub async fn transition_on(
        &self,
        conn: &mut SqliteConnection,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        worker_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        if from.is_terminal() {
            return Ok(false);
        }
        let lease = if to.is_working() { worker_id } else { None };
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, worker_id = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(to.to_string())
        .bind(lease)
        .bind(ts_to_sql(Utc::now()))
        .bind(job_id.to_string())
        .bind(from.to_string())
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Guarded status transition on its own connection.
    pub async fn transition(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        worker_id: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.store.writer().acquire().await?;
        self.transition_on(&mut conn, job_id, from, to, worker_id)
            .await
    }

    /// Merge keys into the job's metadata object.
    pub async fn merge_metadata(
        &self,
        job_id: Uuid,
        patch: serde_json::Value,
    ) -> Result<(), StoreError> {
        let Some(job) = self.get_job(job_id).await? else {
            return Ok(());
        };
        let mut metadata = job.metadata;
        if let (Some(base), Some(extra)) = (metadata.as_object_mut(), patch.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        sqlx::query("UPDATE jobs SET metadata_json = ?, updated_at = ? WHERE id = ?")
            .bind(metadata.to_string())
            .bind(ts_to_sql(Utc::now()))
            .bind(job_id.to_string())
            .execute(self.store.writer())
            .await?;
        Ok(())
    }

    /// Refresh the worker lease. Returns `false` when the lease was lost
    /// (recovery or cancellation took the job away).
    pub async fn heartbeat(&self, job_id: Uuid, worker_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET updated_at = ? WHERE id = ? AND worker_id = ?",
        )
        .bind(ts_to_sql(Utc::now()))
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(self.store.writer())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Execution log ───────────────────────────────────────────

    /// Append a `started` row for a step; returns the execution id.
    pub async fn log_step_started(
        &self,
        conn: &mut SqliteConnection,
        job_id: Uuid,
        step_id: &str,
    ) -> Result<Uuid, StoreError> {
        let execution_id = Uuid::now_v7();
        sqlx::query(
            "INSERT INTO execution_log (execution_id, job_id, step_id, status, started_at)
             VALUES (?, ?, ?, 'started', ?)",
        )
        .bind(execution_id.to_string())
        .bind(job_id.to_string())
        .bind(step_id)
        .bind(ts_to_sql(Utc::now()))
        .execute(conn)
        .await?;
        Ok(execution_id)
    }

    /// Finish a step row as `completed` or `failed`.
    pub async fn log_step_finished(
        &self,
        conn: &mut SqliteConnection,
        execution_id: Uuid,
        status: ExecutionStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE execution_log SET status = ?, finished_at = ?, result_json = ?, error = ?
             WHERE execution_id = ?",
        )
        .bind(status.to_string())
        .bind(ts_to_sql(Utc::now()))
        .bind(result.map(|r| r.to_string()))
        .bind(error)
        .bind(execution_id.to_string())
        .execute(conn)
        .await?;
        Ok(())
    }
}

/// Map a jobs row into the domain type.
pub(crate) fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, StoreError> {
    let id_raw: String = row.get("id");
    let status_raw: String = row.get("status");
    let priority_raw: String = row.get("priority");
    let source_raw: String = row.get("source_type");
    let created_raw: String = row.get("created_at");
    let updated_raw: String = row.get("updated_at");
    let metadata_raw: String = row.get("metadata_json");

    Ok(Job {
        id: Uuid::parse_str(&id_raw)
            .map_err(|e| StoreError::CorruptRow(format!("bad job id {id_raw:?}: {e}")))?,
        status: status_raw
            .parse()
            .map_err(|_| StoreError::CorruptRow(format!("bad status {status_raw:?}")))?,
        priority: priority_raw
            .parse()
            .map_err(|_| StoreError::CorruptRow(format!("bad priority {priority_raw:?}")))?,
        source: source_raw
            .parse()
            .map_err(|_| StoreError::CorruptRow(format!("bad source {source_raw:?}")))?,
        worker_id: row.get("worker_id"),
        created_at: ts_from_sql(&created_raw)?,
        updated_at: ts_from_sql(&updated_raw)?,
        metadata: serde_json::from_str(&metadata_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue() -> JobQueue {
        let store = Store::open_in_memory().await.expect("open store");
        JobQueue::new(store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let q = queue().await;
        let job = q
            .create_job(NewJob::user_request("summarize inbox"))
            .await
            .expect("create");

        let fetched = q.get_job(job.id).await.expect("get").expect("present");
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.priority, JobPriority::Normal);
        assert_eq!(fetched.metadata["request"], "summarize inbox");
        assert!(fetched.worker_id.is_none());
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_fifo() {
        let q = queue().await;
        let normal_first = q
            .create_job(NewJob::user_request("first normal"))
            .await
            .expect("create");
        let _normal_second = q
            .create_job(NewJob::user_request("second normal"))
            .await
            .expect("create");
        let high = q
            .create_job(NewJob {
                priority: JobPriority::High,
                source: JobSource::User,
                metadata: serde_json::json!({}),
            })
            .await
            .expect("create");

        let first = q.claim_next("worker-1").await.expect("claim").expect("job");
        assert_eq!(first.id, high.id, "high priority claims first");
        assert_eq!(first.status, JobStatus::Planning);
        assert_eq!(first.worker_id.as_deref(), Some("worker-1"));

        let second = q.claim_next("worker-1").await.expect("claim").expect("job");
        assert_eq!(second.id, normal_first.id, "FIFO within a priority");
    }

    #[tokio::test]
    async fn test_claim_empty_queue() {
        let q = queue().await;
        assert!(q.claim_next("worker-1").await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn test_claimed_job_not_claimable_again() {
        let q = queue().await;
        q.create_job(NewJob::user_request("only one"))
            .await
            .expect("create");
        assert!(q.claim_next("worker-1").await.expect("claim").is_some());
        assert!(q.claim_next("worker-2").await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn test_transition_guard() {
        let q = queue().await;
        let job = q
            .create_job(NewJob::user_request("guarded"))
            .await
            .expect("create");

        // Wrong precondition: no-op.
        let moved = q
            .transition(job.id, JobStatus::Executing, JobStatus::Completed, None)
            .await
            .expect("transition");
        assert!(!moved);

        // Correct precondition.
        let moved = q
            .transition(
                job.id,
                JobStatus::Pending,
                JobStatus::Planning,
                Some("worker-1"),
            )
            .await
            .expect("transition");
        assert!(moved);

        let fetched = q.get_job(job.id).await.expect("get").expect("present");
        assert_eq!(fetched.status, JobStatus::Planning);
        assert_eq!(fetched.worker_id.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn test_worker_lease_cleared_on_non_working_status() {
        let q = queue().await;
        let job = q
            .create_job(NewJob::user_request("lease"))
            .await
            .expect("create");
        q.transition(job.id, JobStatus::Pending, JobStatus::Planning, Some("w1"))
            .await
            .expect("transition");
        q.transition(
            job.id,
            JobStatus::Planning,
            JobStatus::AwaitingApproval,
            Some("w1"),
        )
        .await
        .expect("transition");

        let fetched = q.get_job(job.id).await.expect("get").expect("present");
        assert_eq!(fetched.status, JobStatus::AwaitingApproval);
        assert!(
            fetched.worker_id.is_none(),
            "worker_id is non-null iff the status is a working status"
        );
    }

    #[tokio::test]
    async fn test_terminal_jobs_never_mutate() {
        let q = queue().await;
        let job = q
            .create_job(NewJob::user_request("terminal"))
            .await
            .expect("create");
        q.transition(job.id, JobStatus::Pending, JobStatus::Cancelled, None)
            .await
            .expect("transition");

        let moved = q
            .transition(job.id, JobStatus::Cancelled, JobStatus::Pending, None)
            .await
            .expect("transition");
        assert!(!moved, "terminal rows never transition again");

        let fetched = q.get_job(job.id).await.expect("get").expect("present");
        assert_eq!(fetched.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_heartbeat_lease() {
        let q = queue().await;
        let job = q
            .create_job(NewJob::user_request("hb"))
            .await
            .expect("create");
        q.claim_next("worker-1").await.expect("claim");

        assert!(q.heartbeat(job.id, "worker-1").await.expect("heartbeat"));
        assert!(
            !q.heartbeat(job.id, "worker-2").await.expect("heartbeat"),
            "another worker's heartbeat must not refresh the lease"
        );
    }

    #[tokio::test]
    async fn test_merge_metadata() {
        let q = queue().await;
        let job = q
            .create_job(NewJob::user_request("meta"))
            .await
            .expect("create");
        q.merge_metadata(job.id, serde_json::json!({"result": "ok", "steps": 3}))
            .await
            .expect("merge");

        let fetched = q.get_job(job.id).await.expect("get").expect("present");
        assert_eq!(fetched.metadata["request"], "meta");
        assert_eq!(fetched.metadata["result"], "ok");
        assert_eq!(fetched.metadata["steps"], 3);
    }

    #[tokio::test]
    async fn test_execution_log_roundtrip() {
        let q = queue().await;
        let job = q
            .create_job(NewJob::user_request("log"))
            .await
            .expect("create");

        let mut conn = q.store().writer().acquire().await.expect("conn");
        let execution_id = q
            .log_step_started(&mut conn, job.id, "s1")
            .await
            .expect("start");
        q.log_step_finished(
            &mut conn,
            execution_id,
            ExecutionStatus::Completed,
            Some(&serde_json::json!({"n": 1})),
            None,
        )
        .await
        .expect("finish");
        drop(conn);

        let status: String =
            sqlx::query_scalar("SELECT status FROM execution_log WHERE execution_id = ?")
                .bind(execution_id.to_string())
                .fetch_one(q.store().reader())
                .await
                .expect("query");
        assert_eq!(status, "completed");
    }
}
