//! Boot-time recovery.
//!
//! Runs before any worker starts, so every lease present in the store is
//! stale by definition. Interrupted `executing` jobs go back to `pending`;
//! jobs caught mid-pipeline (`planning`, `validating`) also go back to
//! `pending`; `awaiting_approval` is preserved (the user's decision is still
//! wanted); terminal rows are untouched. Execution-log rows left `started`
//! by a reset job are flipped to `failed`.
//!
//! Recovery is idempotent: a second run on the recovered store changes
//! nothing. Per-job errors are logged and do not stop the sweep.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::store::{ts_to_sql, Store, StoreError};

/// What recovery did, for the startup report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Jobs in any non-terminal status at boot.
    pub non_terminal_job_count: usize,
    /// `executing` jobs reset to `pending`.
    pub reset_job_ids: Vec<Uuid>,
    /// `planning`/`validating` jobs reset to `pending`.
    pub stale_pipeline_job_ids: Vec<Uuid>,
    /// `started` execution-log rows flipped to `failed`.
    pub failed_execution_entries: usize,
}

impl RecoverySummary {
    /// True when nothing needed recovering.
    pub fn is_clean(&self) -> bool {
        self.reset_job_ids.is_empty()
            && self.stale_pipeline_job_ids.is_empty()
            && self.failed_execution_entries == 0
    }
}

/// Run the boot-time sweep.
pub async fn recover(store: &Store) -> Result<RecoverySummary, StoreError> {
    let mut summary = RecoverySummary::default();

    let non_terminal: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM jobs
         WHERE status NOT IN ('completed','failed','cancelled')",
    )
    .fetch_one(store.writer())
    .await?;
    summary.non_terminal_job_count = usize::try_from(non_terminal).unwrap_or(0);

    let candidates = sqlx::query(
        "SELECT id, status FROM jobs
         WHERE (status = 'executing' AND worker_id IS NOT NULL)
            OR status IN ('planning', 'validating')
         ORDER BY id ASC",
    )
    .fetch_all(store.writer())
    .await?;

    for row in candidates {
        let id_raw: String = row.get("id");
        let status: String = row.get("status");
        let Ok(job_id) = Uuid::parse_str(&id_raw) else {
            tracing::warn!(id = %id_raw, "recovery: unparseable job id, skipping");
            continue;
        };

        match reset_job(store, job_id).await {
            Ok(flipped) => {
                tracing::info!(%job_id, from = %status, "recovery: job reset to pending");
                summary.failed_execution_entries =
                    summary.failed_execution_entries.saturating_add(flipped);
                if status == "executing" {
                    summary.reset_job_ids.push(job_id);
                } else {
                    summary.stale_pipeline_job_ids.push(job_id);
                }
            }
            Err(e) => {
                // One stuck row must not block the rest of the sweep.
                tracing::warn!(%job_id, error = %e, "recovery: failed to reset job");
            }
        }
    }

    if summary.is_clean() {
        tracing::info!(
            non_terminal = summary.non_terminal_job_count,
            "recovery: store is clean"
        );
    } else {
        tracing::info!(
            non_terminal = summary.non_terminal_job_count,
            reset = summary.reset_job_ids.len(),
            stale_pipeline = summary.stale_pipeline_job_ids.len(),
            failed_entries = summary.failed_execution_entries,
            "recovery complete"
        );
    }

    Ok(summary)
}

/// Reset one job and flip its dangling execution-log rows. Returns how many
/// rows were flipped.
async fn reset_job(store: &Store, job_id: Uuid) -> Result<usize, StoreError> {
    let mut tx = store.writer().begin().await?;

    sqlx::query(
        "UPDATE jobs SET status = 'pending', worker_id = NULL, updated_at = ?
         WHERE id = ?",
    )
    .bind(ts_to_sql(Utc::now()))
    .bind(job_id.to_string())
    .execute(&mut *tx)
    .await?;

    let flipped = sqlx::query(
        "UPDATE execution_log
         SET status = 'failed', finished_at = ?, error = 'interrupted by restart'
         WHERE job_id = ? AND status = 'started'",
    )
    .bind(ts_to_sql(Utc::now()))
    .bind(job_id.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(usize::try_from(flipped.rows_affected()).unwrap_or(0))
}
