//! Cron schedule evaluator.
//!
//! Polls the `schedules` table on a fixed interval. Every enabled row whose
//! `next_run_at` has passed creates exactly one job from its template
//! (tagged `source=schedule` with the schedule id in metadata) and advances
//! `last_run_at`/`next_run_at`. One bad row never blocks the batch; an
//! invalid cron expression warns and clears `next_run_at` so the row stops
//! firing until it is repaired.
//!
//! Operator-facing expressions use the familiar 5-field form; a seconds
//! field is prepended before handing them to the `cron` crate.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::Row;
use uuid::Uuid;

use crate::store::{ts_from_sql, ts_to_sql, Store, StoreError};
use crate::types::{JobPriority, JobSource};

use super::queue::{JobQueue, NewJob};

/// One row of the `schedules` table.
#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    pub cron_expression: String,
    pub job_template: serde_json::Value,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Job fields a schedule template may set.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JobTemplate {
    priority: Option<JobPriority>,
    request: Option<String>,
    metadata: serde_json::Value,
}

/// What one evaluation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvalSummary {
    /// Jobs created.
    pub fired: usize,
    /// Rows skipped because of errors (bad cron, bad template, store).
    pub errors: usize,
}

/// Store-backed schedule evaluator.
#[derive(Debug, Clone)]
pub struct ScheduleEvaluator {
    store: Store,
    queue: JobQueue,
    interval: Duration,
}

impl ScheduleEvaluator {
    pub fn new(store: Store, queue: JobQueue, interval: Duration) -> Self {
        Self {
            store,
            queue,
            interval,
        }
    }

    /// Insert a schedule; `next_run_at` is computed from the expression.
    ///
    /// # Errors
    ///
    /// An unparseable cron expression is refused here (rows created through
    /// other paths are tolerated at evaluation time instead).
    pub async fn create_schedule(
        &self,
        name: &str,
        cron_expression: &str,
        job_template: serde_json::Value,
    ) -> Result<Schedule, StoreError> {
        let parsed = parse_cron(cron_expression).map_err(|e| {
            StoreError::CorruptRow(format!("invalid cron {cron_expression:?}: {e}"))
        })?;
        let now = Utc::now();
        let schedule = Schedule {
            id: Uuid::now_v7(),
            name: name.to_owned(),
            cron_expression: cron_expression.to_owned(),
            job_template,
            enabled: true,
            last_run_at: None,
            next_run_at: next_after(&parsed, now),
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO schedules
                (id, name, cron_expression, job_template_json, enabled,
                 last_run_at, next_run_at, created_at)
             VALUES (?, ?, ?, ?, 1, NULL, ?, ?)",
        )
        .bind(schedule.id.to_string())
        .bind(&schedule.name)
        .bind(&schedule.cron_expression)
        .bind(schedule.job_template.to_string())
        .bind(schedule.next_run_at.map(ts_to_sql))
        .bind(ts_to_sql(schedule.created_at))
        .execute(self.store.writer())
        .await?;

        Ok(schedule)
    }

    /// Run one evaluation pass at `now`.
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> Result<EvalSummary, StoreError> {
        let due = sqlx::query(
            "SELECT id, name, cron_expression, job_template_json
             FROM schedules
             WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?
             ORDER BY id ASC",
        )
        .bind(ts_to_sql(now))
        .fetch_all(self.store.writer())
        .await?;

        let mut summary = EvalSummary::default();
        for row in due {
            let id_raw: String = row.get("id");
            let name: String = row.get("name");
            let expression: String = row.get("cron_expression");
            let template_raw: String = row.get("job_template_json");

            match self
                .fire_row(&id_raw, &name, &expression, &template_raw, now)
                .await
            {
                Ok(()) => summary.fired = summary.fired.saturating_add(1),
                Err(e) => {
                    tracing::warn!(schedule = %name, error = %e, "schedule row failed");
                    summary.errors = summary.errors.saturating_add(1);
                }
            }
        }
        Ok(summary)
    }

    /// Fire one due row: create its job, then advance the row.
    async fn fire_row(
        &self,
        id_raw: &str,
        name: &str,
        expression: &str,
        template_raw: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let parsed = match parse_cron(expression) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    schedule = %name,
                    cron = %expression,
                    error = %e,
                    "invalid cron expression; disarming schedule"
                );
                sqlx::query("UPDATE schedules SET next_run_at = NULL WHERE id = ?")
                    .bind(id_raw)
                    .execute(self.store.writer())
                    .await?;
                return Err(StoreError::CorruptRow(format!(
                    "invalid cron expression: {expression}"
                )));
            }
        };

        let template: JobTemplate = serde_json::from_str(template_raw)?;
        let mut metadata = if template.metadata.is_object() {
            template.metadata
        } else {
            serde_json::json!({})
        };
        if let Some(map) = metadata.as_object_mut() {
            map.insert("scheduleId".to_owned(), serde_json::json!(id_raw));
            if let Some(request) = &template.request {
                map.insert("request".to_owned(), serde_json::json!(request));
            }
        }

        let job = self
            .queue
            .create_job(NewJob {
                priority: template.priority.unwrap_or(JobPriority::Normal),
                source: JobSource::Schedule,
                metadata,
            })
            .await?;

        sqlx::query("UPDATE schedules SET last_run_at = ?, next_run_at = ? WHERE id = ?")
            .bind(ts_to_sql(now))
            .bind(next_after(&parsed, now).map(ts_to_sql))
            .bind(id_raw)
            .execute(self.store.writer())
            .await?;

        tracing::info!(schedule = %name, job_id = %job.id, "schedule fired");
        Ok(())
    }

    /// Poll loop; exits when `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.evaluate_at(Utc::now()).await {
                        tracing::warn!(error = %e, "schedule evaluation pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("schedule evaluator stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Fetch one schedule row (tests, settings surface).
    pub async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, cron_expression, job_template_json, enabled,
                    last_run_at, next_run_at, created_at
             FROM schedules WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(self.store.reader())
        .await?;

        row.map(|r| {
            let id_raw: String = r.get("id");
            let template_raw: String = r.get("job_template_json");
            let created_raw: String = r.get("created_at");
            Ok(Schedule {
                id: Uuid::parse_str(&id_raw)
                    .map_err(|e| StoreError::CorruptRow(format!("bad schedule id: {e}")))?,
                name: r.get("name"),
                cron_expression: r.get("cron_expression"),
                job_template: serde_json::from_str(&template_raw)?,
                enabled: r.get::<i64, _>("enabled") != 0,
                last_run_at: r
                    .get::<Option<String>, _>("last_run_at")
                    .as_deref()
                    .map(ts_from_sql)
                    .transpose()?,
                next_run_at: r
                    .get::<Option<String>, _>("next_run_at")
                    .as_deref()
                    .map(ts_from_sql)
                    .transpose()?,
                created_at: ts_from_sql(&created_raw)?,
            })
        })
        .transpose()
    }
}

/// Parse a cron expression, accepting the 5-field operator form by
/// prepending a seconds field.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule, cron::error::Error> {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        cron::Schedule::from_str(&format!("0 {expression}"))
    } else {
        cron::Schedule::from_str(expression)
    }
}

/// Next fire time strictly after `now`.
pub fn next_after(schedule: &cron::Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;

    async fn evaluator() -> ScheduleEvaluator {
        let store = Store::open_in_memory().await.expect("open");
        let queue = JobQueue::new(store.clone());
        ScheduleEvaluator::new(store, queue, Duration::from_secs(30))
    }

    #[test]
    fn test_parse_cron_five_and_six_fields() {
        assert!(parse_cron("*/5 * * * *").is_ok(), "5-field form accepted");
        assert!(parse_cron("0 */5 * * * *").is_ok(), "6-field form accepted");
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_next_after_advances() {
        let schedule = parse_cron("*/5 * * * *").expect("parse");
        let now = Utc::now();
        let next = next_after(&schedule, now).expect("next");
        assert!(next > now);
    }

    #[tokio::test]
    async fn test_due_schedule_fires_once() {
        let ev = evaluator().await;
        let schedule = ev
            .create_schedule(
                "inbox-sweep",
                "*/5 * * * *",
                serde_json::json!({"request": "sweep the inbox"}),
            )
            .await
            .expect("create");

        // Force the row due: next_run_at one second in the past.
        let now = Utc::now();
        let due_at = now - chrono::Duration::seconds(1);
        sqlx::query("UPDATE schedules SET next_run_at = ? WHERE id = ?")
            .bind(ts_to_sql(due_at))
            .bind(schedule.id.to_string())
            .execute(ev.store.writer())
            .await
            .expect("update");

        let summary = ev.evaluate_at(now).await.expect("evaluate");
        assert_eq!(summary, EvalSummary { fired: 1, errors: 0 });

        // Exactly one schedule-sourced job with the schedule id in metadata.
        let job = ev
            .queue
            .claim_next("w1")
            .await
            .expect("claim")
            .expect("job present");
        assert_eq!(job.source, JobSource::Schedule);
        assert_eq!(job.metadata["scheduleId"], schedule.id.to_string());
        assert_eq!(job.metadata["request"], "sweep the inbox");
        assert!(ev.queue.claim_next("w1").await.expect("claim").is_none());

        // Row advanced.
        let row = ev
            .get_schedule(schedule.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(row.last_run_at, Some(now));
        assert!(row.next_run_at.expect("armed") > now);
    }

    #[tokio::test]
    async fn test_not_due_schedule_does_not_fire() {
        let ev = evaluator().await;
        ev.create_schedule("later", "*/5 * * * *", serde_json::json!({}))
            .await
            .expect("create");

        let summary = ev.evaluate_at(Utc::now()).await.expect("evaluate");
        assert_eq!(summary.fired, 0);
        assert!(ev.queue.claim_next("w1").await.expect("claim").is_none());
    }

    #[tokio::test]
    async fn test_invalid_cron_disarms_row_and_continues() {
        let ev = evaluator().await;
        let now = Utc::now();

        // A corrupt row written by hand, plus a healthy one.
        sqlx::query(
            "INSERT INTO schedules (id, name, cron_expression, job_template_json,
                                    enabled, next_run_at, created_at)
             VALUES ('bad-row', 'broken', 'not a cron', '{}', 1, ?, ?)",
        )
        .bind(ts_to_sql(now - chrono::Duration::seconds(5)))
        .bind(ts_to_sql(now))
        .execute(ev.store.writer())
        .await
        .expect("seed");

        let good = ev
            .create_schedule("healthy", "*/5 * * * *", serde_json::json!({}))
            .await
            .expect("create");
        sqlx::query("UPDATE schedules SET next_run_at = ? WHERE id = ?")
            .bind(ts_to_sql(now - chrono::Duration::seconds(5)))
            .bind(good.id.to_string())
            .execute(ev.store.writer())
            .await
            .expect("update");

        let summary = ev.evaluate_at(now).await.expect("evaluate");
        assert_eq!(summary.fired, 1, "healthy row fires despite the broken one");
        assert_eq!(summary.errors, 1);

        // The broken row is disarmed.
        let next: Option<String> =
            sqlx::query_scalar("SELECT next_run_at FROM schedules WHERE id = 'bad-row'")
                .fetch_one(ev.store.reader())
                .await
                .expect("query");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_disabled_schedule_ignored() {
        let ev = evaluator().await;
        let now = Utc::now();
        let schedule = ev
            .create_schedule("paused", "*/5 * * * *", serde_json::json!({}))
            .await
            .expect("create");
        sqlx::query("UPDATE schedules SET enabled = 0, next_run_at = ? WHERE id = ?")
            .bind(ts_to_sql(now - chrono::Duration::seconds(5)))
            .bind(schedule.id.to_string())
            .execute(ev.store.writer())
            .await
            .expect("update");

        let summary = ev.evaluate_at(now).await.expect("evaluate");
        assert_eq!(summary.fired, 0);
    }

    #[tokio::test]
    async fn test_template_priority_respected() {
        let ev = evaluator().await;
        let now = Utc::now();
        let schedule = ev
            .create_schedule(
                "urgent",
                "*/5 * * * *",
                serde_json::json!({"priority": "high", "request": "rotate logs"}),
            )
            .await
            .expect("create");
        sqlx::query("UPDATE schedules SET next_run_at = ? WHERE id = ?")
            .bind(ts_to_sql(now - chrono::Duration::seconds(1)))
            .bind(schedule.id.to_string())
            .execute(ev.store.writer())
            .await
            .expect("update");

        ev.evaluate_at(now).await.expect("evaluate");
        let job = ev
            .queue
            .claim_next("w1")
            .await
            .expect("claim")
            .expect("job");
        assert_eq!(job.priority, crate::types::JobPriority::High);
        assert_eq!(job.status, JobStatus::Planning);
    }
}
