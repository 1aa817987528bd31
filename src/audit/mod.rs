//! Hash-chained append-only audit log.
//!
//! Every security-relevant event (job transitions, approvals, rejections,
//! sandbox dispatches) is appended as a row whose `entry_hash` is
//! `sha256(previous_hash || canonical_json(entry_without_hashes))`, linking
//! each entry to its predecessor. Tables rotate monthly
//! (`audit_entries_YYYY_MM`); each month starts a fresh chain from the
//! genesis hash. UPDATE and DELETE are blocked by triggers.
//!
//! Appends normally happen on the caller's write transaction so an audit
//! failure rolls back the mutation it describes.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqliteConnection};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{ts_from_sql, ts_to_sql, Store, StoreError};
use crate::types::RiskLevel;

/// Hash of the (absent) entry before the first: 64 zero hex chars.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Audit subsystem errors.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Storage failure. Fatal for the containing transaction.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Storage failure (raw driver error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Entry could not be serialized for hashing.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Chain verification failed at the given entry.
    #[error("audit chain broken at entry {id}: {detail}")]
    ChainBroken {
        id: Uuid,
        detail: String,
    },
}

/// One audit record. `entry_hash` commits to every other field plus the
/// predecessor's hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Acting component or person (`system`, `worker`, `user`, `sentinel`).
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    /// What happened (e.g. `job.transition`, `approval.granted`).
    pub action: String,
    pub risk_level: RiskLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    pub previous_hash: String,
    pub entry_hash: String,
    pub details: serde_json::Value,
}

/// Fields the caller supplies; id, timestamp and hashes are filled on append.
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: String,
    pub actor_id: Option<String>,
    pub action: String,
    pub risk_level: RiskLevel,
    pub target: Option<String>,
    pub job_id: Option<Uuid>,
    pub details: serde_json::Value,
}

impl NewAuditEntry {
    /// System-actor entry for a job lifecycle event.
    pub fn system(action: impl Into<String>, job_id: Uuid) -> Self {
        Self {
            actor: "system".to_owned(),
            actor_id: None,
            action: action.into(),
            risk_level: RiskLevel::Low,
            target: None,
            job_id: Some(job_id),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk_level = risk;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>, actor_id: Option<String>) -> Self {
        self.actor = actor.into();
        self.actor_id = actor_id;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Verification summary for one monthly table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub table: String,
    pub entries: usize,
}

// ── Canonicalization & hashing ──────────────────────────────────

/// Serialize a JSON value with recursively sorted object keys and no
/// insignificant whitespace. Two structurally equal values canonicalize to
/// identical bytes.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn write_value(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                    out.push(':');
                    if let Some(v) = map.get(*key) {
                        write_value(v, out);
                    }
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_value(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }

    let mut out = String::new();
    write_value(value, &mut out);
    out
}

/// `hex(sha256(previous_hash || canonical(entry_without_hashes)))`.
pub fn compute_entry_hash(previous_hash: &str, entry_without_hashes: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_hash.as_bytes());
    hasher.update(canonical_json(entry_without_hashes).as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// The hashable projection of an entry: everything except the two hash
/// fields.
fn hash_payload(entry: &AuditEntry) -> serde_json::Value {
    serde_json::json!({
        "id": entry.id,
        "timestamp": entry.timestamp.to_rfc3339(),
        "actor": entry.actor,
        "actorId": entry.actor_id,
        "action": entry.action,
        "riskLevel": entry.risk_level,
        "target": entry.target,
        "jobId": entry.job_id,
        "details": entry.details,
    })
}

/// Monthly table name for a timestamp, e.g. `audit_entries_2026_08`.
pub fn table_for(ts: DateTime<Utc>) -> String {
    format!("audit_entries_{:04}_{:02}", ts.year(), ts.month())
}

fn table_ddl(table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id            TEXT PRIMARY KEY,
    timestamp     TEXT NOT NULL,
    actor         TEXT NOT NULL,
    actor_id      TEXT,
    action        TEXT NOT NULL,
    risk_level    TEXT NOT NULL,
    target        TEXT,
    job_id        TEXT,
    previous_hash TEXT NOT NULL,
    entry_hash    TEXT NOT NULL,
    details_json  TEXT NOT NULL
);
CREATE TRIGGER IF NOT EXISTS {table}_no_update
    BEFORE UPDATE ON {table}
    BEGIN SELECT RAISE(ABORT, 'audit entries are append-only'); END;
CREATE TRIGGER IF NOT EXISTS {table}_no_delete
    BEFORE DELETE ON {table}
    BEGIN SELECT RAISE(ABORT, 'audit entries are append-only'); END;
"#
    )
}

async fn ensure_table(conn: &mut SqliteConnection, table: &str) -> Result<(), AuditError> {
    sqlx::raw_sql(&table_ddl(table)).execute(conn).await?;
    Ok(())
}

/// Entry hash of the most recent row, or the genesis hash for an empty table.
async fn last_hash(conn: &mut SqliteConnection, table: &str) -> Result<String, AuditError> {
    let sql = format!("SELECT entry_hash FROM {table} ORDER BY id DESC LIMIT 1");
    let row = sqlx::query(&sql).fetch_optional(conn).await?;
    Ok(row
        .map(|r| r.get::<String, _>("entry_hash"))
        .unwrap_or_else(|| GENESIS_HASH.to_owned()))
}

// ── Audit log ───────────────────────────────────────────────────

/// Append-only audit log over monthly-rotated tables.
#[derive(Debug, Clone)]
pub struct AuditLog {
    store: Store,
}

impl AuditLog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Append an entry on its own transaction.
    pub async fn append(&self, new: NewAuditEntry) -> Result<AuditEntry, AuditError> {
        let mut tx = self.store.writer().begin().await?;
        let entry = self.append_on(&mut *tx, new).await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Append an entry on the caller's connection/transaction.
    ///
    /// Used by the pipeline so the audit row commits atomically with the job
    /// mutation it describes; an audit failure rolls the mutation back.
    pub async fn append_on(
        &self,
        conn: &mut SqliteConnection,
        new: NewAuditEntry,
    ) -> Result<AuditEntry, AuditError> {
        let timestamp = Utc::now();
        let table = table_for(timestamp);
        ensure_table(conn, &table).await?;

        let previous_hash = last_hash(conn, &table).await?;

        let mut entry = AuditEntry {
            id: Uuid::now_v7(),
            timestamp,
            actor: new.actor,
            actor_id: new.actor_id,
            action: new.action,
            risk_level: new.risk_level,
            target: new.target,
            job_id: new.job_id,
            previous_hash,
            entry_hash: String::new(),
            details: new.details,
        };
        entry.entry_hash = compute_entry_hash(&entry.previous_hash, &hash_payload(&entry));

        let sql = format!(
            "INSERT INTO {table}
                (id, timestamp, actor, actor_id, action, risk_level, target,
                 job_id, previous_hash, entry_hash, details_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(entry.id.to_string())
            .bind(ts_to_sql(entry.timestamp))
            .bind(&entry.actor)
            .bind(&entry.actor_id)
            .bind(&entry.action)
            .bind(entry.risk_level.to_string())
            .bind(&entry.target)
            .bind(entry.job_id.map(|id| id.to_string()))
            .bind(&entry.previous_hash)
            .bind(&entry.entry_hash)
            .bind(serde_json::to_string(&entry.details)?)
            .execute(conn)
            .await?;

        Ok(entry)
    }

    /// Load a month's entries in chain order.
    pub async fn entries_for(&self, ts: DateTime<Utc>) -> Result<Vec<AuditEntry>, AuditError> {
        let table = table_for(ts);
        {
            let mut conn = self.store.writer().acquire().await?;
            ensure_table(&mut conn, &table).await?;
        }
        let sql = format!(
            "SELECT id, timestamp, actor, actor_id, action, risk_level, target,
                    job_id, previous_hash, entry_hash, details_json
             FROM {table} ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(self.store.reader()).await?;
        rows.into_iter().map(|row| entry_from_row(&row)).collect()
    }

    /// Verify a month's chain: linkage and per-entry hashes.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::ChainBroken`] naming the first bad entry.
    pub async fn verify(&self, ts: DateTime<Utc>) -> Result<ChainReport, AuditError> {
        let entries = self.entries_for(ts).await?;
        let mut expected_previous = GENESIS_HASH.to_owned();
        for entry in &entries {
            if entry.previous_hash != expected_previous {
                return Err(AuditError::ChainBroken {
                    id: entry.id,
                    detail: format!(
                        "previous_hash {} does not match prior entry_hash {}",
                        entry.previous_hash, expected_previous
                    ),
                });
            }
            let recomputed = compute_entry_hash(&entry.previous_hash, &hash_payload(entry));
            if recomputed != entry.entry_hash {
                return Err(AuditError::ChainBroken {
                    id: entry.id,
                    detail: "entry_hash does not match recomputed hash".to_owned(),
                });
            }
            expected_previous = entry.entry_hash.clone();
        }
        Ok(ChainReport {
            table: table_for(ts),
            entries: entries.len(),
        })
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry, AuditError> {
    let id_raw: String = row.get("id");
    let id = Uuid::parse_str(&id_raw)
        .map_err(|e| StoreError::CorruptRow(format!("bad audit id {id_raw:?}: {e}")))?;
    let job_id = row
        .get::<Option<String>, _>("job_id")
        .map(|raw| {
            Uuid::parse_str(&raw)
                .map_err(|e| StoreError::CorruptRow(format!("bad job id {raw:?}: {e}")))
        })
        .transpose()?;
    let risk_raw: String = row.get("risk_level");
    let risk_level: RiskLevel = risk_raw
        .parse()
        .map_err(|_| StoreError::CorruptRow(format!("bad risk level {risk_raw:?}")))?;
    let details_raw: String = row.get("details_json");
    let details = serde_json::from_str(&details_raw)?;
    let ts_raw: String = row.get("timestamp");

    Ok(AuditEntry {
        id,
        timestamp: ts_from_sql(&ts_raw)?,
        actor: row.get("actor"),
        actor_id: row.get("actor_id"),
        action: row.get("action"),
        risk_level,
        target: row.get("target"),
        job_id,
        previous_hash: row.get("previous_hash"),
        entry_hash: row.get("entry_hash"),
        details,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_log() -> AuditLog {
        let store = Store::open_in_memory().await.expect("open store");
        AuditLog::new(store)
    }

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = serde_json::json!({
            "zeta": 1,
            "alpha": {"y": true, "x": [3, {"b": 2, "a": 1}]},
        });
        assert_eq!(
            canonical_json(&value),
            r#"{"alpha":{"x":[3,{"a":1,"b":2}],"y":true},"zeta":1}"#
        );
    }

    #[test]
    fn test_canonical_json_stable_across_orderings() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": 2}"#).expect("parse");
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": 2, "b": 1}"#).expect("parse");
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_hash_is_deterministic_and_chained() {
        let payload = serde_json::json!({"action": "job.created"});
        let h1 = compute_entry_hash(GENESIS_HASH, &payload);
        let h2 = compute_entry_hash(GENESIS_HASH, &payload);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        // A different predecessor changes the hash.
        let h3 = compute_entry_hash(&h1, &payload);
        assert_ne!(h1, h3);
    }

    #[tokio::test]
    async fn test_append_links_chain() {
        let log = test_log().await;
        let job = Uuid::now_v7();

        let first = log
            .append(NewAuditEntry::system("job.created", job))
            .await
            .expect("append 1");
        assert_eq!(first.previous_hash, GENESIS_HASH);

        let second = log
            .append(NewAuditEntry::system("job.transition", job))
            .await
            .expect("append 2");
        assert_eq!(second.previous_hash, first.entry_hash);
    }

    #[tokio::test]
    async fn test_verify_round_trip() {
        let log = test_log().await;
        let job = Uuid::now_v7();
        for action in ["job.created", "job.transition", "job.completed"] {
            log.append(
                NewAuditEntry::system(action, job)
                    .with_details(serde_json::json!({"note": action})),
            )
            .await
            .expect("append");
        }

        let report = log.verify(Utc::now()).await.expect("verify");
        assert_eq!(report.entries, 3);
    }

    #[tokio::test]
    async fn test_verify_empty_month_is_clean() {
        let log = test_log().await;
        let report = log.verify(Utc::now()).await.expect("verify");
        assert_eq!(report.entries, 0);
    }

    #[tokio::test]
    async fn test_update_and_delete_blocked() {
        let log = test_log().await;
        let entry = log
            .append(NewAuditEntry::system("job.created", Uuid::now_v7()))
            .await
            .expect("append");

        let table = table_for(entry.timestamp);
        let update = sqlx::query(&format!(
            "UPDATE {table} SET actor = 'evil' WHERE id = ?"
        ))
        .bind(entry.id.to_string())
        .execute(log.store.writer())
        .await;
        assert!(update.is_err(), "UPDATE must be rejected by trigger");

        let delete = sqlx::query(&format!("DELETE FROM {table} WHERE id = ?"))
            .bind(entry.id.to_string())
            .execute(log.store.writer())
            .await;
        assert!(delete.is_err(), "DELETE must be rejected by trigger");
    }
}
