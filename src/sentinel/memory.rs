//! Sentinel decision memory.
//!
//! User-authored allow/deny decisions for `(action_type, scope)` pairs,
//! persisted in the `decisions` table with optional expiry. A matched allow
//! skips a step's user approval; a matched deny rejects the whole plan.
//!
//! Shell is never memorized: storing a decision for a shell action fails
//! with `ERR_VALIDATION` and inserts nothing.

use chrono::{DateTime, Utc};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::store::{ts_from_sql, ts_to_sql, Store, StoreError};
use crate::types::ActionType;

/// Allow or deny.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustVerdict {
    Allow,
    Deny,
}

impl TrustVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl std::str::FromStr for TrustVerdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(anyhow::anyhow!("unknown trust verdict: {other}")),
        }
    }
}

/// A stored allow/deny decision.
#[derive(Debug, Clone)]
pub struct TrustDecision {
    pub id: Uuid,
    pub action_type: ActionType,
    /// Pattern the step target is matched against: a file path prefix/glob,
    /// a network host or URL prefix, or a financial counterparty.
    pub scope: String,
    pub verdict: TrustVerdict,
    pub job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub conditions: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Decision supplied by the user at approval time.
#[derive(Debug, Clone)]
pub struct NewTrustDecision {
    pub action_type: ActionType,
    pub scope: String,
    pub verdict: TrustVerdict,
    pub job_id: Option<Uuid>,
    /// Time to live; `None` means the decision lasts until removed.
    pub ttl: Option<chrono::Duration>,
    pub conditions: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// A memory lookup hit.
#[derive(Debug, Clone)]
pub struct MemoryMatch {
    pub decision_id: Uuid,
    pub verdict: TrustVerdict,
    pub scope: String,
}

/// Decision memory errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Attempted to memorize a shell action.
    #[error("shell actions are never memorized")]
    ShellNotMemorized,
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Storage failure (raw driver error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl MemoryError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ShellNotMemorized => ErrorCode::ErrValidation,
            Self::Store(_) | Self::Database(_) => ErrorCode::ErrConflict,
        }
    }
}

/// Store-backed decision memory.
#[derive(Debug, Clone)]
pub struct SentinelMemory {
    store: Store,
}

impl SentinelMemory {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Persist a new decision.
    ///
    /// # Errors
    ///
    /// [`MemoryError::ShellNotMemorized`] (code `ERR_VALIDATION`) for shell
    /// action types; nothing is inserted.
    pub async fn store_decision(
        &self,
        new: NewTrustDecision,
    ) -> Result<TrustDecision, MemoryError> {
        if new.action_type.is_shell() {
            return Err(MemoryError::ShellNotMemorized);
        }

        let created_at = Utc::now();
        let decision = TrustDecision {
            id: Uuid::now_v7(),
            action_type: new.action_type,
            scope: new.scope,
            verdict: new.verdict,
            job_id: new.job_id,
            created_at,
            expires_at: new.ttl.and_then(|ttl| created_at.checked_add_signed(ttl)),
            conditions: new.conditions,
            metadata: new.metadata,
        };

        sqlx::query(
            "INSERT INTO decisions
                (id, action_type, scope, verdict, job_id, created_at, expires_at,
                 conditions, metadata_json)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(decision.id.to_string())
        .bind(decision.action_type.as_str())
        .bind(&decision.scope)
        .bind(decision.verdict.as_str())
        .bind(decision.job_id.map(|id| id.to_string()))
        .bind(ts_to_sql(decision.created_at))
        .bind(decision.expires_at.map(ts_to_sql))
        .bind(&decision.conditions)
        .bind(
            decision
                .metadata
                .as_ref()
                .map(|m| m.to_string()),
        )
        .execute(self.store.writer())
        .await?;

        tracing::info!(
            decision_id = %decision.id,
            action_type = %decision.action_type,
            scope = %decision.scope,
            verdict = decision.verdict.as_str(),
            "trust decision stored"
        );

        Ok(decision)
    }

    /// Find a non-expired decision whose action type matches and whose scope
    /// matches the step's target at time `now`.
    ///
    /// Deny matches win over allow matches so a stale broad allow cannot
    /// shadow a narrower deny.
    pub async fn find_match(
        &self,
        action_type: ActionType,
        target: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MemoryMatch>, MemoryError> {
        let rows = sqlx::query_as::<_, DecisionRow>(
            "SELECT id, action_type, scope, verdict, job_id, created_at,
                    expires_at, conditions, metadata_json
             FROM decisions
             WHERE action_type = ?
               AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(action_type.as_str())
        .bind(ts_to_sql(now))
        .fetch_all(self.store.reader())
        .await?;

        let mut allow_hit: Option<MemoryMatch> = None;
        for row in rows {
            let decision = row.into_decision()?;
            if !scope_matches(&decision.scope, target) {
                continue;
            }
            let hit = MemoryMatch {
                decision_id: decision.id,
                verdict: decision.verdict,
                scope: decision.scope,
            };
            match decision.verdict {
                TrustVerdict::Deny => return Ok(Some(hit)),
                TrustVerdict::Allow => allow_hit = allow_hit.or(Some(hit)),
            }
        }
        Ok(allow_hit)
    }

    /// Remove a decision by id. Returns whether a row was deleted.
    pub async fn remove_decision(&self, id: Uuid) -> Result<bool, MemoryError> {
        let result = sqlx::query("DELETE FROM decisions WHERE id = ?")
            .bind(id.to_string())
            .execute(self.store.writer())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete expired decisions; returns the count removed.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, MemoryError> {
        let result = sqlx::query(
            "DELETE FROM decisions WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(ts_to_sql(now))
        .execute(self.store.writer())
        .await?;
        Ok(result.rows_affected())
    }

    /// All stored decisions (for the settings surface).
    pub async fn list(&self) -> Result<Vec<TrustDecision>, MemoryError> {
        let rows = sqlx::query_as::<_, DecisionRow>(
            "SELECT id, action_type, scope, verdict, job_id, created_at,
                    expires_at, conditions, metadata_json
             FROM decisions ORDER BY created_at DESC",
        )
        .fetch_all(self.store.reader())
        .await?;
        rows.into_iter().map(DecisionRow::into_decision).collect()
    }
}

/// Match a stored scope pattern against a step target.
///
/// Supported forms:
/// - exact match;
/// - trailing `*` glob: prefix match on the part before the star;
/// - path prefix: a scope ending in `/` matches any target under it;
/// - bare host: matches a URL target whose host equals the scope.
pub fn scope_matches(scope: &str, target: &str) -> bool {
    if scope == target {
        return true;
    }
    if let Some(prefix) = scope.strip_suffix('*') {
        return target.starts_with(prefix);
    }
    if scope.ends_with('/') && target.starts_with(scope) {
        return true;
    }
    if !scope.contains('/') && !scope.contains(':') {
        if let Ok(url) = Url::parse(target) {
            if url.host_str() == Some(scope) {
                return true;
            }
        }
    }
    false
}

// ── Row mapping ─────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct DecisionRow {
    id: String,
    action_type: String,
    scope: String,
    verdict: String,
    job_id: Option<String>,
    created_at: String,
    expires_at: Option<String>,
    conditions: Option<String>,
    metadata_json: Option<String>,
}

impl DecisionRow {
    fn into_decision(self) -> Result<TrustDecision, MemoryError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::CorruptRow(format!("bad decision id: {e}")))?;
        let action_type: ActionType = self
            .action_type
            .parse()
            .map_err(|_| StoreError::CorruptRow(format!("bad action type {:?}", self.action_type)))?;
        let verdict: TrustVerdict = self
            .verdict
            .parse()
            .map_err(|_| StoreError::CorruptRow(format!("bad verdict {:?}", self.verdict)))?;
        let job_id = self
            .job_id
            .map(|raw| {
                Uuid::parse_str(&raw)
                    .map_err(|e| StoreError::CorruptRow(format!("bad job id: {e}")))
            })
            .transpose()?;
        let metadata = self
            .metadata_json
            .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()?;

        Ok(TrustDecision {
            id,
            action_type,
            scope: self.scope,
            verdict,
            job_id,
            created_at: ts_from_sql(&self.created_at)?,
            expires_at: self.expires_at.as_deref().map(ts_from_sql).transpose()?,
            conditions: self.conditions,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory() -> SentinelMemory {
        let store = Store::open_in_memory().await.expect("open store");
        SentinelMemory::new(store)
    }

    fn allow(action_type: ActionType, scope: &str) -> NewTrustDecision {
        NewTrustDecision {
            action_type,
            scope: scope.to_owned(),
            verdict: TrustVerdict::Allow,
            job_id: None,
            ttl: None,
            conditions: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_store_and_match_path_prefix() {
        let m = memory().await;
        m.store_decision(allow(ActionType::WriteFiles, "/home/user/notes/"))
            .await
            .expect("store");

        let hit = m
            .find_match(ActionType::WriteFiles, "/home/user/notes/today.md", Utc::now())
            .await
            .expect("query");
        assert!(hit.is_some());
        assert_eq!(hit.expect("checked").verdict, TrustVerdict::Allow);

        let miss = m
            .find_match(ActionType::WriteFiles, "/etc/passwd", Utc::now())
            .await
            .expect("query");
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_shell_decision_rejected_and_not_inserted() {
        let m = memory().await;
        let result = m
            .store_decision(NewTrustDecision {
                action_type: ActionType::ShellExecute,
                scope: "ls".to_owned(),
                verdict: TrustVerdict::Allow,
                job_id: None,
                ttl: None,
                conditions: None,
                metadata: None,
            })
            .await;

        let err = result.expect_err("shell must be rejected");
        assert!(matches!(err, MemoryError::ShellNotMemorized));
        assert_eq!(err.code(), ErrorCode::ErrValidation);

        assert!(m.list().await.expect("list").is_empty(), "no row inserted");
    }

    #[tokio::test]
    async fn test_expired_decisions_never_match() {
        let m = memory().await;
        m.store_decision(NewTrustDecision {
            ttl: Some(chrono::Duration::seconds(60)),
            ..allow(ActionType::NetworkGet, "https://api.example.com/*")
        })
        .await
        .expect("store");

        let now = Utc::now();
        let hit = m
            .find_match(ActionType::NetworkGet, "https://api.example.com/v1", now)
            .await
            .expect("query");
        assert!(hit.is_some(), "fresh decision matches");

        let later = now
            .checked_add_signed(chrono::Duration::seconds(120))
            .expect("time");
        let stale = m
            .find_match(ActionType::NetworkGet, "https://api.example.com/v1", later)
            .await
            .expect("query");
        assert!(stale.is_none(), "expired decision must not match");
    }

    #[tokio::test]
    async fn test_deny_wins_over_allow() {
        let m = memory().await;
        m.store_decision(allow(ActionType::SendMessage, "mail:*"))
            .await
            .expect("store allow");
        m.store_decision(NewTrustDecision {
            verdict: TrustVerdict::Deny,
            ..allow(ActionType::SendMessage, "mail:boss@example.com")
        })
        .await
        .expect("store deny");

        let hit = m
            .find_match(ActionType::SendMessage, "mail:boss@example.com", Utc::now())
            .await
            .expect("query")
            .expect("should match");
        assert_eq!(hit.verdict, TrustVerdict::Deny);
    }

    #[tokio::test]
    async fn test_action_type_must_match() {
        let m = memory().await;
        m.store_decision(allow(ActionType::ReadFiles, "/data/"))
            .await
            .expect("store");
        let hit = m
            .find_match(ActionType::WriteFiles, "/data/report.csv", Utc::now())
            .await
            .expect("query");
        assert!(hit.is_none(), "read_files allow must not cover write_files");
    }

    #[tokio::test]
    async fn test_remove_and_prune() {
        let m = memory().await;
        let kept = m
            .store_decision(allow(ActionType::ReadFiles, "/keep/"))
            .await
            .expect("store");
        m.store_decision(NewTrustDecision {
            ttl: Some(chrono::Duration::seconds(-1)),
            ..allow(ActionType::ReadFiles, "/stale/")
        })
        .await
        .expect("store");

        let pruned = m.prune_expired(Utc::now()).await.expect("prune");
        assert_eq!(pruned, 1);

        assert!(m.remove_decision(kept.id).await.expect("remove"));
        assert!(!m.remove_decision(kept.id).await.expect("remove again"));
        assert!(m.list().await.expect("list").is_empty());
    }

    #[test]
    fn test_scope_matching_forms() {
        // Exact.
        assert!(scope_matches("acct:acme-corp", "acct:acme-corp"));
        // Trailing glob.
        assert!(scope_matches("/var/log/*", "/var/log/syslog"));
        assert!(!scope_matches("/var/log/*", "/var/run/x"));
        // Path prefix.
        assert!(scope_matches("/srv/data/", "/srv/data/in/file.bin"));
        // Bare host against URL target.
        assert!(scope_matches(
            "api.example.com",
            "https://api.example.com/v2/items"
        ));
        assert!(!scope_matches(
            "api.example.com",
            "https://evil.example.net/api.example.com"
        ));
    }
}
