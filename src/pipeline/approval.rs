//! Approval broker: the human-in-the-loop boundary.
//!
//! The orchestrator submits an [`ApprovalRequest`] and receives a
//! `tokio::sync::oneshot` receiver to await the decision. The surface that
//! talks to the user (UI, chat transport) resolves requests by id; requests
//! that outlive their timeout are auto-denied by the periodic
//! `cleanup_expired` sweep.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::sentinel::{ApprovalRequest, SentinelError, UserApproval, UserDecision};

/// Broker errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending request with this id.
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
}

struct PendingEntry {
    request: ApprovalRequest,
    sender: oneshot::Sender<UserDecision>,
    created_at: DateTime<Utc>,
    timeout: Duration,
}

// Manual Debug impl because oneshot::Sender does not implement Debug.
impl std::fmt::Debug for PendingEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingEntry")
            .field("request", &self.request.id)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Pending approval requests keyed by request id.
#[derive(Debug)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    default_timeout: Duration,
}

impl ApprovalBroker {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    /// Submit a request; the receiver yields the decision once resolved.
    pub async fn submit(&self, request: ApprovalRequest) -> oneshot::Receiver<UserDecision> {
        let (tx, rx) = oneshot::channel();
        let id = request.id;

        info!(
            approval_id = %id,
            job_id = %request.job_id,
            steps = request.steps.len(),
            "approval request submitted"
        );

        self.pending.lock().await.insert(
            id,
            PendingEntry {
                request,
                sender: tx,
                created_at: Utc::now(),
                timeout: self.default_timeout,
            },
        );

        rx
    }

    /// Resolve a pending request with the user's decision.
    ///
    /// If the receiver has already been dropped (job cancelled), the send is
    /// silently ignored.
    pub async fn resolve(
        &self,
        approval_id: Uuid,
        decision: UserDecision,
    ) -> Result<(), ApprovalError> {
        let entry = self
            .pending
            .lock()
            .await
            .remove(&approval_id)
            .ok_or(ApprovalError::NotFound(approval_id))?;

        info!(
            approval_id = %approval_id,
            job_id = %entry.request.job_id,
            approved = decision.approved,
            "approval resolved"
        );

        let _send_result = entry.sender.send(decision);
        Ok(())
    }

    /// Retrieve a pending request by id (for rendering to the user).
    pub async fn get_pending(&self, approval_id: Uuid) -> Option<ApprovalRequest> {
        self.pending
            .lock()
            .await
            .get(&approval_id)
            .map(|e| e.request.clone())
    }

    /// All pending requests (status display).
    pub async fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.pending
            .lock()
            .await
            .values()
            .map(|e| e.request.clone())
            .collect()
    }

    /// Number of requests awaiting a decision.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Auto-deny requests past their timeout; returns how many were swept.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut pending = self.pending.lock().await;

        let expired: Vec<Uuid> = pending
            .iter()
            .filter(|(_, e)| is_expired(e, now))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(entry) = pending.remove(id) {
                warn!(
                    approval_id = %id,
                    job_id = %entry.request.job_id,
                    "approval request timed out; auto-denied"
                );
                let _send_result = entry.sender.send(UserDecision {
                    approved: false,
                    trust_grants: Vec::new(),
                });
            }
        }
        expired.len()
    }
}

#[async_trait::async_trait]
impl UserApproval for ApprovalBroker {
    async fn request(&self, request: ApprovalRequest) -> Result<UserDecision, SentinelError> {
        let rx = self.submit(request).await;
        rx.await.map_err(|_| SentinelError::ApprovalChannelClosed)
    }
}

fn is_expired(entry: &PendingEntry, now: DateTime<Utc>) -> bool {
    let elapsed = now.signed_duration_since(entry.created_at);
    let timeout = chrono::TimeDelta::from_std(entry.timeout)
        .unwrap_or_else(|_| chrono::TimeDelta::seconds(300));
    elapsed > timeout
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ApprovalRequest {
        ApprovalRequest {
            id: Uuid::now_v7(),
            job_id: Uuid::now_v7(),
            plan_id: Uuid::now_v7(),
            summary: "1. [critical] shell.execute: shell_execute".to_owned(),
            steps: Vec::new(),
        }
    }

    fn approve() -> UserDecision {
        UserDecision {
            approved: true,
            trust_grants: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_submit_and_resolve() {
        let broker = ApprovalBroker::new(Duration::from_secs(300));
        let req = request();
        let id = req.id;

        let rx = broker.submit(req).await;
        assert_eq!(broker.pending_count().await, 1);

        broker.resolve(id, approve()).await.expect("resolve");
        assert_eq!(broker.pending_count().await, 0);

        let decision = rx.await.expect("decision");
        assert!(decision.approved);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let broker = ApprovalBroker::new(Duration::from_secs(300));
        let result = broker.resolve(Uuid::now_v7(), approve()).await;
        assert!(matches!(result, Err(ApprovalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_double_resolve_fails() {
        let broker = ApprovalBroker::new(Duration::from_secs(300));
        let req = request();
        let id = req.id;
        let _rx = broker.submit(req).await;

        broker.resolve(id, approve()).await.expect("first resolve");
        let second = broker
            .resolve(
                id,
                UserDecision {
                    approved: false,
                    trust_grants: Vec::new(),
                },
            )
            .await;
        assert!(matches!(second, Err(ApprovalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_expired_request_auto_denied() {
        let broker = ApprovalBroker::new(Duration::from_secs(0));
        let rx = broker.submit(request()).await;

        // Zero timeout: anything older than "now" is expired.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let swept = broker.cleanup_expired().await;
        assert_eq!(swept, 1);

        let decision = rx.await.expect("decision");
        assert!(!decision.approved, "timeout denies");
    }

    #[tokio::test]
    async fn test_fresh_request_not_swept() {
        let broker = ApprovalBroker::new(Duration::from_secs(300));
        let _rx = broker.submit(request()).await;
        assert_eq!(broker.cleanup_expired().await, 0);
        assert_eq!(broker.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_resolve_after_receiver_dropped() {
        let broker = ApprovalBroker::new(Duration::from_secs(300));
        let req = request();
        let id = req.id;
        let rx = broker.submit(req).await;
        drop(rx); // Job was cancelled while awaiting approval.

        let result = broker.resolve(id, approve()).await;
        assert!(result.is_ok(), "resolve tolerates a dropped receiver");
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_user_approval_boundary() {
        let broker = std::sync::Arc::new(ApprovalBroker::new(Duration::from_secs(300)));
        let req = request();
        let id = req.id;

        let waiter = {
            let broker = std::sync::Arc::clone(&broker);
            tokio::spawn(async move { broker.request(req).await })
        };

        // Let the waiter submit, then resolve.
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.resolve(id, approve()).await.expect("resolve");

        let decision = waiter.await.expect("join").expect("decision");
        assert!(decision.approved);
    }
}
