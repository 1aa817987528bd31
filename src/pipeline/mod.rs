//! Pipeline orchestrator.
//!
//! Drives one job through the state machine:
//!
//! ```text
//! pending -> planning -> validating -> awaiting_approval -> executing -> completed
//!                  \            \                      \             \-> failed
//!                   \            \-> planning (revise)  \-> cancelled (user reject)
//!                    \-> completed (chat reply)
//! ```
//!
//! Every transition writes its audit entry in the same transaction as the
//! status mutation, before the transition's side effect runs. Step dispatch
//! honors `dependsOn`, consults the circuit breaker per gear, and records
//! every attempt in the execution log. Cancellation is cooperative: a cancel
//! flag is checked at each suspension point and between steps.

pub mod approval;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::audit::{AuditError, AuditLog, NewAuditEntry};
use crate::axis::breaker::CircuitBreaker;
use crate::axis::queue::{JobQueue, NewJob};
use crate::axis::worker::JobRunner;
use crate::config::RuntimeConfig;
use crate::error::ErrorCode;
use crate::gear::context::{GearContext, SubJobSpawner};
use crate::gear::{GearError, GearManifest, GearRuntime};
use crate::plan::ExecutionPlan;
use crate::scout::{GearSummary, PlanContext, PlanResult, Planner, ScoutError};
use crate::sentinel::{
    ApprovalOutcome, Sentinel, SentinelError, UserApproval, UserDecision,
};
use crate::sentinel::validator::ValidatorError;
use crate::store::StoreError;
use crate::types::{ExecutionStatus, Job, JobPriority, JobSource, JobStatus, RiskLevel};

/// Poll cadence for cooperative cancel checks during long waits.
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Retries for provider-transport failures (Scout/validator) and transient
/// sandbox failures, with linear backoff plus jitter.
const TRANSIENT_RETRIES: u32 = 2;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

// ── Notifications ───────────────────────────────────────────────

/// Events pushed to the operator-facing surface.
#[derive(Debug, Clone)]
pub enum NotificationEvent {
    JobCompleted {
        job_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        code: ErrorCode,
        detail: String,
    },
    JobCancelled {
        job_id: Uuid,
    },
    ApprovalRequested {
        job_id: Uuid,
        approval_id: Uuid,
        summary: String,
    },
}

/// Abstract notification boundary.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: NotificationEvent);
}

/// Default sink: structured log lines.
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn emit(&self, event: NotificationEvent) {
        match event {
            NotificationEvent::JobCompleted { job_id } => {
                tracing::info!(%job_id, "job completed");
            }
            NotificationEvent::JobFailed {
                job_id,
                code,
                detail,
            } => {
                tracing::warn!(%job_id, code = %code, %detail, "job failed");
            }
            NotificationEvent::JobCancelled { job_id } => {
                tracing::info!(%job_id, "job cancelled");
            }
            NotificationEvent::ApprovalRequested {
                job_id,
                approval_id,
                summary,
            } => {
                tracing::info!(%job_id, %approval_id, %summary, "approval requested");
            }
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────

/// Orchestration failures. `run_job` absorbs these into the job's own
/// terminal status; they never unwind the worker.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Scout(#[from] ScoutError),
    #[error(transparent)]
    Sentinel(#[from] SentinelError),
    #[error("step '{step}' failed: {source}")]
    Gear {
        step: String,
        source: GearError,
    },
    #[error("circuit open for gear '{gear}' at step '{step}'")]
    CircuitOpen {
        gear: String,
        step: String,
    },
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("job metadata carries no request text")]
    MissingRequest,
    #[error("step '{step}' references unknown gear '{gear}'")]
    UnknownGear {
        gear: String,
        step: String,
    },
    #[error("plan still needs revision after {0} attempts")]
    RevisionLimit(u32),
    #[error("job was cancelled")]
    Cancelled,
    #[error("job claim was lost")]
    LostClaim,
}

impl PipelineError {
    /// Taxonomy code persisted with a failed job.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Store(_) | Self::Audit(_) | Self::LostClaim => ErrorCode::ErrConflict,
            Self::Scout(e) => e.code(),
            Self::Sentinel(SentinelError::Validator(e)) => e.code(),
            Self::Sentinel(_) => ErrorCode::ErrConflict,
            Self::Gear { source, .. } => source.code(),
            Self::CircuitOpen { .. } => ErrorCode::ErrRateLimit,
            Self::Timeout(_) => ErrorCode::ErrTimeout,
            Self::MissingRequest => ErrorCode::ErrValidation,
            Self::UnknownGear { .. } => ErrorCode::ErrNotFound,
            Self::RevisionLimit(_) => ErrorCode::ErrPlanValidation,
            Self::Cancelled => ErrorCode::ErrConflict,
        }
    }
}

// ── Cancellation ────────────────────────────────────────────────

/// Cooperative cancel flags per running job.
#[derive(Debug, Default, Clone)]
pub struct CancelRegistry {
    flags: Arc<Mutex<HashMap<Uuid, Arc<AtomicBool>>>>,
}

impl CancelRegistry {
    /// Token for a job; created on first use.
    fn token(&self, job_id: Uuid) -> Arc<AtomicBool> {
        Arc::clone(
            self.flags
                .lock()
                .expect("cancel lock")
                .entry(job_id)
                .or_default(),
        )
    }

    /// Raise the cancel flag for a running job. Returns whether a flag
    /// existed.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        match self.flags.lock().expect("cancel lock").get(&job_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    fn remove(&self, job_id: Uuid) {
        self.flags.lock().expect("cancel lock").remove(&job_id);
    }
}

// ── Sub-job capability ──────────────────────────────────────────

/// Capability handle letting gears create sub-jobs without a reference to
/// the orchestrator.
struct QueueSpawner {
    queue: JobQueue,
}

#[async_trait]
impl SubJobSpawner for QueueSpawner {
    async fn create_sub_job(
        &self,
        parent_job: Uuid,
        request: String,
        priority: JobPriority,
    ) -> Result<Uuid, GearError> {
        let job = self
            .queue
            .create_job(NewJob {
                priority,
                source: JobSource::SubJob,
                metadata: serde_json::json!({
                    "request": request,
                    "parentJobId": parent_job,
                }),
            })
            .await
            .map_err(|e| GearError::Sandbox(format!("sub-job creation failed: {e}")))?;
        Ok(job.id)
    }
}

// ── Orchestrator ────────────────────────────────────────────────

/// Per-job state machine over Scout, Sentinel, the approval boundary, and
/// the Gear runtime.
pub struct Orchestrator {
    queue: JobQueue,
    audit: AuditLog,
    scout: Arc<dyn Planner>,
    sentinel: Arc<Sentinel>,
    approvals: Arc<dyn UserApproval>,
    gears: Arc<GearRuntime>,
    manifests: HashMap<String, GearManifest>,
    breaker: Arc<CircuitBreaker>,
    notifications: Arc<dyn NotificationSink>,
    cancel: CancelRegistry,
    workspace: std::path::PathBuf,
    planner_timeout: Duration,
    validator_timeout: Duration,
    approval_timeout: Duration,
    max_plan_revisions: u32,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: &RuntimeConfig,
        queue: JobQueue,
        audit: AuditLog,
        scout: Arc<dyn Planner>,
        sentinel: Arc<Sentinel>,
        approvals: Arc<dyn UserApproval>,
        gears: Arc<GearRuntime>,
        breaker: Arc<CircuitBreaker>,
        notifications: Arc<dyn NotificationSink>,
        workspace: std::path::PathBuf,
    ) -> Self {
        Self {
            queue,
            audit,
            scout,
            sentinel,
            approvals,
            gears,
            manifests: HashMap::new(),
            breaker,
            notifications,
            cancel: CancelRegistry::default(),
            workspace,
            planner_timeout: Duration::from_millis(runtime.planner_timeout_ms),
            validator_timeout: Duration::from_millis(runtime.validator_timeout_ms),
            approval_timeout: Duration::from_millis(runtime.approval_timeout_ms),
            max_plan_revisions: runtime.max_plan_revisions,
        }
    }

    /// Register a gear manifest. Steps referencing unregistered gears fail.
    pub fn register_gear(&mut self, manifest: GearManifest) {
        self.manifests.insert(manifest.id.clone(), manifest);
    }

    /// Cancel handle shared with the transport surface.
    pub fn cancel_registry(&self) -> CancelRegistry {
        self.cancel.clone()
    }

    /// Request cancellation of a job in any non-terminal state.
    ///
    /// A running job is cancelled cooperatively at its next suspension
    /// point; a queued one is cancelled in place.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool, PipelineError> {
        if self.cancel.cancel(job_id) {
            return Ok(true);
        }
        // Not running: a pending or parked job transitions directly.
        for from in [JobStatus::Pending, JobStatus::AwaitingApproval] {
            if self
                .transition_audited(
                    job_id,
                    from,
                    JobStatus::Cancelled,
                    None,
                    "job.cancelled",
                    serde_json::json!({"by": "user"}),
                )
                .await?
            {
                self.notifications
                    .emit(NotificationEvent::JobCancelled { job_id });
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Summaries of registered gears for the planner prompt.
    fn gear_summaries(&self) -> Vec<GearSummary> {
        let mut summaries: Vec<GearSummary> = self
            .manifests
            .values()
            .map(|m| GearSummary {
                id: m.id.clone(),
                description: m.description.clone(),
                actions: m.actions.iter().map(|a| a.name.clone()).collect(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    // ── State machine ───────────────────────────────────────────

    async fn drive(&self, job: Job, worker_id: &str) -> Result<(), PipelineError> {
        let token = self.cancel.token(job.id);
        let request = job
            .metadata
            .get("request")
            .and_then(|v| v.as_str())
            .ok_or(PipelineError::MissingRequest)?
            .to_owned();

        let mut ctx = PlanContext::for_request(job.id, request);
        ctx.gears = self.gear_summaries();
        // Scheduled and sub-jobs have no conversation to fall back to.
        ctx.force_plan = job.source != JobSource::User;

        let mut revisions: u32 = 0;
        loop {
            if token.load(Ordering::SeqCst) {
                return Err(PipelineError::Cancelled);
            }

            // planning: ask Scout (the claim already moved the job here; the
            // audit entry lands before the provider call).
            self.audit
                .append(
                    NewAuditEntry::system("job.planning", job.id)
                        .with_actor("worker", Some(worker_id.to_owned())),
                )
                .await?;

            let plan_result = self.call_scout(&ctx).await?;

            let plan = match plan_result {
                PlanResult::Chat(reply) => {
                    // A conversational answer completes the job directly.
                    self.queue
                        .merge_metadata(job.id, serde_json::json!({"reply": reply.text}))
                        .await?;
                    self.transition_audited(
                        job.id,
                        JobStatus::Planning,
                        JobStatus::Completed,
                        None,
                        "job.completed",
                        serde_json::json!({"kind": "chat"}),
                    )
                    .await?;
                    self.notifications
                        .emit(NotificationEvent::JobCompleted { job_id: job.id });
                    return Ok(());
                }
                PlanResult::Plan(plan) => plan,
            };

            if !self
                .transition_audited(
                    job.id,
                    JobStatus::Planning,
                    JobStatus::Validating,
                    Some(worker_id),
                    "job.validating",
                    serde_json::json!({"planId": plan.id, "steps": plan.steps.len()}),
                )
                .await?
            {
                return Err(PipelineError::LostClaim);
            }

            let review = self.call_sentinel(&plan).await?;

            match review.outcome {
                ApprovalOutcome::Approved => {
                    return self.execute_phase(&job, worker_id, &plan, &token, JobStatus::Validating).await;
                }
                ApprovalOutcome::NeedsRevision { reason } => {
                    revisions = revisions.saturating_add(1);
                    if revisions > self.max_plan_revisions {
                        return Err(PipelineError::RevisionLimit(self.max_plan_revisions));
                    }
                    if !self
                        .transition_audited(
                            job.id,
                            JobStatus::Validating,
                            JobStatus::Planning,
                            Some(worker_id),
                            "job.revision",
                            serde_json::json!({"reason": reason, "attempt": revisions}),
                        )
                        .await?
                    {
                        return Err(PipelineError::LostClaim);
                    }
                    ctx.revision_reason = Some(reason);
                    ctx.force_plan = true;
                    continue;
                }
                ApprovalOutcome::NeedsUserApproval { request } => {
                    if !self
                        .transition_audited(
                            job.id,
                            JobStatus::Validating,
                            JobStatus::AwaitingApproval,
                            None,
                            "approval.requested",
                            serde_json::json!({
                                "approvalId": request.id,
                                "steps": request.steps.len(),
                            }),
                        )
                        .await?
                    {
                        return Err(PipelineError::LostClaim);
                    }
                    self.notifications.emit(NotificationEvent::ApprovalRequested {
                        job_id: job.id,
                        approval_id: request.id,
                        summary: request.summary.clone(),
                    });

                    let decision = self.await_decision(request, &token).await?;
                    let outcome = self.sentinel.process_user_decision(&decision).await?;
                    match outcome {
                        ApprovalOutcome::Approved => {
                            self.audit
                                .append(
                                    NewAuditEntry::system("approval.granted", job.id)
                                        .with_actor("user", None)
                                        .with_risk(RiskLevel::Medium),
                                )
                                .await?;
                            return self
                                .execute_phase(&job, worker_id, &plan, &token, JobStatus::AwaitingApproval)
                                .await;
                        }
                        _ => {
                            // User rejection cancels the job.
                            self.transition_audited(
                                job.id,
                                JobStatus::AwaitingApproval,
                                JobStatus::Cancelled,
                                None,
                                "approval.rejected",
                                serde_json::json!({"by": "user"}),
                            )
                            .await?;
                            self.notifications
                                .emit(NotificationEvent::JobCancelled { job_id: job.id });
                            return Ok(());
                        }
                    }
                }
                ApprovalOutcome::Rejected { reason } => {
                    self.transition_audited(
                        job.id,
                        JobStatus::Validating,
                        JobStatus::Failed,
                        None,
                        "job.rejected",
                        serde_json::json!({"reason": reason}),
                    )
                    .await?;
                    self.queue
                        .merge_metadata(
                            job.id,
                            serde_json::json!({"error": reason, "code": "ERR_VALIDATION"}),
                        )
                        .await?;
                    self.notifications.emit(NotificationEvent::JobFailed {
                        job_id: job.id,
                        code: ErrorCode::ErrValidation,
                        detail: reason,
                    });
                    return Ok(());
                }
            }
        }
    }

    /// Scout call with timeout and transient-failure retries.
    async fn call_scout(&self, ctx: &PlanContext) -> Result<PlanResult, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match tokio::time::timeout(self.planner_timeout, self.scout.plan(ctx)).await {
                Err(_) => return Err(PipelineError::Timeout("planner call")),
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => {
                    let retryable = matches!(e, ScoutError::Provider(_));
                    if retryable && attempt < TRANSIENT_RETRIES {
                        attempt = attempt.saturating_add(1);
                        tracing::warn!(error = %e, attempt, "planner call failed; retrying");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Sentinel review with timeout and transient-failure retries.
    async fn call_sentinel(
        &self,
        plan: &ExecutionPlan,
    ) -> Result<crate::sentinel::SentinelReview, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            match tokio::time::timeout(self.validator_timeout, self.sentinel.review(plan)).await {
                Err(_) => return Err(PipelineError::Timeout("validator call")),
                Ok(Ok(review)) => return Ok(review),
                Ok(Err(e)) => {
                    let retryable = matches!(
                        e,
                        SentinelError::Validator(ValidatorError::Provider(_))
                    );
                    if retryable && attempt < TRANSIENT_RETRIES {
                        attempt = attempt.saturating_add(1);
                        tracing::warn!(error = %e, attempt, "validator call failed; retrying");
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Wait for the user's decision, checking cancel and the approval
    /// timeout.
    async fn await_decision(
        &self,
        request: crate::sentinel::ApprovalRequest,
        token: &AtomicBool,
    ) -> Result<UserDecision, PipelineError> {
        let deadline = Instant::now()
            .checked_add(self.approval_timeout)
            .unwrap_or_else(Instant::now);
        let request_fut = self.approvals.request(request);
        tokio::pin!(request_fut);

        loop {
            tokio::select! {
                decision = &mut request_fut => return Ok(decision?),
                _ = tokio::time::sleep(CANCEL_POLL) => {
                    if token.load(Ordering::SeqCst) {
                        // Approval waits cancel immediately.
                        return Err(PipelineError::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        // An unanswered request is a denial.
                        return Ok(UserDecision {
                            approved: false,
                            trust_grants: Vec::new(),
                        });
                    }
                }
            }
        }
    }

    // ── Execution phase ─────────────────────────────────────────

    async fn execute_phase(
        &self,
        job: &Job,
        worker_id: &str,
        plan: &ExecutionPlan,
        token: &AtomicBool,
        from: JobStatus,
    ) -> Result<(), PipelineError> {
        if !self
            .transition_audited(
                job.id,
                from,
                JobStatus::Executing,
                Some(worker_id),
                "job.executing",
                serde_json::json!({"planId": plan.id}),
            )
            .await?
        {
            return Err(PipelineError::LostClaim);
        }

        let order = plan
            .topological_order()
            .map_err(|e| PipelineError::Scout(ScoutError::PlanValidation(e)))?;

        let mut results: Vec<serde_json::Value> = Vec::with_capacity(order.len());
        for step in order {
            if token.load(Ordering::SeqCst) {
                return Err(PipelineError::Cancelled);
            }

            // An open circuit records the failure without touching the
            // sandbox.
            if self.breaker.is_open(&step.gear) {
                let mut conn = self.queue.store().writer().acquire().await.map_err(StoreError::from)?;
                let execution_id = self.queue.log_step_started(&mut conn, job.id, &step.id).await?;
                self.queue
                    .log_step_finished(
                        &mut conn,
                        execution_id,
                        ExecutionStatus::Failed,
                        None,
                        Some("circuit_open"),
                    )
                    .await?;
                return Err(PipelineError::CircuitOpen {
                    gear: step.gear.clone(),
                    step: step.id.clone(),
                });
            }

            let manifest = self.manifests.get(&step.gear).ok_or_else(|| {
                PipelineError::UnknownGear {
                    gear: step.gear.clone(),
                    step: step.id.clone(),
                }
            })?;

            let execution_id = {
                let mut conn = self.queue.store().writer().acquire().await.map_err(StoreError::from)?;
                self.queue.log_step_started(&mut conn, job.id, &step.id).await?
            };

            let mut ctx = GearContext::new(job.id, step.id.clone(), self.workspace.clone())
                .with_spawner(Arc::new(QueueSpawner {
                    queue: self.queue.clone(),
                }));
            if manifest.allow_host_exec {
                // The runtime re-checks the shell master switch on dispatch.
                ctx = ctx.with_host_exec();
            }

            let outcome = self
                .run_step(manifest, &step.action, &step.parameters, &ctx, token)
                .await;

            let mut conn = self.queue.store().writer().acquire().await.map_err(StoreError::from)?;
            match outcome {
                Ok(result) => {
                    self.queue
                        .log_step_finished(
                            &mut conn,
                            execution_id,
                            ExecutionStatus::Completed,
                            Some(&result),
                            None,
                        )
                        .await?;
                    self.breaker.record_success(&step.gear);
                    results.push(serde_json::json!({"stepId": step.id, "result": result}));
                }
                Err(PipelineError::Cancelled) => {
                    self.queue
                        .log_step_finished(
                            &mut conn,
                            execution_id,
                            ExecutionStatus::Failed,
                            None,
                            Some("cancelled"),
                        )
                        .await?;
                    return Err(PipelineError::Cancelled);
                }
                Err(e) => {
                    self.queue
                        .log_step_finished(
                            &mut conn,
                            execution_id,
                            ExecutionStatus::Failed,
                            None,
                            Some(&e.to_string()),
                        )
                        .await?;
                    self.breaker.record_failure(&step.gear);
                    // A failed step short-circuits the job; dependents never
                    // run.
                    return Err(e);
                }
            }
        }

        if !plan.journal_skip {
            self.queue
                .merge_metadata(job.id, serde_json::json!({"result": {"steps": results}}))
                .await?;
        }

        self.transition_audited(
            job.id,
            JobStatus::Executing,
            JobStatus::Completed,
            None,
            "job.completed",
            serde_json::json!({"steps": plan.steps.len()}),
        )
        .await?;
        self.notifications
            .emit(NotificationEvent::JobCompleted { job_id: job.id });
        Ok(())
    }

    /// One sandbox invocation with transient retries and cooperative cancel.
    async fn run_step(
        &self,
        manifest: &GearManifest,
        action: &str,
        params: &serde_json::Value,
        ctx: &GearContext,
        token: &AtomicBool,
    ) -> Result<serde_json::Value, PipelineError> {
        let mut attempt: u32 = 0;
        loop {
            let exec = self.gears.execute(manifest, action, params, ctx);
            tokio::pin!(exec);

            let result = loop {
                tokio::select! {
                    r = &mut exec => break r,
                    _ = tokio::time::sleep(CANCEL_POLL) => {
                        if token.load(Ordering::SeqCst) {
                            // Dropping the future kills Level 2 children
                            // (kill_on_drop); Level 3 containers die with
                            // their wait timeout.
                            return Err(PipelineError::Cancelled);
                        }
                    }
                }
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let retryable =
                        matches!(e, GearError::Sandbox(_) | GearError::Protocol(_));
                    if retryable && attempt < TRANSIENT_RETRIES {
                        attempt = attempt.saturating_add(1);
                        tracing::warn!(
                            gear = %manifest.id,
                            error = %e,
                            attempt,
                            "sandbox failure; retrying"
                        );
                        backoff(attempt).await;
                        continue;
                    }
                    return Err(PipelineError::Gear {
                        step: ctx.step_id.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    // ── Plumbing ────────────────────────────────────────────────

    /// Audit entry + status transition in one transaction. The audit row is
    /// discarded when the transition guard does not match.
    async fn transition_audited(
        &self,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        worker_id: Option<&str>,
        action: &str,
        details: serde_json::Value,
    ) -> Result<bool, PipelineError> {
        let mut tx = self
            .queue
            .store()
            .writer()
            .begin()
            .await
            .map_err(StoreError::from)?;

        self.audit
            .append_on(
                &mut tx,
                NewAuditEntry::system(action, job_id).with_details(details),
            )
            .await?;
        let moved = self
            .queue
            .transition_on(&mut tx, job_id, from, to, worker_id)
            .await?;

        if moved {
            tx.commit().await.map_err(StoreError::from)?;
        } else {
            tx.rollback().await.map_err(StoreError::from)?;
        }
        Ok(moved)
    }

    /// Force a job to `failed` from whatever working state it is in.
    async fn fail_job(&self, job_id: Uuid, code: ErrorCode, detail: &str) {
        for from in [
            JobStatus::Planning,
            JobStatus::Validating,
            JobStatus::Executing,
            JobStatus::AwaitingApproval,
        ] {
            match self
                .transition_audited(
                    job_id,
                    from,
                    JobStatus::Failed,
                    None,
                    "job.failed",
                    serde_json::json!({"code": code, "error": detail}),
                )
                .await
            {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(%job_id, error = %e, "failed to persist job failure");
                    return;
                }
            }
        }
        if let Err(e) = self
            .queue
            .merge_metadata(job_id, serde_json::json!({"code": code, "error": detail}))
            .await
        {
            tracing::error!(%job_id, error = %e, "failed to persist failure metadata");
        }
    }

    /// Move a job to `cancelled` from whatever state it is in.
    async fn cancel_terminally(&self, job_id: Uuid) {
        for from in [
            JobStatus::Planning,
            JobStatus::Validating,
            JobStatus::Executing,
            JobStatus::AwaitingApproval,
            JobStatus::Pending,
        ] {
            match self
                .transition_audited(
                    job_id,
                    from,
                    JobStatus::Cancelled,
                    None,
                    "job.cancelled",
                    serde_json::json!({"by": "user"}),
                )
                .await
            {
                Ok(true) => break,
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(%job_id, error = %e, "failed to persist cancellation");
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl JobRunner for Orchestrator {
    async fn run_job(&self, job: Job, worker_id: &str) {
        let job_id = job.id;
        match self.drive(job, worker_id).await {
            Ok(()) => {}
            Err(PipelineError::Cancelled) => {
                self.cancel_terminally(job_id).await;
                self.notifications
                    .emit(NotificationEvent::JobCancelled { job_id });
            }
            Err(e) => {
                let code = e.code();
                let detail = e.to_string();
                tracing::warn!(%job_id, code = %code, error = %detail, "pipeline error");
                self.fail_job(job_id, code, &detail).await;
                self.notifications.emit(NotificationEvent::JobFailed {
                    job_id,
                    code,
                    detail,
                });
            }
        }
        self.cancel.remove(job_id);
    }
}

/// Linear backoff with jitter.
async fn backoff(attempt: u32) {
    use rand::Rng;
    let base = RETRY_BACKOFF.saturating_mul(attempt);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
    tokio::time::sleep(base.saturating_add(jitter)).await;
}
