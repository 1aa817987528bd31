//! Sentinel -- independent safety review.
//!
//! Receives a plan, classifies every step's effect category from gear/action
//! tokens and parameter hints (never from the planner's own labels), applies
//! the hard-floor policy, consults an independent LLM validator and the
//! decision memory, and composes an [`ApprovalOutcome`].
//!
//! Fail-safe posture throughout: unclassifiable actions assess as high risk,
//! a validator response that does not parse escalates to the user, and the
//! hard floor can never be overridden by trust profile or memory.

pub mod memory;
pub mod validator;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::plan::ExecutionPlan;
use crate::types::{ActionType, RiskLevel, TrustProfile};
use memory::{MemoryError, NewTrustDecision, SentinelMemory, TrustVerdict};
use validator::{PolicyContext, Validator, ValidatorError, ValidatorVerdict, Verdict};

/// Action types that always require fresh user approval, regardless of trust
/// profile or decision memory.
pub const HARD_FLOOR: [ActionType; 4] = [
    ActionType::ShellExecute,
    ActionType::FinancialTransaction,
    ActionType::SystemConfig,
    ActionType::DeleteFiles,
];

/// Whether an action type sits on the hard floor.
pub fn is_hard_floor(action_type: ActionType) -> bool {
    HARD_FLOOR.contains(&action_type)
}

/// Sentinel's reading of one step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAssessment {
    pub step_id: String,
    pub action_type: ActionType,
    /// Risk Sentinel derived from the base table.
    pub sentinel_risk: RiskLevel,
    /// Risk the planner claimed.
    pub scout_risk: RiskLevel,
    /// Matching target extracted from parameters (path, URL, counterparty).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub hard_floor: bool,
    /// True until cleared by profile auto-approval or a memory allow.
    pub requires_approval: bool,
}

/// Scout/Sentinel risk disagreement beyond one level.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Divergence {
    pub step_id: String,
    pub scout_risk: RiskLevel,
    pub sentinel_risk: RiskLevel,
    pub difference: u8,
}

/// One line of the human approval summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub step_id: String,
    pub gear: String,
    pub action: String,
    pub action_type: ActionType,
    pub risk_level: RiskLevel,
    pub reason: String,
}

/// Request published to the user-approval boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub job_id: Uuid,
    pub plan_id: Uuid,
    /// Concise step-by-step summary with risk level and reasoning.
    pub summary: String,
    pub steps: Vec<StepSummary>,
}

/// A trust grant the user attached to an approval.
#[derive(Debug, Clone)]
pub struct TrustGrant {
    pub action_type: ActionType,
    /// File prefix, host, or counterparty the grant covers.
    pub scope: String,
    pub verdict: TrustVerdict,
    /// Optional time to live.
    pub ttl: Option<chrono::Duration>,
}

/// The user's answer to an approval request.
#[derive(Debug, Clone)]
pub struct UserDecision {
    pub approved: bool,
    /// Decisions to memorize alongside the answer.
    pub trust_grants: Vec<TrustGrant>,
}

/// Abstract user-approval boundary consumed by the pipeline.
#[async_trait::async_trait]
pub trait UserApproval: Send + Sync {
    /// Publish a request and wait for the user's decision.
    async fn request(&self, request: ApprovalRequest) -> Result<UserDecision, SentinelError>;
}

/// Sentinel's decision on a plan.
#[derive(Debug, Clone)]
pub enum ApprovalOutcome {
    /// Every step auto-approved; execution may proceed.
    Approved,
    /// The validator wants the plan re-drawn; Scout re-plans with the reason.
    NeedsRevision {
        reason: String,
    },
    /// One or more steps need a human decision.
    NeedsUserApproval {
        request: ApprovalRequest,
    },
    /// The plan must not run.
    Rejected {
        reason: String,
    },
}

/// Full review output: outcome plus the per-step evidence.
#[derive(Debug)]
pub struct SentinelReview {
    pub outcome: ApprovalOutcome,
    pub assessments: Vec<StepAssessment>,
    pub divergences: Vec<Divergence>,
    /// Present when the validator replied with parseable JSON.
    pub validator_verdict: Option<ValidatorVerdict>,
}

/// Sentinel failure modes.
#[derive(Debug, Error)]
pub enum SentinelError {
    /// Validator transport failure; retryable by the orchestrator.
    #[error(transparent)]
    Validator(#[from] ValidatorError),
    /// Decision memory failure.
    #[error(transparent)]
    Memory(#[from] MemoryError),
    /// The approval boundary went away while a request was pending.
    #[error("approval channel closed")]
    ApprovalChannelClosed,
}

/// The safety reviewer.
pub struct Sentinel {
    validator: Box<dyn Validator>,
    memory: SentinelMemory,
    profile: TrustProfile,
    /// Scout's provider family, for the same-provider warning.
    planner_family: Option<String>,
    shell_gear_enabled: bool,
}

impl Sentinel {
    pub fn new(
        validator: Box<dyn Validator>,
        memory: SentinelMemory,
        profile: TrustProfile,
    ) -> Self {
        Self {
            validator,
            memory,
            profile,
            planner_family: None,
            shell_gear_enabled: false,
        }
    }

    /// Record Scout's provider family so a shared family logs a warning.
    pub fn with_planner_family(mut self, family: impl Into<String>) -> Self {
        self.planner_family = Some(family.into());
        self
    }

    pub fn with_shell_gear_enabled(mut self, enabled: bool) -> Self {
        self.shell_gear_enabled = enabled;
        self
    }

    /// Access to the decision memory (settings surface, tests).
    pub fn memory(&self) -> &SentinelMemory {
        &self.memory
    }

    /// Review a plan and compose the approval outcome.
    ///
    /// # Errors
    ///
    /// Validator transport failures surface as [`SentinelError::Validator`]
    /// (retryable). A validator *parse* failure is not an error: it
    /// escalates to user approval.
    pub async fn review(&self, plan: &ExecutionPlan) -> Result<SentinelReview, SentinelError> {
        if let Some(planner_family) = &self.planner_family {
            if planner_family == self.validator.family() {
                tracing::warn!(
                    family = %planner_family,
                    "planner and validator share a provider family; independence is weakened"
                );
            }
        }

        // 1. Classify and assess each step independently.
        let mut assessments = Vec::with_capacity(plan.steps.len());
        let mut divergences = Vec::new();
        for step in &plan.steps {
            let action_type = classify_step(&step.gear, &step.action, &step.parameters);
            let sentinel_risk = action_type.base_risk();
            let difference = step
                .risk_level
                .order()
                .abs_diff(sentinel_risk.order());
            if difference > 1 {
                tracing::warn!(
                    step_id = %step.id,
                    scout_risk = %step.risk_level,
                    sentinel_risk = %sentinel_risk,
                    difference,
                    "risk divergence between planner and reviewer"
                );
                divergences.push(Divergence {
                    step_id: step.id.clone(),
                    scout_risk: step.risk_level,
                    sentinel_risk,
                    difference,
                });
            }

            let hard_floor = is_hard_floor(action_type);
            // 2. Hard floor always needs fresh approval; otherwise the trust
            // profile ceiling decides.
            let requires_approval =
                hard_floor || sentinel_risk > self.profile.auto_approve_ceiling();

            assessments.push(StepAssessment {
                step_id: step.id.clone(),
                action_type,
                sentinel_risk,
                scout_risk: step.risk_level,
                target: derive_target(action_type, &step.parameters),
                hard_floor,
                requires_approval,
            });
        }

        // 3. Independent validator call; strict parse, fail-safe escalation.
        let stripped = plan.stripped();
        let policy = PolicyContext {
            trust_profile: self.profile,
            shell_gear_enabled: self.shell_gear_enabled,
            hard_floor: HARD_FLOOR.to_vec(),
        };
        let (validator_verdict, parse_failed) =
            match self.validator.validate(&stripped, &policy).await {
                Ok(verdict) => (Some(verdict), false),
                Err(ValidatorError::Parse(detail)) => {
                    tracing::warn!(%detail, "validator verdict unparseable; escalating to user");
                    (None, true)
                }
                Err(e @ ValidatorError::Provider(_)) => return Err(e.into()),
            };

        if let Some(verdict) = &validator_verdict {
            match verdict.verdict {
                Verdict::Revise => {
                    return Ok(SentinelReview {
                        outcome: ApprovalOutcome::NeedsRevision {
                            reason: verdict.reasoning.clone(),
                        },
                        assessments,
                        divergences,
                        validator_verdict,
                    });
                }
                Verdict::Reject => {
                    return Ok(SentinelReview {
                        outcome: ApprovalOutcome::Rejected {
                            reason: verdict.reasoning.clone(),
                        },
                        assessments,
                        divergences,
                        validator_verdict,
                    });
                }
                Verdict::Approve => {}
            }
        }

        // 4. Decision memory for steps not under the hard floor.
        let now = Utc::now();
        for assessment in &mut assessments {
            if assessment.hard_floor {
                continue;
            }
            let Some(target) = assessment.target.as_deref() else {
                continue;
            };
            if let Some(hit) = self
                .memory
                .find_match(assessment.action_type, target, now)
                .await?
            {
                match hit.verdict {
                    TrustVerdict::Deny => {
                        return Ok(SentinelReview {
                            outcome: ApprovalOutcome::Rejected {
                                reason: format!(
                                    "step '{}' is covered by a stored deny for scope '{}'",
                                    assessment.step_id, hit.scope
                                ),
                            },
                            assessments,
                            divergences,
                            validator_verdict,
                        });
                    }
                    TrustVerdict::Allow => {
                        tracing::debug!(
                            step_id = %assessment.step_id,
                            scope = %hit.scope,
                            "memory allow skips user approval"
                        );
                        assessment.requires_approval = false;
                    }
                }
            }
        }

        // 5. Compose the outcome. A validator parse failure escalates even
        // when every step would otherwise auto-approve.
        let needs_user = parse_failed || assessments.iter().any(|a| a.requires_approval);
        let outcome = if needs_user {
            let request = compose_approval_request(plan, &assessments, parse_failed);
            ApprovalOutcome::NeedsUserApproval { request }
        } else {
            ApprovalOutcome::Approved
        };

        Ok(SentinelReview {
            outcome,
            assessments,
            divergences,
            validator_verdict,
        })
    }

    /// Process the user's decision; persists any trust grants.
    ///
    /// # Errors
    ///
    /// Grant persistence fails with `ERR_VALIDATION` for shell grants; the
    /// decision itself still stands.
    pub async fn process_user_decision(
        &self,
        decision: &UserDecision,
    ) -> Result<ApprovalOutcome, SentinelError> {
        for grant in &decision.trust_grants {
            self.memory
                .store_decision(NewTrustDecision {
                    action_type: grant.action_type,
                    scope: grant.scope.clone(),
                    verdict: grant.verdict,
                    job_id: None,
                    ttl: grant.ttl,
                    conditions: None,
                    metadata: None,
                })
                .await?;
        }

        if decision.approved {
            Ok(ApprovalOutcome::Approved)
        } else {
            Ok(ApprovalOutcome::Rejected {
                reason: "rejected by user".to_owned(),
            })
        }
    }
}

/// Build the human approval request from the assessments.
fn compose_approval_request(
    plan: &ExecutionPlan,
    assessments: &[StepAssessment],
    escalated: bool,
) -> ApprovalRequest {
    let mut steps = Vec::new();
    let mut lines = Vec::new();
    if escalated {
        lines.push(
            "The independent reviewer's verdict could not be read; every step needs your decision."
                .to_owned(),
        );
    }

    for assessment in assessments {
        if !(escalated || assessment.requires_approval) {
            continue;
        }
        let Some(step) = plan.step(&assessment.step_id) else {
            continue;
        };
        let reason = if assessment.hard_floor {
            format!("{} always requires approval", assessment.action_type)
        } else {
            format!("assessed {} risk", assessment.sentinel_risk)
        };
        lines.push(format!(
            "{}. [{}] {}.{}: {} ({})",
            steps.len().saturating_add(1),
            assessment.sentinel_risk,
            step.gear,
            step.action,
            assessment.action_type,
            reason,
        ));
        steps.push(StepSummary {
            step_id: step.id.clone(),
            gear: step.gear.clone(),
            action: step.action.clone(),
            action_type: assessment.action_type,
            risk_level: assessment.sentinel_risk,
            reason,
        });
    }

    ApprovalRequest {
        id: Uuid::now_v7(),
        job_id: plan.job_id,
        plan_id: plan.id,
        summary: lines.join("\n"),
        steps,
    }
}

// ── Classification ──────────────────────────────────────────────

/// Derive the action type from gear/action tokens plus parameter hints.
///
/// Token matching is fail-safe ordered: financial and shell first, then
/// system/credential, network (HTTP method disambiguates GET vs mutate),
/// deletion, messaging, writes, reads. Anything left is `Unknown` (high).
pub fn classify_step(gear: &str, action: &str, parameters: &serde_json::Value) -> ActionType {
    let mut tokens = split_tokens(gear);
    tokens.extend(split_tokens(action));
    let has = |candidates: &[&str]| tokens.iter().any(|t| candidates.contains(&t.as_str()));

    let financial_params =
        parameters.get("amount").is_some() && parameters.get("currency").is_some();
    if financial_params
        || has(&[
            "pay", "payment", "payments", "charge", "invoice", "transfer", "refund", "payout",
        ])
    {
        return ActionType::FinancialTransaction;
    }

    if has(&["shell", "bash", "sh", "exec", "terminal", "subprocess"]) {
        return ActionType::ShellExecute;
    }

    if has(&["config", "configure", "settings", "sysctl", "registry"]) {
        return ActionType::SystemConfig;
    }

    if has(&[
        "credential",
        "credentials",
        "secret",
        "secrets",
        "token",
        "password",
        "keychain",
        "vault",
    ]) {
        return ActionType::CredentialUsage;
    }

    if has(&[
        "http", "https", "fetch", "url", "request", "api", "web", "curl", "network", "endpoint",
    ]) {
        if let Some(method) = parameters.get("method").and_then(|m| m.as_str()) {
            return match method.to_uppercase().as_str() {
                "GET" | "HEAD" | "OPTIONS" => ActionType::NetworkGet,
                _ => ActionType::NetworkMutate,
            };
        }
        if has(&["get", "fetch", "download", "read", "list", "query", "search"]) {
            return ActionType::NetworkGet;
        }
        // No method and no read verb: treat as mutating.
        return ActionType::NetworkMutate;
    }

    if has(&["delete", "remove", "rm", "unlink", "purge", "erase", "trash"]) {
        return ActionType::DeleteFiles;
    }

    if has(&["send", "message", "email", "mail", "sms", "notify", "reply", "dm"]) {
        return ActionType::SendMessage;
    }

    if has(&[
        "write", "save", "create", "append", "copy", "move", "mkdir", "edit", "rename", "touch",
        "update",
    ]) {
        return ActionType::WriteFiles;
    }

    if has(&[
        "read", "list", "cat", "stat", "glob", "find", "search", "open", "load", "view",
    ]) {
        return ActionType::ReadFiles;
    }

    ActionType::Unknown
}

/// Lowercase tokens split on separators and camelCase boundaries.
pub fn split_tokens(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for c in raw.chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && current.chars().last().is_some_and(|p| p.is_lowercase()) {
                tokens.push(std::mem::take(&mut current));
            }
            current.extend(c.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Extract the memory-matching target for a classified step.
pub fn derive_target(action_type: ActionType, parameters: &serde_json::Value) -> Option<String> {
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| parameters.get(*k).and_then(|v| v.as_str()))
            .map(ToOwned::to_owned)
    };

    match action_type {
        ActionType::ReadFiles | ActionType::WriteFiles | ActionType::DeleteFiles => {
            pick(&["path", "file", "dir", "target"])
        }
        ActionType::NetworkGet | ActionType::NetworkMutate => pick(&["url", "host", "endpoint"]),
        ActionType::FinancialTransaction => pick(&["counterparty", "recipient", "payee", "to"]),
        ActionType::SendMessage => pick(&["to", "recipient", "channel", "address"]),
        ActionType::CredentialUsage => pick(&["name", "secret", "service"]),
        ActionType::ShellExecute | ActionType::SystemConfig | ActionType::Unknown => {
            pick(&["target"])
        }
    }
}
