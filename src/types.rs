// Core data model: jobs, risk levels, action types, trust profiles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a job.
///
/// Terminal statuses (`Completed`, `Failed`, `Cancelled`) never mutate
/// further. `worker_id` on the job row is non-null iff the status is one of
/// the working statuses (`Planning`, `Validating`, `Executing`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting for a worker.
    Pending,
    /// A worker is asking Scout for a plan.
    Planning,
    /// Sentinel is reviewing the plan.
    Validating,
    /// Blocked on a human approval decision.
    AwaitingApproval,
    /// Steps are being dispatched to the sandbox.
    Executing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled by the user or by a rejected approval.
    Cancelled,
}

impl JobStatus {
    /// Returns `true` for statuses that never mutate further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns `true` for statuses that require a live worker lease.
    pub fn is_working(self) -> bool {
        matches!(self, Self::Planning | Self::Validating | Self::Executing)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Validating => "validating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "validating" => Ok(Self::Validating),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(anyhow::anyhow!("unknown job status: {other}")),
        }
    }
}

/// Scheduling priority. `High` jobs are claimed before `Normal` before `Low`;
/// within a priority the queue is FIFO by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

impl JobPriority {
    /// Integer rank used for SQL ordering (higher claims first).
    pub fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        })
    }
}

impl std::str::FromStr for JobPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(anyhow::anyhow!("unknown job priority: {other}")),
        }
    }
}

/// Where a job came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Created directly from a user request.
    User,
    /// Created by the schedule evaluator.
    Schedule,
    /// Spawned by a gear during execution of a parent job.
    SubJob,
}

impl std::fmt::Display for JobSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Schedule => "schedule",
            Self::SubJob => "sub_job",
        })
    }
}

impl std::str::FromStr for JobSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "schedule" => Ok(Self::Schedule),
            "sub_job" => Ok(Self::SubJob),
            other => Err(anyhow::anyhow!("unknown job source: {other}")),
        }
    }
}

/// A durable unit of work tracked by the Axis scheduler.
///
/// Job ids are UUIDv7 so lexical order follows creation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub source: JobSource,
    /// Set while a worker owns the job; cleared on release and by recovery.
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Opaque metadata: the request text, schedule id, parent job id, result.
    pub metadata: serde_json::Value,
}

/// Severity of a plan step, totally ordered low < medium < high < critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Ordinal used for divergence arithmetic (low=0 .. critical=3).
    pub fn order(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        })
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(anyhow::anyhow!("unknown risk level: {other}")),
        }
    }
}

/// Canonical classification of a step's effect category.
///
/// Derived by Sentinel from gear/action tokens and parameter hints; never
/// taken from the planner's own claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ReadFiles,
    WriteFiles,
    DeleteFiles,
    NetworkGet,
    NetworkMutate,
    ShellExecute,
    CredentialUsage,
    FinancialTransaction,
    SendMessage,
    SystemConfig,
    /// Could not be classified -- treated as high risk (fail-safe).
    Unknown,
}

impl ActionType {
    /// Base risk per action type. `Unknown` maps to `High` so unclassified
    /// actions cannot slip past review.
    pub fn base_risk(self) -> RiskLevel {
        match self {
            Self::ShellExecute | Self::FinancialTransaction | Self::SystemConfig => {
                RiskLevel::Critical
            }
            Self::DeleteFiles | Self::NetworkMutate | Self::SendMessage | Self::Unknown => {
                RiskLevel::High
            }
            Self::WriteFiles | Self::CredentialUsage => RiskLevel::Medium,
            Self::ReadFiles | Self::NetworkGet => RiskLevel::Low,
        }
    }

    /// Shell actions are never memorized as trust decisions.
    pub fn is_shell(self) -> bool {
        matches!(self, Self::ShellExecute)
    }

    /// Stable snake_case name, matching the `decisions.action_type` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadFiles => "read_files",
            Self::WriteFiles => "write_files",
            Self::DeleteFiles => "delete_files",
            Self::NetworkGet => "network_get",
            Self::NetworkMutate => "network_mutate",
            Self::ShellExecute => "shell_execute",
            Self::CredentialUsage => "credential_usage",
            Self::FinancialTransaction => "financial_transaction",
            Self::SendMessage => "send_message",
            Self::SystemConfig => "system_config",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read_files" => Ok(Self::ReadFiles),
            "write_files" => Ok(Self::WriteFiles),
            "delete_files" => Ok(Self::DeleteFiles),
            "network_get" => Ok(Self::NetworkGet),
            "network_mutate" => Ok(Self::NetworkMutate),
            "shell_execute" => Ok(Self::ShellExecute),
            "credential_usage" => Ok(Self::CredentialUsage),
            "financial_transaction" => Ok(Self::FinancialTransaction),
            "send_message" => Ok(Self::SendMessage),
            "system_config" => Ok(Self::SystemConfig),
            "unknown" => Ok(Self::Unknown),
            other => Err(anyhow::anyhow!("unknown action type: {other}")),
        }
    }
}

/// How much latitude the runtime has to auto-approve reviewed steps.
///
/// The hard floor (shell, financial, system config, file deletion) always
/// requires fresh approval regardless of profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustProfile {
    /// Only low-risk steps auto-approve.
    Supervised,
    /// Low and medium risk auto-approve.
    Balanced,
    /// Everything below critical auto-approves (hard floor still applies).
    Autonomous,
}

impl TrustProfile {
    /// Highest risk level that auto-approves under this profile.
    pub fn auto_approve_ceiling(self) -> RiskLevel {
        match self {
            Self::Supervised => RiskLevel::Low,
            Self::Balanced => RiskLevel::Medium,
            Self::Autonomous => RiskLevel::High,
        }
    }
}

impl std::str::FromStr for TrustProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "supervised" => Ok(Self::Supervised),
            "balanced" => Ok(Self::Balanced),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(anyhow::anyhow!("unknown trust profile: {other}")),
        }
    }
}

/// Status of one step execution in the append-only `execution_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Completed,
    Failed,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(anyhow::anyhow!("unknown execution status: {other}")),
        }
    }
}

/// One append-only row per step execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub execution_id: Uuid,
    pub job_id: Uuid,
    pub step_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Planning,
            JobStatus::Validating,
            JobStatus::AwaitingApproval,
            JobStatus::Executing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let s = status.to_string();
            let parsed: JobStatus = s.parse().expect("roundtrip should work");
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::AwaitingApproval.is_terminal());
    }

    #[test]
    fn test_working_statuses_match_lease_invariant() {
        assert!(JobStatus::Planning.is_working());
        assert!(JobStatus::Validating.is_working());
        assert!(JobStatus::Executing.is_working());
        assert!(!JobStatus::Pending.is_working());
        assert!(!JobStatus::AwaitingApproval.is_working());
        assert!(!JobStatus::Completed.is_working());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        assert!(JobPriority::High.rank() > JobPriority::Low.rank());
    }

    #[test]
    fn test_risk_level_total_order() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(RiskLevel::Critical.order(), 3);
    }

    #[test]
    fn test_base_risk_table() {
        assert_eq!(ActionType::ShellExecute.base_risk(), RiskLevel::Critical);
        assert_eq!(
            ActionType::FinancialTransaction.base_risk(),
            RiskLevel::Critical
        );
        assert_eq!(ActionType::SystemConfig.base_risk(), RiskLevel::Critical);
        assert_eq!(ActionType::DeleteFiles.base_risk(), RiskLevel::High);
        assert_eq!(ActionType::NetworkMutate.base_risk(), RiskLevel::High);
        assert_eq!(ActionType::SendMessage.base_risk(), RiskLevel::High);
        assert_eq!(ActionType::WriteFiles.base_risk(), RiskLevel::Medium);
        assert_eq!(ActionType::CredentialUsage.base_risk(), RiskLevel::Medium);
        assert_eq!(ActionType::ReadFiles.base_risk(), RiskLevel::Low);
        assert_eq!(ActionType::NetworkGet.base_risk(), RiskLevel::Low);
        // Unclassified actions fail safe.
        assert_eq!(ActionType::Unknown.base_risk(), RiskLevel::High);
    }

    #[test]
    fn test_action_type_roundtrip() {
        for at in [
            ActionType::ReadFiles,
            ActionType::WriteFiles,
            ActionType::DeleteFiles,
            ActionType::NetworkGet,
            ActionType::NetworkMutate,
            ActionType::ShellExecute,
            ActionType::CredentialUsage,
            ActionType::FinancialTransaction,
            ActionType::SendMessage,
            ActionType::SystemConfig,
            ActionType::Unknown,
        ] {
            let parsed: ActionType = at.as_str().parse().expect("roundtrip should work");
            assert_eq!(at, parsed);
        }
    }

    #[test]
    fn test_trust_profile_ceilings() {
        assert_eq!(
            TrustProfile::Supervised.auto_approve_ceiling(),
            RiskLevel::Low
        );
        assert_eq!(
            TrustProfile::Balanced.auto_approve_ceiling(),
            RiskLevel::Medium
        );
        assert_eq!(
            TrustProfile::Autonomous.auto_approve_ceiling(),
            RiskLevel::High
        );
    }
}
