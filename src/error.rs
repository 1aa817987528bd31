//! Coded error taxonomy shared across the core.
//!
//! Expected failures (validation, parsing, policy violations) surface as
//! typed `Result`s carrying one of these codes and never unwind a worker.
//! Unexpected failures abort the current job, persist the code on the job
//! row, and are reported through the notification sink.

use serde::{Deserialize, Serialize};

/// Stable error codes persisted with failed jobs and surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Input failed structural or policy validation.
    ErrValidation,
    /// Caller is not authenticated.
    ErrAuth,
    /// Caller is authenticated but not permitted.
    ErrAuthz,
    /// Referenced entity does not exist.
    ErrNotFound,
    /// Concurrent mutation conflict (e.g. job already claimed or terminal).
    ErrConflict,
    /// A bounded operation exceeded its deadline.
    ErrTimeout,
    /// Caller exceeded a rate limit.
    ErrRateLimit,
    /// Sandbox limit violation, startup failure, or protocol framing error.
    ErrGearSandbox,
    /// Planner/validator transport or response parse failure.
    ErrLlmProvider,
    /// Returned JSON does not satisfy the plan schema.
    ErrPlanValidation,
    /// Secret lookup or injection failed.
    ErrSecretAccess,
}

impl ErrorCode {
    /// The wire/storage form, e.g. `ERR_GEAR_SANDBOX`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ErrValidation => "ERR_VALIDATION",
            Self::ErrAuth => "ERR_AUTH",
            Self::ErrAuthz => "ERR_AUTHZ",
            Self::ErrNotFound => "ERR_NOT_FOUND",
            Self::ErrConflict => "ERR_CONFLICT",
            Self::ErrTimeout => "ERR_TIMEOUT",
            Self::ErrRateLimit => "ERR_RATE_LIMIT",
            Self::ErrGearSandbox => "ERR_GEAR_SANDBOX",
            Self::ErrLlmProvider => "ERR_LLM_PROVIDER",
            Self::ErrPlanValidation => "ERR_PLAN_VALIDATION",
            Self::ErrSecretAccess => "ERR_SECRET_ACCESS",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
