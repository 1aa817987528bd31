//! Independent plan validator.
//!
//! Sentinel submits the stripped plan to a second model -- preferably from a
//! different provider family than Scout -- and parses the verdict strictly.
//! A response that does not parse is never treated as approval; the caller
//! escalates to user approval instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCode;
use crate::plan::StrippedPlan;
use crate::scout::provider::{CompletionBackend, ProviderError};
use crate::scout::{extract_json_block, strip_reasoning_tags};
use crate::types::{ActionType, TrustProfile};

/// Validator verdict on a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approve,
    Revise,
    Reject,
}

/// Optional per-step note attached to a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerStepVerdict {
    pub step_id: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub note: Option<String>,
}

/// Parsed validator output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorVerdict {
    pub verdict: Verdict,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_step: Option<Vec<PerStepVerdict>>,
}

/// Policy context handed to the validator alongside the stripped plan.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyContext {
    pub trust_profile: TrustProfile,
    pub shell_gear_enabled: bool,
    /// Action types that always require fresh user approval.
    pub hard_floor: Vec<ActionType>,
}

/// Validator failure modes.
#[derive(Debug, Error)]
pub enum ValidatorError {
    /// Transport failure from the backend. Retryable.
    #[error("validator provider error: {0}")]
    Provider(#[from] ProviderError),
    /// The response was not a well-formed verdict. The caller must escalate,
    /// never approve.
    #[error("validator response did not parse: {0}")]
    Parse(String),
}

impl ValidatorError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ErrLlmProvider
    }
}

/// Abstract validator boundary.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Review a stripped plan under the given policy.
    async fn validate(
        &self,
        plan: &StrippedPlan,
        policy: &PolicyContext,
    ) -> Result<ValidatorVerdict, ValidatorError>;

    /// Provider family, for the same-provider warning.
    fn family(&self) -> &'static str;
}

const VALIDATOR_SYSTEM_PROMPT: &str = "\
You are an independent safety reviewer for an automation runtime. You are \
shown a plan of sandboxed tool steps -- only their structure, never the \
planner's narrative. Judge whether the steps are safe and proportionate.

Reply with a single JSON object and nothing else:
{
  \"verdict\": \"approve\" | \"revise\" | \"reject\",
  \"reasoning\": \"one short paragraph\",
  \"perStep\": [ {\"stepId\": \"...\", \"verdict\": \"...\", \"note\": \"...\"} ]
}

Use \"revise\" when the plan could be made acceptable; \"reject\" when it \
should not run in any form.";

/// LLM-backed validator over a completion backend.
pub struct LlmValidator {
    backend: Box<dyn CompletionBackend>,
    max_tokens: u32,
}

impl LlmValidator {
    pub fn new(backend: Box<dyn CompletionBackend>) -> Self {
        Self {
            backend,
            max_tokens: 1_500,
        }
    }

    fn compose_prompt(plan: &StrippedPlan, policy: &PolicyContext) -> String {
        let plan_json =
            serde_json::to_string_pretty(plan).unwrap_or_else(|_| "{}".to_owned());
        let policy_json =
            serde_json::to_string_pretty(policy).unwrap_or_else(|_| "{}".to_owned());
        format!("## Policy\n{policy_json}\n\n## Plan Under Review\n{plan_json}")
    }

    /// Strict parse: raw or fenced JSON with a recognized verdict string.
    pub fn parse_verdict(response: &str) -> Result<ValidatorVerdict, ValidatorError> {
        let cleaned = strip_reasoning_tags(response);
        let trimmed = cleaned.trim();

        let raw = if trimmed.starts_with('{') {
            trimmed
        } else {
            extract_json_block(trimmed)
                .ok_or_else(|| ValidatorError::Parse("no JSON object found".to_owned()))?
        };

        serde_json::from_str::<ValidatorVerdict>(raw)
            .map_err(|e| ValidatorError::Parse(e.to_string()))
    }
}

#[async_trait]
impl Validator for LlmValidator {
    async fn validate(
        &self,
        plan: &StrippedPlan,
        policy: &PolicyContext,
    ) -> Result<ValidatorVerdict, ValidatorError> {
        let prompt = Self::compose_prompt(plan, policy);
        let response = self
            .backend
            .complete(VALIDATOR_SYSTEM_PROMPT, &prompt, self.max_tokens)
            .await?;
        Self::parse_verdict(&response)
    }

    fn family(&self) -> &'static str {
        self.backend.family()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict_approve() {
        let verdict = LlmValidator::parse_verdict(
            r#"{"verdict":"approve","reasoning":"read-only steps"}"#,
        )
        .expect("parse");
        assert_eq!(verdict.verdict, Verdict::Approve);
        assert!(verdict.per_step.is_none());
    }

    #[test]
    fn test_parse_verdict_fenced_with_per_step() {
        let response = r#"Review complete.
```json
{"verdict":"revise","reasoning":"step s2 too broad",
 "perStep":[{"stepId":"s2","verdict":"revise","note":"narrow the path"}]}
```"#;
        let verdict = LlmValidator::parse_verdict(response).expect("parse");
        assert_eq!(verdict.verdict, Verdict::Revise);
        let per_step = verdict.per_step.expect("per step");
        assert_eq!(per_step[0].step_id, "s2");
    }

    #[test]
    fn test_parse_verdict_unknown_string_fails() {
        let result = LlmValidator::parse_verdict(
            r#"{"verdict":"maybe","reasoning":"shrug"}"#,
        );
        assert!(matches!(result, Err(ValidatorError::Parse(_))));
    }

    #[test]
    fn test_parse_verdict_prose_fails() {
        let result = LlmValidator::parse_verdict("Looks fine to me, ship it!");
        assert!(
            matches!(result, Err(ValidatorError::Parse(_))),
            "prose must never be treated as approval"
        );
    }

    #[test]
    fn test_parse_verdict_missing_reasoning_fails() {
        let result = LlmValidator::parse_verdict(r#"{"verdict":"approve"}"#);
        assert!(matches!(result, Err(ValidatorError::Parse(_))));
    }
}
