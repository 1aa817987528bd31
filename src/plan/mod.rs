//! Execution plan model.
//!
//! Canonical data shape for plans produced by Scout and reviewed by
//! Sentinel. Structural validity is enforced at parse time: step ids are
//! unique, `dependsOn` references resolve, the dependency graph is acyclic,
//! and parameters are finite JSON. The [`StrippedPlan`] projection is what
//! the independent validator sees -- free-form reasoning and descriptions are
//! withheld so its judgment cannot be anchored by the planner's narrative.

pub mod provenance;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::types::RiskLevel;

/// Plan validation errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The plan JSON did not deserialize.
    #[error("plan does not match schema: {0}")]
    Schema(String),
    /// A step id appears more than once.
    #[error("duplicate step id: {0}")]
    DuplicateStepId(String),
    /// A step id is empty.
    #[error("step id must be non-empty")]
    EmptyStepId,
    /// `dependsOn` references a step id that does not exist.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        step: String,
        dependency: String,
    },
    /// A step depends on itself.
    #[error("step '{0}' depends on itself")]
    SelfDependency(String),
    /// The dependency graph contains a cycle.
    #[error("dependency cycle involving step '{0}'")]
    Cycle(String),
    /// Parameters contain a non-finite number.
    #[error("step '{0}' has non-finite parameters")]
    NonFiniteParameters(String),
}

impl PlanError {
    /// Taxonomy code for this failure.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ErrPlanValidation
    }
}

/// One sandboxed action the planner proposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStep {
    /// Step id, unique within the plan.
    pub id: String,
    /// Target gear (tool) id.
    pub gear: String,
    /// Action name within the gear.
    pub action: String,
    /// Action arguments as a finite JSON value.
    pub parameters: serde_json::Value,
    /// The planner's own risk estimate. Sentinel re-derives risk and records
    /// a divergence anomaly when the two disagree by more than one level.
    pub risk_level: RiskLevel,
    /// Optional human-readable description (stripped before validation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Optional ordering hint within the same dependency rank.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    /// Step ids that must complete before this step runs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// A structured set of sandboxed actions proposed by the planner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Plan id.
    pub id: Uuid,
    /// Job this plan belongs to. Plans never outlive their job.
    pub job_id: Uuid,
    /// Proposed steps; a DAG over step ids via `dependsOn`.
    pub steps: Vec<ExecutionStep>,
    /// The planner's free-form reasoning (stripped before validation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// When set, the final result is not written back to the journal.
    #[serde(default)]
    pub journal_skip: bool,
}

impl ExecutionPlan {
    /// Parse and structurally validate a plan from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] (code `ERR_PLAN_VALIDATION`) on schema mismatch,
    /// duplicate/unknown/self/cyclic dependencies, or non-finite parameters.
    pub fn from_json(raw: &str) -> Result<Self, PlanError> {
        let plan: ExecutionPlan =
            serde_json::from_str(raw).map_err(|e| PlanError::Schema(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Structural validation: unique non-empty ids, resolvable dependencies,
    /// acyclic graph, finite parameters.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut ids: HashSet<&str> = HashSet::with_capacity(self.steps.len());
        for step in &self.steps {
            if step.id.is_empty() {
                return Err(PlanError::EmptyStepId);
            }
            if !ids.insert(step.id.as_str()) {
                return Err(PlanError::DuplicateStepId(step.id.clone()));
            }
            if !is_finite_json(&step.parameters) {
                return Err(PlanError::NonFiniteParameters(step.id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(PlanError::SelfDependency(step.id.clone()));
                }
                if !ids.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Cycle check doubles as the execution order; discard the order here.
        self.topological_order().map(|_| ())
    }

    /// Steps in dependency order (Kahn's algorithm). Within the same rank,
    /// the `order` hint breaks ties, then plan position.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] when the graph is not a DAG.
    pub fn topological_order(&self) -> Result<Vec<&ExecutionStep>, PlanError> {
        let index_of: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(&d) = index_of.get(dep.as_str()) {
                    in_degree[i] = in_degree[i].saturating_add(1);
                    dependents[d].push(i);
                }
            }
        }

        let sort_key = |i: usize| {
            let step = &self.steps[i];
            (step.order.unwrap_or(u32::MAX), i)
        };

        let mut ready: Vec<usize> = (0..self.steps.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();
        ready.sort_by_key(|&i| sort_key(i));
        let mut queue: VecDeque<usize> = ready.into();

        let mut ordered = Vec::with_capacity(self.steps.len());
        while let Some(i) = queue.pop_front() {
            ordered.push(&self.steps[i]);
            let mut newly_ready = Vec::new();
            for &next in &dependents[i] {
                in_degree[next] = in_degree[next].saturating_sub(1);
                if in_degree[next] == 0 {
                    newly_ready.push(next);
                }
            }
            newly_ready.sort_by_key(|&i| sort_key(i));
            queue.extend(newly_ready);
        }

        if ordered.len() != self.steps.len() {
            let stuck = self
                .steps
                .iter()
                .enumerate()
                .find(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.id.clone())
                .unwrap_or_default();
            return Err(PlanError::Cycle(stuck));
        }
        Ok(ordered)
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Projection handed to the independent validator.
    pub fn stripped(&self) -> StrippedPlan {
        StrippedPlan {
            steps: self
                .steps
                .iter()
                .map(|s| StrippedStep {
                    id: s.id.clone(),
                    gear: s.gear.clone(),
                    action: s.action.clone(),
                    parameters: s.parameters.clone(),
                    risk_level: s.risk_level,
                    depends_on: s.depends_on.clone(),
                })
                .collect(),
        }
    }
}

/// Validator-visible projection of a plan.
///
/// Preserves exactly `steps[].{id, gear, action, parameters, riskLevel,
/// dependsOn}`; reasoning, descriptions and ordering hints never reach the
/// validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrippedPlan {
    pub steps: Vec<StrippedStep>,
}

/// One step as the validator sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrippedStep {
    pub id: String,
    pub gear: String,
    pub action: String,
    pub parameters: serde_json::Value,
    pub risk_level: RiskLevel,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

/// Recursively check that every number in a JSON value is finite.
fn is_finite_json(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(f64::is_finite).unwrap_or(true),
        serde_json::Value::Array(items) => items.iter().all(is_finite_json),
        serde_json::Value::Object(map) => map.values().all(is_finite_json),
        _ => true,
    }
}
