//! Gear -- the sandboxed tool runtime.
//!
//! Executes one tool action under enforced limits. Three isolation levels,
//! selected by the gear's manifest:
//!
//! - **Level 1** (in-process): trusted built-ins, timeout only.
//! - **Level 2** (isolated process): child with a stripped environment, a
//!   closed stdin/stdout JSON protocol, memory/CPU quotas and a wall-clock
//!   timeout.
//! - **Level 3** (container): read-only rootfs, no network, tmpfs `/tmp` and
//!   `/secrets`, read-only workspace mount, memory/cpu/pids limits,
//!   `no-new-privileges`, auto-removed, deterministically named.
//!
//! Credential injection happens here, by secret name: the plan never sees
//! credential material.

pub mod container;
pub mod context;
pub mod inprocess;
pub mod process;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::ErrorCode;
use container::ContainerRuntime;
use context::{GearContext, SecretStore};
use inprocess::BuiltinRegistry;

/// Isolation tier for one gear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxLevel {
    /// Trusted built-in running in the worker process.
    InProcess,
    /// Isolated child process.
    Process,
    /// Container.
    Container,
}

/// One action a gear exposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GearAction {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Resource limit overrides in a manifest; unset fields fall back to the
/// sandbox defaults from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitOverrides {
    pub max_memory_mb: Option<u32>,
    pub max_cpu_percent: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub pids_limit: Option<i64>,
}

/// Effective limits for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_memory_mb: u32,
    pub max_cpu_percent: u32,
    pub timeout: Duration,
    pub pids_limit: i64,
}

impl ResourceLimits {
    /// Merge manifest overrides over the configured defaults.
    pub fn resolve(defaults: &SandboxConfig, overrides: Option<&LimitOverrides>) -> Self {
        let o = overrides.cloned().unwrap_or_default();
        Self {
            max_memory_mb: o.max_memory_mb.unwrap_or(defaults.max_memory_mb),
            max_cpu_percent: o.max_cpu_percent.unwrap_or(defaults.max_cpu_percent),
            timeout: Duration::from_millis(o.timeout_ms.unwrap_or(defaults.timeout_ms)),
            pids_limit: o.pids_limit.unwrap_or(defaults.pids_limit),
        }
    }
}

/// Gear manifest: identity, isolation level, actions, limits, secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GearManifest {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub level: SandboxLevel,
    pub actions: Vec<GearAction>,
    /// Command to launch for Level 2 gears.
    #[serde(default)]
    pub entry: Option<String>,
    /// Image override for Level 3 gears.
    #[serde(default)]
    pub image: Option<String>,
    /// Secret names the sandbox injects on demand.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub limits: Option<LimitOverrides>,
    /// Whether this gear may run host commands through its context.
    #[serde(default)]
    pub allow_host_exec: bool,
}

impl GearManifest {
    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.name == action)
    }
}

/// Gear failure modes.
#[derive(Debug, Error)]
pub enum GearError {
    /// Wall-clock timeout.
    #[error("gear execution timed out after {0:?}")]
    Timeout(Duration),
    /// Limit violation or sandbox startup failure.
    #[error("sandbox failure: {0}")]
    Sandbox(String),
    /// stdin/stdout protocol framing error (Level 2) or output decode error.
    #[error("sandbox protocol error: {0}")]
    Protocol(String),
    /// Secret resolution or injection failed.
    #[error("secret access failed: {0}")]
    Secret(String),
    /// The manifest does not expose the requested action.
    #[error("gear '{gear}' has no action '{action}'")]
    ActionNotFound {
        gear: String,
        action: String,
    },
    /// The action is disabled by policy (e.g. shell gear switched off).
    #[error("execution forbidden: {0}")]
    Forbidden(String),
    /// The tool itself reported a failure.
    #[error("gear reported failure: {0}")]
    Failed(String),
}

impl GearError {
    /// Taxonomy code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::ErrTimeout,
            Self::Sandbox(_) | Self::Protocol(_) | Self::Failed(_) => ErrorCode::ErrGearSandbox,
            Self::Secret(_) => ErrorCode::ErrSecretAccess,
            Self::ActionNotFound { .. } => ErrorCode::ErrNotFound,
            Self::Forbidden(_) => ErrorCode::ErrAuthz,
        }
    }
}

/// The sandbox runtime: dispatches one execution to the right level.
pub struct GearRuntime {
    defaults: SandboxConfig,
    builtins: BuiltinRegistry,
    /// Present when a container engine was probed successfully at startup.
    container: Option<ContainerRuntime>,
    secrets: std::sync::Arc<dyn SecretStore>,
    shell_gear_enabled: bool,
}

impl GearRuntime {
    /// Build the runtime; probes container availability once and caches it.
    pub async fn new(
        defaults: SandboxConfig,
        builtins: BuiltinRegistry,
        secrets: std::sync::Arc<dyn SecretStore>,
        shell_gear_enabled: bool,
    ) -> Self {
        let container = ContainerRuntime::probe(&defaults).await;
        if container.is_none() {
            tracing::warn!("container engine unavailable; Level 3 gears will fail");
        }
        Self {
            defaults,
            builtins,
            container,
            secrets,
            shell_gear_enabled,
        }
    }

    /// Runtime without a container probe (tests, Level 1/2 only).
    pub fn without_containers(
        defaults: SandboxConfig,
        builtins: BuiltinRegistry,
        secrets: std::sync::Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            defaults,
            builtins,
            container: None,
            secrets,
            shell_gear_enabled: false,
        }
    }

    /// Whether Level 3 isolation is available.
    pub fn containers_available(&self) -> bool {
        self.container.is_some()
    }

    /// Execute one action under the manifest's isolation level and limits.
    ///
    /// # Errors
    ///
    /// All limit violations, startup failures and protocol errors surface as
    /// [`GearError`] with code `ERR_GEAR_SANDBOX`; deadline overruns as
    /// `ERR_TIMEOUT`; secret failures as `ERR_SECRET_ACCESS`.
    pub async fn execute(
        &self,
        manifest: &GearManifest,
        action: &str,
        params: &serde_json::Value,
        ctx: &GearContext,
    ) -> Result<serde_json::Value, GearError> {
        if !manifest.has_action(action) {
            return Err(GearError::ActionNotFound {
                gear: manifest.id.clone(),
                action: action.to_owned(),
            });
        }
        if manifest.allow_host_exec && !self.shell_gear_enabled {
            return Err(GearError::Forbidden(
                "shell gear is disabled by configuration".to_owned(),
            ));
        }

        let limits = ResourceLimits::resolve(&self.defaults, manifest.limits.as_ref());
        let secrets = self.resolve_secrets(manifest).await?;

        tracing::info!(
            gear = %manifest.id,
            action,
            level = ?manifest.level,
            timeout_ms = u64::try_from(limits.timeout.as_millis()).unwrap_or(u64::MAX),
            "dispatching gear execution"
        );

        match manifest.level {
            SandboxLevel::InProcess => {
                self.builtins
                    .execute(manifest, action, params, ctx, limits)
                    .await
            }
            SandboxLevel::Process => {
                process::execute(manifest, action, params, &secrets, limits).await
            }
            SandboxLevel::Container => match &self.container {
                Some(runtime) => {
                    runtime
                        .execute(manifest, action, params, &secrets, limits, ctx)
                        .await
                }
                None => Err(GearError::Sandbox(
                    "container engine is not available".to_owned(),
                )),
            },
        }
    }

    /// Resolve the manifest's secret names. The resolved values go straight
    /// into the sandbox environment; callers never see them.
    async fn resolve_secrets(
        &self,
        manifest: &GearManifest,
    ) -> Result<HashMap<String, String>, GearError> {
        let mut resolved = HashMap::with_capacity(manifest.secrets.len());
        for name in &manifest.secrets {
            let value = self.secrets.resolve(name).await.ok_or_else(|| {
                GearError::Secret(format!("secret '{name}' is not available"))
            })?;
            resolved.insert(name.clone(), value.expose().to_owned());
        }
        Ok(resolved)
    }
}

/// Deterministic container name for forensics:
/// `meridian-gear-<gear>-<job>-<step>`.
pub fn container_name(gear: &str, job_id: Uuid, step_id: &str) -> String {
    let safe: String = gear
        .chars()
        .chain("-".chars())
        .chain(step_id.chars())
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("meridian-gear-{safe}-{job_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_resolution() {
        let defaults = SandboxConfig::default();
        let resolved = ResourceLimits::resolve(&defaults, None);
        assert_eq!(resolved.max_memory_mb, defaults.max_memory_mb);

        let overrides = LimitOverrides {
            max_memory_mb: Some(64),
            timeout_ms: Some(1_000),
            ..Default::default()
        };
        let resolved = ResourceLimits::resolve(&defaults, Some(&overrides));
        assert_eq!(resolved.max_memory_mb, 64);
        assert_eq!(resolved.timeout, Duration::from_secs(1));
        assert_eq!(resolved.pids_limit, defaults.pids_limit);
    }

    #[test]
    fn test_container_name_deterministic_and_safe() {
        let job = Uuid::nil();
        let name = container_name("web/scraper", job, "s 1");
        assert_eq!(
            name,
            format!("meridian-gear-web-scraper-s-1-{job}")
        );
        assert_eq!(name, container_name("web/scraper", job, "s 1"));
    }

    #[test]
    fn test_gear_error_codes() {
        assert_eq!(
            GearError::Timeout(Duration::from_secs(1)).code(),
            ErrorCode::ErrTimeout
        );
        assert_eq!(
            GearError::Sandbox("boom".to_owned()).code(),
            ErrorCode::ErrGearSandbox
        );
        assert_eq!(
            GearError::Protocol("framing".to_owned()).code(),
            ErrorCode::ErrGearSandbox
        );
        assert_eq!(
            GearError::Secret("missing".to_owned()).code(),
            ErrorCode::ErrSecretAccess
        );
    }
}
