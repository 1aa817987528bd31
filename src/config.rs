//! Configuration loading and management.
//!
//! Loads Meridian configuration from `./meridian.toml` (or
//! `$MERIDIAN_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::TrustProfile;

// ── Top-level config ────────────────────────────────────────────

/// Top-level Meridian configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    /// Runtime core settings.
    pub runtime: RuntimeConfig,
    /// Per-gear circuit breaker tuning.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Schedule evaluator polling.
    pub schedule_evaluator: ScheduleEvaluatorConfig,
    /// Cooperative-loop watchdog thresholds.
    pub watchdog: WatchdogConfig,
    /// Sandbox defaults applied when a gear manifest is silent.
    pub sandbox: SandboxConfig,
    /// Trust profile and the shell master switch.
    pub trust: TrustConfig,
    /// LLM provider selection for planner and validator.
    pub llm: LlmConfig,
    /// TLS block consumed by the transport collaborator; the core stores it
    /// untouched.
    pub tls: TlsConfig,
}

impl MeridianConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$MERIDIAN_CONFIG_PATH` or `./meridian.toml`.
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: MeridianConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(MeridianConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    fn config_path() -> PathBuf {
        std::env::var("MERIDIAN_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("meridian.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        fn parse_into<T: std::str::FromStr>(slot: &mut T, var: &str, value: &str) {
            match value.parse() {
                Ok(v) => *slot = v,
                Err(_) => tracing::warn!(
                    var,
                    value,
                    "ignoring invalid env override"
                ),
            }
        }

        if let Some(v) = env("MERIDIAN_DB_PATH") {
            self.runtime.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("MERIDIAN_LOGS_DIR") {
            self.runtime.logs_dir = PathBuf::from(v);
        }
        if let Some(v) = env("MERIDIAN_WORKERS") {
            parse_into(&mut self.runtime.workers, "MERIDIAN_WORKERS", &v);
        }
        if let Some(v) = env("MERIDIAN_TRUST_PROFILE") {
            parse_into(&mut self.trust.profile, "MERIDIAN_TRUST_PROFILE", &v);
        }
        if let Some(v) = env("MERIDIAN_SHELL_GEAR_ENABLED") {
            parse_into(
                &mut self.trust.shell_gear_enabled,
                "MERIDIAN_SHELL_GEAR_ENABLED",
                &v,
            );
        }
        if let Some(v) = env("MERIDIAN_SANDBOX_IMAGE") {
            self.sandbox.image = v;
        }

        // Planner provider (env var presence selects the provider).
        if let Some(key) = env("MERIDIAN_ANTHROPIC_API_KEY") {
            self.llm.planner.api_key = Some(key.clone());
            if self.llm.planner.provider.is_empty() {
                self.llm.planner.provider = "anthropic".to_owned();
            }
            if self.llm.planner.model.is_empty() {
                self.llm.planner.model = default_anthropic_model();
            }
            // The validator should prefer a different provider family; only
            // fill it when nothing else is configured.
            if self.llm.validator.api_key.is_none() && self.llm.validator.provider.is_empty() {
                self.llm.validator.api_key = Some(key);
                self.llm.validator.provider = "anthropic".to_owned();
                self.llm.validator.model = default_anthropic_model();
            }
        }
        if let Some(key) = env("MERIDIAN_OPENAI_API_KEY") {
            if self.llm.validator.provider.is_empty() || self.llm.validator.provider == "anthropic"
            {
                self.llm.validator.provider = "openai".to_owned();
                self.llm.validator.api_key = Some(key);
                self.llm.validator.model = default_openai_model();
            }
        }
        if let Some(url) = env("MERIDIAN_OLLAMA_URL") {
            self.llm.planner.base_url = Some(url);
        }
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: MeridianConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Runtime ─────────────────────────────────────────────────────

/// Core runtime settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Directory for rotated JSON logs.
    pub logs_dir: PathBuf,
    /// Number of pipeline workers.
    pub workers: usize,
    /// Worker heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Maximum plan revision round-trips before a job fails.
    pub max_plan_revisions: u32,
    /// Timeout for a single planner call, in milliseconds.
    pub planner_timeout_ms: u64,
    /// Timeout for a single validator call, in milliseconds.
    pub validator_timeout_ms: u64,
    /// Timeout for a human approval decision, in milliseconds.
    pub approval_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("meridian.db"),
            logs_dir: default_data_dir().join("logs"),
            workers: 2,
            heartbeat_interval_ms: 5_000,
            max_plan_revisions: 2,
            planner_timeout_ms: 120_000,
            validator_timeout_ms: 60_000,
            approval_timeout_ms: 300_000,
        }
    }
}

// ── Circuit breaker ─────────────────────────────────────────────

/// Per-gear circuit breaker tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window before the circuit opens.
    pub failure_threshold: usize,
    /// Sliding failure window in milliseconds.
    pub window_ms: i64,
    /// Time the circuit stays open before a half-open probe is allowed.
    pub cooldown_ms: i64,
    /// Consecutive half-open probe successes required to close.
    pub half_open_successes_to_close: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            half_open_successes_to_close: 1,
        }
    }
}

// ── Schedule evaluator ──────────────────────────────────────────

/// Schedule evaluator polling cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleEvaluatorConfig {
    /// Poll interval for the `schedules` table, in milliseconds.
    pub interval_ms: u64,
}

impl Default for ScheduleEvaluatorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
        }
    }
}

// ── Watchdog ────────────────────────────────────────────────────

/// Cooperative-loop watchdog thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Observed loop lag above this emits a diagnostic dump.
    pub block_threshold_ms: u64,
    /// Sampling interval.
    pub check_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            block_threshold_ms: 250,
            check_interval_ms: 1_000,
        }
    }
}

// ── Sandbox ─────────────────────────────────────────────────────

/// Sandbox defaults applied when a gear manifest is silent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Memory ceiling in megabytes.
    pub max_memory_mb: u32,
    /// CPU ceiling as a percentage of one core.
    pub max_cpu_percent: u32,
    /// Wall-clock timeout per step, in milliseconds.
    pub timeout_ms: u64,
    /// Process count ceiling (Level 3).
    pub pids_limit: i64,
    /// Container image for Level 3 gears.
    pub image: String,
    /// Workspace directory mounted (read-only) into containers.
    pub workspace_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_percent: 100,
            timeout_ms: 120_000,
            pids_limit: 128,
            image: "meridian-gear:latest".to_owned(),
            workspace_dir: PathBuf::from("workspace"),
        }
    }
}

// ── Trust ───────────────────────────────────────────────────────

/// Trust profile and the shell master switch.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    /// Which non-hard-floor actions auto-approve.
    pub profile: TrustProfile,
    /// Master switch for the shell gear. The hard floor still applies when
    /// enabled.
    pub shell_gear_enabled: bool,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            profile: TrustProfile::Supervised,
            shell_gear_enabled: false,
        }
    }
}

// ── LLM providers ───────────────────────────────────────────────

/// Planner/validator provider selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider used by Scout to produce plans.
    pub planner: ProviderSettings,
    /// Provider used by Sentinel's independent validator. Should differ from
    /// the planner's family; a warning is logged when they coincide.
    pub validator: ProviderSettings,
}

/// One provider endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    /// Provider family: anthropic | openai | google | ollama | openrouter.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Base URL override (defaults per provider).
    pub base_url: Option<String>,
    /// API key; usually injected via environment.
    pub api_key: Option<String>,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            base_url: None,
            api_key: None,
        }
    }
}

fn default_openai_model() -> String {
    "gpt-4o".to_owned()
}

fn default_anthropic_model() -> String {
    "claude-sonnet-4-20250514".to_owned()
}

/// Per-user data directory (`~/.local/share/meridian` on Linux), falling
/// back to the working directory.
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "meridian")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

// ── TLS passthrough ─────────────────────────────────────────────

/// TLS settings consumed by the transport collaborator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub min_version: String,
    pub hsts: bool,
    pub hsts_max_age: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_path: None,
            key_path: None,
            min_version: "1.2".to_owned(),
            hsts: false,
            hsts_max_age: 31_536_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrustProfile;

    #[test]
    fn test_defaults() {
        let config = MeridianConfig::default();
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.half_open_successes_to_close, 1);
        assert_eq!(config.trust.profile, TrustProfile::Supervised);
        assert!(!config.trust.shell_gear_enabled);
        assert_eq!(config.watchdog.check_interval_ms, 1_000);
    }

    #[test]
    fn test_from_toml_partial() {
        let config = MeridianConfig::from_toml(
            r#"
            [circuit_breaker]
            failure_threshold = 3
            window_ms = 10000

            [trust]
            profile = "balanced"
            shell_gear_enabled = true

            [sandbox]
            max_memory_mb = 256
            "#,
        )
        .expect("parse");

        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.window_ms, 10_000);
        // Unspecified fields keep defaults.
        assert_eq!(config.circuit_breaker.cooldown_ms, 30_000);
        assert_eq!(config.trust.profile, TrustProfile::Balanced);
        assert!(config.trust.shell_gear_enabled);
        assert_eq!(config.sandbox.max_memory_mb, 256);
        assert_eq!(config.sandbox.pids_limit, 128);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MeridianConfig::default();
        config.apply_overrides(|key| match key {
            "MERIDIAN_WORKERS" => Some("4".to_owned()),
            "MERIDIAN_TRUST_PROFILE" => Some("autonomous".to_owned()),
            _ => None,
        });
        assert_eq!(config.runtime.workers, 4);
        assert_eq!(config.trust.profile, TrustProfile::Autonomous);
    }

    #[test]
    fn test_invalid_env_override_ignored() {
        let mut config = MeridianConfig::default();
        config.apply_overrides(|key| match key {
            "MERIDIAN_WORKERS" => Some("not-a-number".to_owned()),
            _ => None,
        });
        assert_eq!(config.runtime.workers, 2, "invalid override keeps default");
    }

    #[test]
    fn test_tls_block_parses() {
        let config = MeridianConfig::from_toml(
            r#"
            [tls]
            enabled = true
            cert_path = "/etc/meridian/cert.pem"
            key_path = "/etc/meridian/key.pem"
            min_version = "1.3"
            hsts = true
            "#,
        )
        .expect("parse");
        assert!(config.tls.enabled);
        assert_eq!(config.tls.min_version, "1.3");
        assert!(config.tls.hsts);
    }
}
