//! Level 2 sandbox: isolated child process.
//!
//! The gear's entry command runs as a child with a stripped environment and
//! a closed stdin/stdout JSON protocol: one request object in, one response
//! object out. Memory and CPU quotas are applied through a `ulimit` wrapper;
//! the wall-clock timeout kills the child on overrun.
//!
//! Secrets are injected as `MERIDIAN_SECRET_<NAME>` environment variables
//! visible only inside the child.

use std::collections::HashMap;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use super::{GearError, GearManifest, ResourceLimits};

/// Minimal PATH for the stripped environment.
const SANDBOX_PATH: &str = "/usr/bin:/bin";

/// Request frame written to the child's stdin.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    action: &'a str,
    parameters: &'a serde_json::Value,
}

/// Response frame expected on the child's stdout.
#[derive(Debug, Deserialize)]
struct WireResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Execute one action in an isolated child process.
///
/// # Errors
///
/// `ERR_GEAR_SANDBOX` on spawn/limit/protocol failures, `ERR_TIMEOUT` on
/// wall-clock overrun (the child is killed).
pub async fn execute(
    manifest: &GearManifest,
    action: &str,
    params: &serde_json::Value,
    secrets: &HashMap<String, String>,
    limits: ResourceLimits,
) -> Result<serde_json::Value, GearError> {
    let entry = manifest.entry.as_deref().ok_or_else(|| {
        GearError::Sandbox(format!(
            "gear '{}' is Level 2 but has no entry command",
            manifest.id
        ))
    })?;

    let memory_kb = u64::from(limits.max_memory_mb).saturating_mul(1024);
    let cpu_secs = cpu_quota_secs(&limits);
    let wrapped = format!("ulimit -v {memory_kb} -t {cpu_secs}; {entry}");

    let mut command = Command::new("bash");
    command
        .arg("-c")
        .arg(wrapped)
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (name, value) in secrets {
        command.env(format!("MERIDIAN_SECRET_{}", name.to_uppercase()), value);
    }

    let mut child = command
        .spawn()
        .map_err(|e| GearError::Sandbox(format!("failed to spawn gear process: {e}")))?;

    // One request in, then close stdin so the child sees EOF.
    let request = WireRequest {
        action,
        parameters: params,
    };
    let frame = serde_json::to_string(&request)
        .map_err(|e| GearError::Protocol(format!("request encode: {e}")))?;
    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GearError::Sandbox("child stdin unavailable".to_owned()))?;
        stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| GearError::Protocol(format!("request write: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| GearError::Protocol(format!("request write: {e}")))?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| GearError::Sandbox("child stdout unavailable".to_owned()))?;
    let mut lines = BufReader::new(stdout).lines();

    let response_line = match tokio::time::timeout(limits.timeout, lines.next_line()).await {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            let _ = child.wait().await;
            return Err(GearError::Protocol(
                "child closed stdout without a response frame".to_owned(),
            ));
        }
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(GearError::Protocol(format!("response read: {e}")));
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(GearError::Timeout(limits.timeout));
        }
    };

    // The protocol is one frame each way; reap the child afterwards.
    let _ = child.wait().await;

    let response: WireResponse = serde_json::from_str(&response_line)
        .map_err(|e| GearError::Protocol(format!("response decode: {e}")))?;

    if response.ok {
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    } else {
        Err(GearError::Failed(
            response.error.unwrap_or_else(|| "unspecified gear failure".to_owned()),
        ))
    }
}

/// CPU-time quota derived from the wall clock budget and the CPU percentage.
fn cpu_quota_secs(limits: &ResourceLimits) -> u64 {
    let wall_secs = limits.timeout.as_secs().max(1);
    wall_secs
        .saturating_mul(u64::from(limits.max_cpu_percent))
        .checked_div(100)
        .unwrap_or(wall_secs)
        .max(1)
}
