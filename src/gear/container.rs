//! Level 3 sandbox: container-backed execution with hardening defaults.
//!
//! Containers are launched read-only with no network, tmpfs `/tmp` and
//! `/secrets`, the workspace mounted read-only, memory/cpu/pids limits,
//! `no-new-privileges`, and auto-removal on exit. Names are deterministic
//! (`meridian-gear-<gear>-<job>-<step>`) so a crashed run can be found in
//! engine logs. Engine availability is probed once at startup and cached.
//!
//! The request frame is passed via `MERIDIAN_REQUEST`; the container prints
//! one JSON response line to stdout.

use std::collections::HashMap;

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use serde::Deserialize;
use tokio_stream::StreamExt;

use crate::config::SandboxConfig;

use super::context::GearContext;
use super::{container_name, GearError, GearManifest, ResourceLimits};

/// Response frame printed by the container.
#[derive(Debug, Deserialize)]
struct WireResponse {
    ok: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Container engine handle, present only when the probe succeeded.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    docker: Docker,
    default_image: String,
    workspace_dir: std::path::PathBuf,
}

impl ContainerRuntime {
    /// Probe the local container engine; `None` when unreachable.
    pub async fn probe(config: &SandboxConfig) -> Option<Self> {
        let docker = Docker::connect_with_local_defaults().ok()?;
        docker.ping().await.ok()?;
        Some(Self {
            docker,
            default_image: config.image.clone(),
            workspace_dir: config.workspace_dir.clone(),
        })
    }

    /// Run one action to completion inside a hardened container.
    pub async fn execute(
        &self,
        manifest: &GearManifest,
        action: &str,
        params: &serde_json::Value,
        secrets: &HashMap<String, String>,
        limits: ResourceLimits,
        ctx: &GearContext,
    ) -> Result<serde_json::Value, GearError> {
        let name = container_name(&manifest.id, ctx.job_id, &ctx.step_id);
        let image = manifest.image.as_deref().unwrap_or(&self.default_image);

        let request = serde_json::json!({ "action": action, "parameters": params });
        let env = build_env(&request, secrets)?;
        let config = build_container_config(
            image,
            manifest.entry.as_deref(),
            &self.workspace_dir,
            &limits,
            env,
        );

        // A stale container from a crashed run blocks the deterministic name.
        let _ = self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| GearError::Sandbox(format!("create container: {e}")))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| GearError::Sandbox(format!("start container: {e}")))?;

        // Attach logs before waiting; auto-remove reaps the container on
        // exit, so logs must stream while it runs.
        let mut log_stream = self.docker.logs(
            &name,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let collect = async {
            let mut stdout = String::new();
            while let Some(chunk) = log_stream.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            stdout
        };

        let stdout = match tokio::time::timeout(limits.timeout, collect).await {
            Ok(output) => output,
            Err(_) => {
                let _ = self
                    .docker
                    .remove_container(
                        &name,
                        Some(RemoveContainerOptions {
                            force: true,
                            ..Default::default()
                        }),
                    )
                    .await;
                return Err(GearError::Timeout(limits.timeout));
            }
        };

        // Reap the exit status; with auto-remove the wait may race removal.
        let mut wait = self
            .docker
            .wait_container(&name, None::<WaitContainerOptions<String>>);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), wait.next()).await;

        parse_response(&stdout)
    }
}

/// Build the environment for the container: request frame plus secrets.
fn build_env(
    request: &serde_json::Value,
    secrets: &HashMap<String, String>,
) -> Result<Vec<String>, GearError> {
    let frame = serde_json::to_string(request)
        .map_err(|e| GearError::Protocol(format!("request encode: {e}")))?;
    let mut env = vec![format!("MERIDIAN_REQUEST={frame}")];
    for (name, value) in secrets {
        env.push(format!("MERIDIAN_SECRET_{}={value}", name.to_uppercase()));
    }
    Ok(env)
}

/// Container configuration with the hardening defaults.
pub fn build_container_config(
    image: &str,
    entry: Option<&str>,
    workspace_dir: &std::path::Path,
    limits: &ResourceLimits,
    env: Vec<String>,
) -> ContainerConfig<String> {
    let memory_bytes = i64::from(limits.max_memory_mb)
        .saturating_mul(1024)
        .saturating_mul(1024);
    let nano_cpus = i64::from(limits.max_cpu_percent).saturating_mul(10_000_000);

    let mut tmpfs: HashMap<String, String> = HashMap::new();
    tmpfs.insert("/tmp".to_owned(), "rw,size=256m".to_owned());
    tmpfs.insert("/secrets".to_owned(), "rw,size=1m".to_owned());

    let host_config = HostConfig {
        network_mode: Some("none".to_owned()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_owned()]),
        security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
        pids_limit: Some(limits.pids_limit),
        memory: Some(memory_bytes),
        nano_cpus: Some(nano_cpus),
        auto_remove: Some(true),
        binds: Some(vec![format!("{}:/workspace:ro", workspace_dir.display())]),
        tmpfs: Some(tmpfs),
        ..Default::default()
    };

    let cmd = entry.map(|e| vec!["sh".to_owned(), "-c".to_owned(), e.to_owned()]);

    ContainerConfig {
        image: Some(image.to_owned()),
        cmd,
        env: Some(env),
        working_dir: Some("/workspace".to_owned()),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Parse the last non-empty stdout line as the response frame.
fn parse_response(stdout: &str) -> Result<serde_json::Value, GearError> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| {
            GearError::Protocol("container produced no response frame".to_owned())
        })?;

    let response: WireResponse = serde_json::from_str(line.trim())
        .map_err(|e| GearError::Protocol(format!("response decode: {e}")))?;

    if response.ok {
        Ok(response.result.unwrap_or(serde_json::Value::Null))
    } else {
        Err(GearError::Failed(
            response.error.unwrap_or_else(|| "unspecified gear failure".to_owned()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_memory_mb: 512,
            max_cpu_percent: 150,
            timeout: Duration::from_secs(60),
            pids_limit: 128,
        }
    }

    #[test]
    fn test_hardening_defaults() {
        let config = build_container_config(
            "meridian-gear:latest",
            Some("run-gear"),
            Path::new("/srv/meridian/workspace"),
            &limits(),
            vec!["MERIDIAN_REQUEST={}".to_owned()],
        );

        let host = config.host_config.expect("host config");
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_owned()]));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_owned()])
        );
        assert_eq!(host.pids_limit, Some(128));
        assert_eq!(host.memory, Some(536_870_912));
        assert_eq!(host.nano_cpus, Some(1_500_000_000));
        assert_eq!(host.auto_remove, Some(true));

        let binds = host.binds.expect("binds");
        assert!(binds[0].ends_with(":/workspace:ro"), "workspace is read-only");

        let tmpfs = host.tmpfs.expect("tmpfs");
        assert!(tmpfs.contains_key("/tmp"));
        assert!(tmpfs.contains_key("/secrets"));

        assert_eq!(
            config.cmd,
            Some(vec!["sh".to_owned(), "-c".to_owned(), "run-gear".to_owned()])
        );
    }

    #[test]
    fn test_env_carries_request_and_secrets() {
        let mut secrets = HashMap::new();
        secrets.insert("api_key".to_owned(), "k-9".to_owned());
        let env = build_env(&serde_json::json!({"action": "go"}), &secrets).expect("env");

        assert!(env.iter().any(|e| e.starts_with("MERIDIAN_REQUEST=")));
        assert!(env.contains(&"MERIDIAN_SECRET_API_KEY=k-9".to_owned()));
    }

    #[test]
    fn test_parse_response_last_line_wins() {
        let stdout = "progress 10%\nprogress 90%\n{\"ok\":true,\"result\":{\"n\":3}}\n";
        let result = parse_response(stdout).expect("parse");
        assert_eq!(result["n"], 3);
    }

    #[test]
    fn test_parse_response_failure_and_garbage() {
        let err = parse_response("{\"ok\":false,\"error\":\"oom\"}").expect_err("failure");
        assert!(matches!(err, GearError::Failed(msg) if msg == "oom"));

        let err = parse_response("not json at all").expect_err("garbage");
        assert!(matches!(err, GearError::Protocol(_)));

        let err = parse_response("\n\n").expect_err("empty");
        assert!(matches!(err, GearError::Protocol(_)));
    }
}
