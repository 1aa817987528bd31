//! Capability context granted to gear executions.
//!
//! A gear sees only the capabilities its manifest grants: workspace-rooted
//! file access, HTTP fetch, logging/progress, sub-job creation, and (when
//! explicitly allowed and enabled) host command execution. Sub-job creation
//! is a capability handle, not a reference to the orchestrator, so the
//! gear/scheduler dependency stays one-way.
//!
//! Secrets are resolved by the sandbox itself (see [`SecretStore`]); they
//! are injected into the sandbox environment and never pass through here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::JobPriority;

use super::GearError;

/// Opaque secret value that never appears in logs.
///
/// Debug output always shows `__REDACTED__`.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value. Use only at the injection point.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Secret storage boundary. Only the sandbox resolves secrets; gears name
/// them in their manifest and receive the values inside the sandbox only.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve a secret by name; `None` when absent.
    async fn resolve(&self, name: &str) -> Option<SecretValue>;
}

/// In-memory secret store (tests, env-seeded deployments).
#[derive(Default)]
pub struct InMemorySecrets {
    values: RwLock<HashMap<String, SecretValue>>,
}

impl InMemorySecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, name: impl Into<String>, value: SecretValue) {
        self.values.write().await.insert(name.into(), value);
    }
}

#[async_trait]
impl SecretStore for InMemorySecrets {
    async fn resolve(&self, name: &str) -> Option<SecretValue> {
        self.values.read().await.get(name).cloned()
    }
}

/// Capability handle for creating sub-jobs without holding the orchestrator.
#[async_trait]
pub trait SubJobSpawner: Send + Sync {
    /// Queue a new job sourced from the running one; returns its id.
    async fn create_sub_job(
        &self,
        parent_job: Uuid,
        request: String,
        priority: JobPriority,
    ) -> Result<Uuid, GearError>;
}

/// Outcome of a host command run through the exec capability.
#[derive(Debug, Clone)]
pub struct HostExecResult {
    /// Exit code; `None` when killed.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Progress signal emitted by a running step.
#[derive(Debug, Clone)]
pub struct Progress {
    pub step_id: String,
    pub message: String,
    /// 0..=100 when known.
    pub percent: Option<u8>,
}

/// Capability context for one execution.
///
/// File operations are rooted at the workspace; path traversal outside it is
/// refused with a sandbox error.
pub struct GearContext {
    pub job_id: Uuid,
    pub step_id: String,
    workspace: PathBuf,
    http: reqwest::Client,
    spawner: Option<Arc<dyn SubJobSpawner>>,
    progress_tx: Option<tokio::sync::mpsc::Sender<Progress>>,
    host_exec_allowed: bool,
}

impl GearContext {
    pub fn new(job_id: Uuid, step_id: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            job_id,
            step_id: step_id.into(),
            workspace: workspace.into(),
            http: reqwest::Client::new(),
            spawner: None,
            progress_tx: None,
            host_exec_allowed: false,
        }
    }

    /// Grant the host-exec capability (manifest-gated; the runtime also
    /// checks the shell master switch before granting it).
    pub fn with_host_exec(mut self) -> Self {
        self.host_exec_allowed = true;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn SubJobSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_progress(mut self, tx: tokio::sync::mpsc::Sender<Progress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Read a workspace file.
    pub async fn read_file(&self, relative: &str) -> Result<String, GearError> {
        let path = self.workspace_path(relative)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| GearError::Sandbox(format!("read {}: {e}", path.display())))
    }

    /// Write a workspace file, creating parent directories.
    pub async fn write_file(&self, relative: &str, contents: &str) -> Result<(), GearError> {
        let path = self.workspace_path(relative)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GearError::Sandbox(format!("mkdir {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| GearError::Sandbox(format!("write {}: {e}", path.display())))
    }

    /// Fetch a URL and return the body text.
    pub async fn fetch(&self, url: &str) -> Result<String, GearError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| GearError::Sandbox(format!("fetch {url}: {e}")))?;
        response
            .text()
            .await
            .map_err(|e| GearError::Sandbox(format!("fetch body {url}: {e}")))
    }

    /// Structured log line attributed to the running step.
    pub fn log(&self, message: &str) {
        tracing::info!(job_id = %self.job_id, step_id = %self.step_id, "{message}");
    }

    /// Emit a progress update; dropped silently when nobody listens.
    pub async fn progress(&self, message: impl Into<String>, percent: Option<u8>) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx
                .send(Progress {
                    step_id: self.step_id.clone(),
                    message: message.into(),
                    percent,
                })
                .await;
        }
    }

    /// Create a sub-job via the capability handle.
    ///
    /// # Errors
    ///
    /// Fails when the manifest did not grant the capability.
    pub async fn create_sub_job(
        &self,
        request: String,
        priority: JobPriority,
    ) -> Result<Uuid, GearError> {
        let spawner = self.spawner.as_ref().ok_or_else(|| {
            GearError::Forbidden("gear has no sub-job capability".to_owned())
        })?;
        spawner.create_sub_job(self.job_id, request, priority).await
    }

    /// Run a host command from inside the workspace.
    ///
    /// Only available when the manifest grants host execution and the shell
    /// gear master switch is on; everyone else gets `Forbidden`.
    pub async fn exec_host(&self, command: &str, timeout: std::time::Duration) -> Result<HostExecResult, GearError> {
        if !self.host_exec_allowed {
            return Err(GearError::Forbidden(
                "gear has no host-exec capability".to_owned(),
            ));
        }

        let mut child = tokio::process::Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GearError::Sandbox(format!("spawn host command: {e}")))?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| GearError::Sandbox(format!("host command: {e}")))?
            }
            Err(_) => return Err(GearError::Timeout(timeout)),
        };

        Ok(HostExecResult {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Resolve a relative path inside the workspace, refusing traversal.
    fn workspace_path(&self, relative: &str) -> Result<PathBuf, GearError> {
        let candidate = Path::new(relative);
        if candidate.is_absolute()
            || candidate
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(GearError::Sandbox(format!(
                "path escapes the workspace: {relative}"
            )));
        }
        Ok(self.workspace.join(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_value_debug_redacted() {
        let secret = SecretValue::new("hunter2");
        assert_eq!(format!("{secret:?}"), "__REDACTED__");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[tokio::test]
    async fn test_in_memory_secrets() {
        let store = InMemorySecrets::new();
        store.put("api_key", SecretValue::new("k-123")).await;
        let value = store.resolve("api_key").await.expect("present");
        assert_eq!(value.expose(), "k-123");
        assert!(store.resolve("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_workspace_file_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path());

        ctx.write_file("out/result.txt", "forty-two")
            .await
            .expect("write");
        let read = ctx.read_file("out/result.txt").await.expect("read");
        assert_eq!(read, "forty-two");
    }

    #[tokio::test]
    async fn test_path_traversal_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path());

        let err = ctx.read_file("../outside.txt").await.expect_err("refused");
        assert!(matches!(err, GearError::Sandbox(_)));

        let err = ctx
            .write_file("/etc/shadow", "nope")
            .await
            .expect_err("refused");
        assert!(matches!(err, GearError::Sandbox(_)));
    }

    #[tokio::test]
    async fn test_sub_job_without_capability_forbidden() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path());
        let err = ctx
            .create_sub_job("follow-up".to_owned(), JobPriority::Normal)
            .await
            .expect_err("no capability");
        assert!(matches!(err, GearError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_progress_without_listener_is_silent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path());
        ctx.progress("halfway", Some(50)).await;
    }

    #[tokio::test]
    async fn test_host_exec_forbidden_by_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path());
        let err = ctx
            .exec_host("true", std::time::Duration::from_secs(5))
            .await
            .expect_err("no capability");
        assert!(matches!(err, GearError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_host_exec_with_grant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path()).with_host_exec();
        let result = ctx
            .exec_host("echo hello", std::time::Duration::from_secs(5))
            .await
            .expect("run");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_host_exec_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path()).with_host_exec();
        let err = ctx
            .exec_host("sleep 600", std::time::Duration::from_millis(100))
            .await
            .expect_err("times out");
        assert!(matches!(err, GearError::Timeout(_)));
    }
}
