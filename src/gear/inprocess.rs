//! Level 1 sandbox: trusted built-ins in the worker process.
//!
//! Built-ins are registered at startup and run under the wall-clock timeout
//! only; they are trusted code, so no process isolation applies.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::context::GearContext;
use super::{GearError, GearManifest, ResourceLimits};

/// Boxed future returned by a built-in.
pub type BuiltinFuture<'a> =
    Pin<Box<dyn Future<Output = Result<serde_json::Value, GearError>> + Send + 'a>>;

/// A trusted built-in action implementation.
pub trait Builtin: Send + Sync {
    /// Execute the action with the given parameters and capabilities.
    fn call<'a>(
        &'a self,
        action: &'a str,
        params: &'a serde_json::Value,
        ctx: &'a GearContext,
    ) -> BuiltinFuture<'a>;
}

/// Registry of Level 1 built-ins keyed by gear id.
#[derive(Default)]
pub struct BuiltinRegistry {
    builtins: HashMap<String, Arc<dyn Builtin>>,
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a built-in gear implementation.
    pub fn register(&mut self, gear_id: impl Into<String>, builtin: Arc<dyn Builtin>) {
        self.builtins.insert(gear_id.into(), builtin);
    }

    /// Execute a built-in under the wall-clock timeout.
    pub async fn execute(
        &self,
        manifest: &GearManifest,
        action: &str,
        params: &serde_json::Value,
        ctx: &GearContext,
        limits: ResourceLimits,
    ) -> Result<serde_json::Value, GearError> {
        let builtin = self.builtins.get(&manifest.id).ok_or_else(|| {
            GearError::Sandbox(format!("no built-in registered for gear '{}'", manifest.id))
        })?;

        tokio::time::timeout(limits.timeout, builtin.call(action, params, ctx))
            .await
            .map_err(|_| GearError::Timeout(limits.timeout))?
    }
}

/// Built-in file gear: read/write/list inside the workspace.
pub struct FilesBuiltin;

impl Builtin for FilesBuiltin {
    fn call<'a>(
        &'a self,
        action: &'a str,
        params: &'a serde_json::Value,
        ctx: &'a GearContext,
    ) -> BuiltinFuture<'a> {
        Box::pin(async move {
            let path = params
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| GearError::Failed("missing 'path' parameter".to_owned()))?;

            match action {
                "read" => {
                    let contents = ctx.read_file(path).await?;
                    Ok(serde_json::json!({ "path": path, "contents": contents }))
                }
                "write" => {
                    let contents = params
                        .get("contents")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    ctx.write_file(path, contents).await?;
                    Ok(serde_json::json!({ "path": path, "bytes": contents.len() }))
                }
                other => Err(GearError::ActionNotFound {
                    gear: "files".to_owned(),
                    action: other.to_owned(),
                }),
            }
        })
    }
}

/// Built-in HTTP gear: GET a URL through the context's fetch capability.
pub struct HttpBuiltin;

impl Builtin for HttpBuiltin {
    fn call<'a>(
        &'a self,
        action: &'a str,
        params: &'a serde_json::Value,
        ctx: &'a GearContext,
    ) -> BuiltinFuture<'a> {
        Box::pin(async move {
            match action {
                "get" => {
                    let url = params
                        .get("url")
                        .and_then(|v| v.as_str())
                        .ok_or_else(|| GearError::Failed("missing 'url' parameter".to_owned()))?;
                    let body = ctx.fetch(url).await?;
                    Ok(serde_json::json!({ "url": url, "body": body }))
                }
                other => Err(GearError::ActionNotFound {
                    gear: "http".to_owned(),
                    action: other.to_owned(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gear::{GearAction, SandboxLevel};
    use std::time::Duration;
    use uuid::Uuid;

    fn files_manifest() -> GearManifest {
        GearManifest {
            id: "files".to_owned(),
            description: "workspace files".to_owned(),
            level: SandboxLevel::InProcess,
            actions: vec![
                GearAction {
                    name: "read".to_owned(),
                    description: String::new(),
                },
                GearAction {
                    name: "write".to_owned(),
                    description: String::new(),
                },
            ],
            entry: None,
            image: None,
            secrets: Vec::new(),
            limits: None,
            allow_host_exec: false,
        }
    }

    fn limits(timeout: Duration) -> ResourceLimits {
        ResourceLimits {
            max_memory_mb: 64,
            max_cpu_percent: 100,
            timeout,
            pids_limit: 16,
        }
    }

    #[tokio::test]
    async fn test_files_builtin_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path());

        let mut registry = BuiltinRegistry::new();
        registry.register("files", Arc::new(FilesBuiltin));

        let manifest = files_manifest();
        let written = registry
            .execute(
                &manifest,
                "write",
                &serde_json::json!({"path": "a.txt", "contents": "hi"}),
                &ctx,
                limits(Duration::from_secs(5)),
            )
            .await
            .expect("write");
        assert_eq!(written["bytes"], 2);

        let read = registry
            .execute(
                &manifest,
                "read",
                &serde_json::json!({"path": "a.txt"}),
                &ctx,
                limits(Duration::from_secs(5)),
            )
            .await
            .expect("read");
        assert_eq!(read["contents"], "hi");
    }

    #[tokio::test]
    async fn test_unregistered_gear_is_sandbox_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path());
        let registry = BuiltinRegistry::new();

        let err = registry
            .execute(
                &files_manifest(),
                "read",
                &serde_json::json!({"path": "a.txt"}),
                &ctx,
                limits(Duration::from_secs(5)),
            )
            .await
            .expect_err("no builtin");
        assert!(matches!(err, GearError::Sandbox(_)));
    }

    /// Built-in that never resolves, for timeout coverage.
    struct StallBuiltin;

    impl Builtin for StallBuiltin {
        fn call<'a>(
            &'a self,
            _action: &'a str,
            _params: &'a serde_json::Value,
            _ctx: &'a GearContext,
        ) -> BuiltinFuture<'a> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(serde_json::Value::Null)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = GearContext::new(Uuid::nil(), "s1", dir.path());

        let mut registry = BuiltinRegistry::new();
        registry.register("files", Arc::new(StallBuiltin));

        let err = registry
            .execute(
                &files_manifest(),
                "read",
                &serde_json::json!({"path": "a.txt"}),
                &ctx,
                limits(Duration::from_millis(50)),
            )
            .await
            .expect_err("must time out");
        assert!(matches!(err, GearError::Timeout(_)));
    }
}
