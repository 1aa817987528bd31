//! Completion backends for Scout and the Sentinel validator.
//!
//! One [`CompletionBackend`] trait with a tagged configuration selecting the
//! provider family. Anthropic speaks its native `/v1/messages` wire format;
//! OpenAI, OpenRouter and Google share the OpenAI-compatible chat completions
//! format; Ollama speaks `/api/chat`. Callers stay provider-agnostic.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ProviderSettings;
use crate::error::ErrorCode;

const ANTHROPIC_DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENROUTER_DEFAULT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const GOOGLE_DEFAULT_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";
const OLLAMA_DEFAULT_URL: &str = "http://127.0.0.1:11434/api/chat";

/// Provider family, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Google,
    Ollama,
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::Google => "google",
            Self::Ollama => "ollama",
            Self::OpenRouter => "openrouter",
        }
    }

    fn default_url(self) -> &'static str {
        match self {
            Self::Anthropic => ANTHROPIC_DEFAULT_URL,
            Self::OpenAi => OPENAI_DEFAULT_URL,
            Self::Google => GOOGLE_DEFAULT_URL,
            Self::Ollama => OLLAMA_DEFAULT_URL,
            Self::OpenRouter => OPENROUTER_DEFAULT_URL,
        }
    }

    /// Whether this family uses the OpenAI-compatible chat completions wire.
    fn openai_compatible(self) -> bool {
        matches!(self, Self::OpenAi | Self::Google | Self::OpenRouter)
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "google" => Ok(Self::Google),
            "ollama" => Ok(Self::Ollama),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(anyhow::anyhow!("unknown provider: {other}")),
        }
    }
}

/// Errors returned by completion backends.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP transport failure.
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match the expected schema.
    #[error("provider response parse error: {0}")]
    Parse(String),
    /// Upstream provider responded with an error status.
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus {
        status: u16,
        body: String,
    },
    /// Provider cannot satisfy the request with current configuration.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Taxonomy code for this failure.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ErrLlmProvider
    }
}

/// Core completion interface.
///
/// Implementations must be `Send + Sync` so they can be shared across worker
/// tasks.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Request a text completion for a system + user prompt pair.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] on transport, status, or parse failure.
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, ProviderError>;

    /// Provider family name (used to warn when Scout and the validator
    /// coincide).
    fn family(&self) -> &'static str;

    /// Model identifier this backend is configured for.
    fn model_id(&self) -> &str;
}

/// Build a backend from configuration.
///
/// # Errors
///
/// Returns [`ProviderError::Unavailable`] on unknown families or a missing
/// API key for a cloud provider.
pub fn backend_from_settings(
    settings: &ProviderSettings,
) -> Result<Box<dyn CompletionBackend>, ProviderError> {
    let kind: ProviderKind = settings
        .provider
        .parse()
        .map_err(|e| ProviderError::Unavailable(format!("{e}")))?;

    if settings.api_key.is_none() && kind != ProviderKind::Ollama {
        return Err(ProviderError::Unavailable(format!(
            "provider '{}' requires an API key",
            kind.as_str()
        )));
    }

    Ok(Box::new(HttpBackend::new(
        kind,
        settings.model.clone(),
        settings.base_url.clone(),
        settings.api_key.clone(),
    )))
}

/// HTTP-backed completion client covering all provider families.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    kind: ProviderKind,
    model: String,
    url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(
        kind: ProviderKind,
        model: String,
        base_url: Option<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            kind,
            model,
            url: base_url.unwrap_or_else(|| kind.default_url().to_owned()),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    async fn complete_anthropic(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", self.api_key.as_deref().unwrap_or_default())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        let Some(content) = parsed.get("content").and_then(Value::as_array) else {
            return Err(ProviderError::Parse("missing content array".to_owned()));
        };
        let mut text = String::new();
        for item in content {
            if item.get("type").and_then(Value::as_str) == Some("text") {
                text.push_str(item.get("text").and_then(Value::as_str).unwrap_or_default());
            }
        }
        Ok(text)
    }

    async fn complete_openai_compatible(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": max_tokens,
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(self.api_key.as_deref().unwrap_or_default())
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| ProviderError::Parse("missing choices[0].message.content".to_owned()))
    }

    async fn complete_ollama(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
            "stream": false,
            "options": {"num_predict": max_tokens},
        });

        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let payload = check_http_response(response).await?;
        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| ProviderError::Parse(e.to_string()))?;

        parsed
            .get("message")
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| ProviderError::Parse("missing message.content".to_owned()))
    }
}

#[async_trait]
impl CompletionBackend for HttpBackend {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, ProviderError> {
        if self.kind.openai_compatible() {
            self.complete_openai_compatible(system, prompt, max_tokens)
                .await
        } else if self.kind == ProviderKind::Anthropic {
            self.complete_anthropic(system, prompt, max_tokens).await
        } else {
            self.complete_ollama(system, prompt, max_tokens).await
        }
    }

    fn family(&self) -> &'static str {
        self.kind.as_str()
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns `ProviderError::Request` on transport failure,
/// `ProviderError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, ProviderError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(ProviderError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"sk-or-[A-Za-z0-9_\-]{10,}",
        r"AIza[A-Za-z0-9_\-]{20,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(
            "anthropic".parse::<ProviderKind>().expect("parse"),
            ProviderKind::Anthropic
        );
        assert_eq!(
            "OpenRouter".parse::<ProviderKind>().expect("parse"),
            ProviderKind::OpenRouter
        );
        assert!("bedrock".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_openai_compatible_families() {
        assert!(ProviderKind::OpenAi.openai_compatible());
        assert!(ProviderKind::Google.openai_compatible());
        assert!(ProviderKind::OpenRouter.openai_compatible());
        assert!(!ProviderKind::Anthropic.openai_compatible());
        assert!(!ProviderKind::Ollama.openai_compatible());
    }

    #[test]
    fn test_backend_requires_key_for_cloud() {
        let settings = ProviderSettings {
            provider: "anthropic".to_owned(),
            model: "claude-sonnet-4-20250514".to_owned(),
            base_url: None,
            api_key: None,
        };
        assert!(matches!(
            backend_from_settings(&settings),
            Err(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn test_backend_ollama_needs_no_key() {
        let settings = ProviderSettings {
            provider: "ollama".to_owned(),
            model: "llama3".to_owned(),
            base_url: None,
            api_key: None,
        };
        let backend = backend_from_settings(&settings).expect("build");
        assert_eq!(backend.family(), "ollama");
        assert_eq!(backend.model_id(), "llama3");
    }

    #[test]
    fn test_error_body_sanitized() {
        let body = "error sk-ant-abcdefghijklmnop secret";
        let sanitized = sanitize_http_error_body(body);
        assert!(!sanitized.contains("sk-ant-abcdefghijklmnop"));
        assert!(sanitized.contains("[REDACTED]"));
    }

    #[test]
    fn test_error_body_truncated() {
        let body = "x".repeat(1000);
        let sanitized = sanitize_http_error_body(&body);
        assert!(sanitized.ends_with("...[truncated]"));
    }

    #[test]
    fn test_provider_error_code() {
        let err = ProviderError::Parse("bad".to_owned());
        assert_eq!(err.code(), ErrorCode::ErrLlmProvider);
    }
}
