//! Content provenance tagging.
//!
//! Any non-user content (tool output, fetched web pages, email bodies,
//! documents) is wrapped in an attributed `<external_content>` tag before it
//! reaches the planner, marking it as DATA rather than instructions. The
//! body is sanitized so embedded text cannot escape the tag.
//!
//! Provenance is a layered soft mitigation behind structured plans,
//! independent review, and the sandbox. It is explicitly not a security
//! boundary.

use std::sync::OnceLock;

use regex::Regex;

/// Trust attributed to wrapped content. Non-user sources default to
/// [`Trust::Untrusted`]; only user content may instruct the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    Untrusted,
    Trusted,
}

impl Trust {
    fn as_str(self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::Trusted => "trusted",
        }
    }
}

impl Default for Trust {
    fn default() -> Self {
        Self::Untrusted
    }
}

/// Provenance attributes carried on the wrapper tag.
#[derive(Debug, Clone)]
pub struct Provenance {
    /// Where the content came from (e.g. `gear:http`, `email:inbox`).
    pub source: String,
    /// Optional originating identity (e.g. an email sender).
    pub sender: Option<String>,
    /// Trust mark; defaults to untrusted.
    pub trust: Trust,
}

impl Provenance {
    /// Untrusted content from the given source.
    pub fn untrusted(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            sender: None,
            trust: Trust::Untrusted,
        }
    }

    /// Attach a sender identity.
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

/// Wrap external content in an attributed provenance tag.
///
/// Attribute values are escaped and the body is sanitized with
/// [`sanitize_body`] so the content cannot close (or reopen) the tag.
pub fn wrap_external(body: &str, provenance: &Provenance) -> String {
    let source = escape_attr(&provenance.source);
    let sender = provenance
        .sender
        .as_deref()
        .map(|s| format!(" sender=\"{}\"", escape_attr(s)))
        .unwrap_or_default();
    let trust = provenance.trust.as_str();
    let safe_body = sanitize_body(body);
    format!(
        "<external_content source=\"{source}\"{sender} trust=\"{trust}\">{safe_body}</external_content>"
    )
}

/// Entity-encode any occurrence of the wrapper tag inside a body.
///
/// After sanitization the text contains no literal `</external_content>` or
/// `<external_content` substring in any case or spacing variant, so wrapped
/// content cannot terminate its own tag.
pub fn sanitize_body(body: &str) -> String {
    static TAG_ESCAPE: OnceLock<Regex> = OnceLock::new();
    let re = TAG_ESCAPE.get_or_init(|| {
        Regex::new(r"(?i)<\s*(/?)\s*external_content")
            .expect("provenance sanitizer pattern is valid")
    });
    re.replace_all(body, "&lt;${1}external_content").into_owned()
}

/// Escape a string for use inside a double-quoted attribute value.
fn escape_attr(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
