//! Secret redaction for anything shown to operators.
//!
//! Two shapes are masked with [`REDACTED`]:
//! - credential assignments such as `token=abc` or `password: hunter2`
//! - long opaque alphanumeric runs (20+ characters), which is what API keys,
//!   session cookies and bearer tokens look like in error messages

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

pub const REDACTED: &str = "[REDACTED]";

static CREDENTIAL_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(api[_-]?key|access[_-]?token|refresh[_-]?token|token|secret|password|passwd|pwd|cookie|session(?:[_-]?id)?|auth(?:orization)?|bearer)(\s*[=:]\s*)("[^"]*"|'[^']*'|[^\s,;&]+)"#,
    )
    .unwrap()
});

// Unanchored: `_` is a word character, so `\b` would miss `sk_live_<token>`.
static LONG_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9]{20,}").unwrap());

/// Mask secrets in `text`.
#[must_use]
pub fn redact(text: &str) -> Cow<'_, str> {
    let pairs = CREDENTIAL_PAIR.replace_all(text, |caps: &regex::Captures<'_>| {
        format!("{}{}{REDACTED}", &caps[1], &caps[2])
    });
    if LONG_TOKEN.is_match(&pairs) {
        Cow::Owned(LONG_TOKEN.replace_all(&pairs, REDACTED).into_owned())
    } else {
        pairs
    }
}

/// Whether `text` contains anything [`redact`] would mask.
#[must_use]
pub fn contains_secret(text: &str) -> bool {
    CREDENTIAL_PAIR.is_match(text) || LONG_TOKEN.is_match(text)
}
