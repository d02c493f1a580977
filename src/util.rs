//! Shared utility functions.

use std::future::Future;
use std::time::Duration;

use regex::Regex;
use std::sync::LazyLock;
use tokio::time::timeout;

use crate::{Error, Result};

/// Await `fut`, mapping an elapsed deadline to `Error::Timeout`.
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(inner) => inner,
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Regex for `{{name}}` template placeholders
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap()
});

/// Names of the `{{name}}` placeholders in a template, in order.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Substitute `{{name}}` placeholders using `lookup`; unknown names render empty.
pub fn render_template<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    PLACEHOLDER_RE
        .replace_all(template, |c: &regex::Captures<'_>| {
            lookup(&c[1]).unwrap_or_default()
        })
        .into_owned()
}

/// Render a JSON value as plain text, without quotes for strings.
pub fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
