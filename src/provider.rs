//! Shared plumbing for key-authenticated HTTP providers.
//!
//! Maps HTTP statuses and transport failures onto the [`RagError`]
//! taxonomy so the embedding and generation clients classify failures the
//! same way: 401/403 → authentication, 429 → rate limit, timeouts and 5xx
//! → retryable provider errors, everything else → provider error.

use std::time::Duration;

use tracing::debug;

use crate::error::RagError;

/// Key value the host uses to say "no key configured".
const UNAVAILABLE_KEY: &str = "NA";

/// Pre-flight sanity check on a provider key. Not a security guarantee:
/// the provider still validates the key on first use.
pub fn check_key(api_key: Option<&str>, prefix: &str) -> Result<String, RagError> {
    let key = api_key.map(str::trim).unwrap_or("");
    if key.is_empty() || key == UNAVAILABLE_KEY {
        return Err(RagError::auth("no provider API key available"));
    }
    if !key.starts_with(prefix) {
        return Err(RagError::auth(format!(
            "provider API key must start with '{}'",
            prefix
        )));
    }
    Ok(key.to_string())
}

pub(crate) fn build_client(timeout_secs: u64) -> Result<reqwest::Client, RagError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Builds a provider's own error variant from a message and whether the
/// failure is transient.
pub(crate) type ProviderError = fn(String, bool) -> RagError;

/// Map a non-success HTTP status to an error. `other` builds the error
/// for statuses without a dedicated variant.
pub(crate) fn map_http_error(
    status: reqwest::StatusCode,
    body: &str,
    other: ProviderError,
) -> RagError {
    let detail = provider_message(body).unwrap_or_else(|| truncate(body, 300));
    match status.as_u16() {
        401 | 403 => {
            debug!(status = %status, "provider rejected credentials");
            RagError::auth(format!("provider rejected the API key ({}): {}", status, detail))
        }
        429 => RagError::RateLimit {
            message: format!("{}: {}", status, detail),
        },
        s if s >= 500 => other(format!("provider server error ({}): {}", status, detail), true),
        _ => other(format!("HTTP {}: {}", status, detail), false),
    }
}

pub(crate) fn map_transport_error(
    err: reqwest::Error,
    timeout_secs: u64,
    other: ProviderError,
) -> RagError {
    if err.is_timeout() {
        other(format!("request timed out after {}s", timeout_secs), true)
    } else {
        other(format!("request failed: {}", err), false)
    }
}

/// OpenAI-style error bodies carry `{"error": {"message": ...}}`.
fn provider_message(body: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()?
        .get("error")?
        .get("message")?
        .as_str()
        .map(|s| s.to_string())
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

pub(crate) fn embedding_failure(message: String, retryable: bool) -> RagError {
    RagError::Embedding { message, retryable }
}

pub(crate) fn generation_failure(message: String, retryable: bool) -> RagError {
    RagError::Generation { message, retryable }
}

/// A permanent embedding failure, such as a malformed response.
pub(crate) fn embedding_error(message: String) -> RagError {
    embedding_failure(message, false)
}

pub(crate) fn generation_error(message: String) -> RagError {
    generation_failure(message, false)
}
