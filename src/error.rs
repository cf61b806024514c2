//! Error types for the gateway core.
//!
//! Every error that leaves the core carries a stable kind, a human-readable
//! message, an optional provider-supplied code, an HTTP status hint, and a
//! retryability bit. The transport boundary serializes errors into the
//! OpenAI-compatible envelope via [`GatewayError::envelope`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request (empty model, unknown operation, bad payload).
    Validation,
    /// A governance budget rejected the request.
    BudgetExceeded,
    /// A governance rate limit rejected the request.
    RateLimited,
    /// Retryable upstream failure (network blip, 429 with retry-after, 5xx).
    ProviderTransient,
    /// Non-retryable upstream failure (auth, model-not-found, bad request).
    ProviderPermanent,
    /// A plugin hook failed or short-circuited with an error.
    Plugin,
    /// The request was cancelled by the caller.
    Cancelled,
    /// The request deadline elapsed.
    Timeout,
    /// A coordinator invariant failed. Never leaks provider details.
    Internal,
}

impl ErrorKind {
    /// Stable string tag used in logs and the transport envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ProviderTransient => "provider_transient",
            ErrorKind::ProviderPermanent => "provider_permanent",
            ErrorKind::Plugin => "plugin",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }

    /// Default HTTP status hint for this kind.
    pub fn status_hint(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::BudgetExceeded => 402,
            ErrorKind::RateLimited => 429,
            ErrorKind::ProviderTransient => 503,
            ErrorKind::ProviderPermanent => 400,
            ErrorKind::Plugin => 500,
            ErrorKind::Cancelled => 499,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether attempts carrying this kind may be retried locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::ProviderTransient)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error shape every core operation returns.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    /// Tagged kind; sticky across post-hooks.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Provider-supplied error code, when one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_code: Option<String>,
    /// Explicit HTTP status from the upstream, if any. Falls back to the
    /// kind's hint in [`GatewayError::status`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Retryability bit. Usually derived from the kind, but adapters may
    /// flip it (a 429 with retry-after is transient even though the status
    /// looks like a client error).
    pub retryable: bool,
}

impl GatewayError {
    /// Build an error of the given kind with the kind's default
    /// retryability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider_code: None,
            status_code: None,
            retryable: kind.is_retryable(),
        }
    }

    /// Malformed request.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Budget admission failure.
    pub fn budget_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BudgetExceeded, message)
    }

    /// Rate-limit admission failure.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    /// Retryable upstream failure.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderTransient, message)
    }

    /// Non-retryable upstream failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderPermanent, message)
    }

    /// Upstream auth failure. Permanent for the attempt, but the key pool
    /// uses it as the signal to degrade the key and rotate.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderPermanent, message).with_status(401)
    }

    /// Plugin-originated failure.
    pub fn plugin(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Plugin, message)
    }

    /// Caller cancelled the request.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "request cancelled")
    }

    /// Deadline elapsed.
    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "request deadline exceeded")
    }

    /// Coordinator invariant failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach a provider-supplied error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    /// Attach an explicit upstream HTTP status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    /// Override the retryability bit.
    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Effective HTTP status: the upstream status when present, otherwise
    /// the kind's hint.
    pub fn status(&self) -> u16 {
        self.status_code.unwrap_or_else(|| self.kind.status_hint())
    }

    /// Whether this error looks like an upstream auth/quota failure on a
    /// specific key. Drives key degradation and rotation.
    pub fn is_auth(&self) -> bool {
        matches!(self.status_code, Some(401) | Some(403))
            || self
                .provider_code
                .as_deref()
                .map(|c| c.contains("invalid_api_key") || c.contains("insufficient_quota"))
                .unwrap_or(false)
    }

    /// OpenAI-compatible error envelope for the transport boundary:
    /// `{ "error": { "message", "type", "code" }, "status_code" }`.
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "message": self.message,
                "type": self.kind.as_str(),
                "code": self.provider_code,
            },
            "status_code": self.status(),
        })
    }
}

/// Result alias used throughout the core.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Map an upstream HTTP status into an error with the right kind and
/// retryability. Shared by every HTTP-speaking adapter.
pub fn error_from_status(status: u16, body: &str) -> GatewayError {
    let message = if body.is_empty() {
        format!("upstream returned HTTP {}", status)
    } else {
        format!("upstream returned HTTP {}: {}", status, body)
    };
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/code")
                .or_else(|| v.pointer("/error/type"))
                .and_then(|c| c.as_str().map(String::from))
        });

    let mut err = match status {
        401 | 403 => GatewayError::permanent(message),
        429 => GatewayError::transient(message),
        s if s >= 500 => GatewayError::transient(message),
        _ => GatewayError::permanent(message),
    }
    .with_status(status);
    if let Some(code) = code {
        err = err.with_code(code);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_hints() {
        assert_eq!(GatewayError::validation("x").status(), 400);
        assert_eq!(GatewayError::budget_exceeded("x").status(), 402);
        assert_eq!(GatewayError::rate_limited("x").status(), 429);
        assert_eq!(GatewayError::transient("x").status(), 503);
        assert_eq!(GatewayError::timeout().status(), 504);
        assert_eq!(GatewayError::internal("x").status(), 500);
    }

    #[test]
    fn test_retryability() {
        assert!(GatewayError::transient("x").retryable);
        assert!(!GatewayError::permanent("x").retryable);
        assert!(!GatewayError::validation("x").retryable);
        assert!(GatewayError::permanent("x").retryable(true).retryable);
    }

    #[test]
    fn test_auth_detection() {
        assert!(GatewayError::auth("bad key").is_auth());
        assert!(GatewayError::permanent("quota")
            .with_code("insufficient_quota")
            .is_auth());
        assert!(!GatewayError::transient("blip").is_auth());
    }

    #[test]
    fn test_error_from_status() {
        let err = error_from_status(429, "slow down");
        assert_eq!(err.kind, ErrorKind::ProviderTransient);
        assert!(err.retryable);

        let err = error_from_status(500, "");
        assert_eq!(err.kind, ErrorKind::ProviderTransient);

        let err = error_from_status(404, r#"{"error":{"code":"model_not_found"}}"#);
        assert_eq!(err.kind, ErrorKind::ProviderPermanent);
        assert_eq!(err.provider_code.as_deref(), Some("model_not_found"));
    }

    #[test]
    fn test_envelope_shape() {
        let err = GatewayError::rate_limited("too many requests").with_code("rl");
        let env = err.envelope();
        assert_eq!(env["error"]["type"], "rate_limited");
        assert_eq!(env["error"]["code"], "rl");
        assert_eq!(env["status_code"], 429);
    }
}
