//! Per-request context: the short-lived scratchpad that travels with a
//! request from ingress to coordinator exit.

use std::collections::HashMap;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::types::GatewayResponse;

/// A plugin's decision to bypass adapter dispatch.
#[derive(Debug, Clone)]
pub enum ShortCircuit {
    Response(GatewayResponse),
    Error(GatewayError),
}

/// The per-request scratchpad. Born at ingress, destroyed at coordinator
/// exit. Plugin-owned values survive from pre-hook to post-hook within the
/// same request.
#[derive(Debug)]
pub struct RequestContext {
    /// Unique request id, allocated at ACCEPTED.
    pub request_id: String,
    /// Cooperative cancellation signal. Every suspension point observes it.
    pub cancel: CancellationToken,
    /// Absolute deadline for the whole request.
    pub deadline: Instant,
    /// Resolved tenant identifiers, populated at GOVERNED.
    pub virtual_key_id: Option<String>,
    pub team_id: Option<String>,
    pub customer_id: Option<String>,
    /// Provider that ultimately served the request, for the log record.
    pub served_by: Option<String>,
    /// Wall-clock start, for latency accounting.
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Plugin-owned key/value map. Keys are plugin-namespaced by
    /// convention (`"<plugin>.<key>"`).
    pub values: HashMap<String, serde_json::Value>,
    /// The short-circuit slot, set by a pre-hook that bypasses dispatch.
    pub short_circuit: Option<ShortCircuit>,
}

impl RequestContext {
    /// Allocate a fresh context with the given deadline.
    pub fn new(deadline: Instant) -> Self {
        Self {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            cancel: CancellationToken::new(),
            deadline,
            virtual_key_id: None,
            team_id: None,
            customer_id: None,
            served_by: None,
            started_at: chrono::Utc::now(),
            values: HashMap::new(),
            short_circuit: None,
        }
    }

    /// Chain this context's cancellation to an ingress token, so a caller
    /// disconnect cancels the request.
    pub fn linked_to(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Whether the request has been cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || Instant::now() >= self.deadline
    }

    /// Time remaining before the deadline, zero if already past.
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Store a plugin-owned value.
    pub fn set_value(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Read a plugin-owned value.
    pub fn get_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_context_values_roundtrip() {
        let mut ctx = RequestContext::new(Instant::now() + Duration::from_secs(30));
        ctx.set_value("cache.hit", serde_json::json!(true));
        assert_eq!(ctx.get_value("cache.hit"), Some(&serde_json::json!(true)));
        assert!(ctx.get_value("missing").is_none());
    }

    #[tokio::test]
    async fn test_context_deadline() {
        let ctx = RequestContext::new(Instant::now());
        assert!(ctx.is_done());
        assert_eq!(ctx.remaining(), Duration::ZERO);

        let ctx = RequestContext::new(Instant::now() + Duration::from_secs(30));
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn test_linked_cancellation() {
        let parent = CancellationToken::new();
        let ctx = RequestContext::new(Instant::now() + Duration::from_secs(30)).linked_to(&parent);
        assert!(!ctx.is_done());
        parent.cancel();
        assert!(ctx.is_done());
    }
}
