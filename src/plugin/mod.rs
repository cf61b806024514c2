//! The plugin contract and pipeline.
//!
//! Plugins wrap every request symmetrically: `pre_hook`s run in ordinal
//! order before dispatch, `post_hook`s run in reverse order after, and for
//! every pre-hook that ran the matching post-hook is guaranteed to run —
//! under short-circuits, plugin failures, timeouts, and cancellations.
//! Native and WASM plugins share this contract.

mod pipeline;
#[cfg(feature = "wasm")]
pub mod wasm;

pub use pipeline::PluginPipeline;
pub(crate) use pipeline::PrePhase;

use crate::error::GatewayResult;
use crate::types::{GatewayRequest, GatewayResponse, RequestContext, StreamChunk};

/// What a pre-hook tells the pipeline to do next.
#[derive(Debug)]
pub enum PreHookOutcome {
    /// Proceed with the (possibly mutated) request.
    Continue(GatewayRequest),
    /// Skip dispatch; this response is the result.
    ShortCircuitResponse(GatewayResponse),
    /// Skip dispatch; this error is the result.
    ShortCircuitError(crate::error::GatewayError),
}

/// The final result flowing through post-hooks.
pub type HookResult = Result<GatewayResponse, crate::error::GatewayError>;

/// An HTTP call surfaced to transport-aware plugins.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HttpCall {
    pub method: String,
    pub url: String,
    pub headers: std::collections::HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

/// The plugin contract. Implement any subset of the hooks; defaults are
/// pass-through.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// One-time setup with the descriptor's config blob.
    async fn init(&self, config: &serde_json::Value) -> GatewayResult<()> {
        let _ = config;
        Ok(())
    }

    /// Teardown at shutdown.
    async fn cleanup(&self) -> GatewayResult<()> {
        Ok(())
    }

    /// Runs before dispatch. An `Err` is a plugin failure: it
    /// short-circuits unless the plugin is marked advisory.
    async fn pre_hook(
        &self,
        ctx: &mut RequestContext,
        request: GatewayRequest,
    ) -> GatewayResult<PreHookOutcome> {
        let _ = ctx;
        Ok(PreHookOutcome::Continue(request))
    }

    /// Runs after dispatch (or short-circuit) over the final result. An
    /// `Err` is logged and swallowed; it never prevents delivery.
    async fn post_hook(
        &self,
        ctx: &mut RequestContext,
        result: HookResult,
    ) -> GatewayResult<HookResult> {
        let _ = ctx;
        Ok(result)
    }

    /// Inspect or rewrite an outbound HTTP call. Only invoked by
    /// transport-aware hosts.
    async fn http_intercept(
        &self,
        ctx: &mut RequestContext,
        call: HttpCall,
    ) -> GatewayResult<HttpCall> {
        let _ = ctx;
        Ok(call)
    }

    /// Runs for every streaming chunk, in ordinal order. `Ok(None)` drops
    /// the chunk; `Ok(Some)` forwards (possibly replaced); `Err`
    /// terminates the stream with that error.
    async fn stream_chunk_hook(
        &self,
        ctx: &mut RequestContext,
        chunk: StreamChunk,
    ) -> GatewayResult<Option<StreamChunk>> {
        let _ = ctx;
        Ok(Some(chunk))
    }
}
