//! Ordinal-ordered plugin pipeline with symmetric pre/post execution.

use std::sync::Arc;

use crate::config::PluginDescriptor;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{GatewayRequest, RequestContext, ShortCircuit, StreamChunk};

use super::{HookResult, HttpCall, Plugin, PreHookOutcome};

struct PluginEntry {
    plugin: Arc<dyn Plugin>,
    descriptor: PluginDescriptor,
}

/// The outcome of the pre-hook phase.
pub(crate) enum PrePhase {
    /// Dispatch with this request. Carries the indices of plugins whose
    /// pre-hook ran, for the symmetric post-hook pass.
    Proceed(GatewayRequest, Vec<usize>),
    /// A plugin short-circuited; skip dispatch.
    ShortCircuited(HookResult, Vec<usize>),
}

/// The ordered plugin stack. Built once per config snapshot; immutable to
/// request threads.
#[derive(Default)]
pub struct PluginPipeline {
    entries: Vec<PluginEntry>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin with its descriptor. Entries are sorted by ordinal at
    /// [`PluginPipeline::seal`].
    pub fn register(&mut self, plugin: Arc<dyn Plugin>, descriptor: PluginDescriptor) {
        self.entries.push(PluginEntry { plugin, descriptor });
    }

    /// Sort by ordinal and drop disabled entries. Called once at build.
    pub fn seal(&mut self) {
        self.entries.retain(|e| e.descriptor.enabled);
        self.entries.sort_by_key(|e| e.descriptor.ordinal);
    }

    /// Number of active plugins.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Initialize every plugin with its config blob.
    pub async fn init_all(&self) -> GatewayResult<()> {
        for entry in &self.entries {
            entry.plugin.init(&entry.descriptor.config).await?;
        }
        Ok(())
    }

    /// Run cleanup on every plugin. Failures are logged, not propagated.
    pub async fn cleanup_all(&self) {
        for entry in &self.entries {
            if let Err(e) = entry.plugin.cleanup().await {
                tracing::warn!(
                    target: "bifrost::plugin",
                    "cleanup of plugin '{}' failed: {}",
                    entry.plugin.name(),
                    e
                );
            }
        }
    }

    /// Run pre-hooks in ordinal order. Short-circuits skip the remaining
    /// pre-hooks; the returned index list records exactly which plugins
    /// ran, so the post pass mirrors it.
    pub(crate) async fn run_pre_hooks(
        &self,
        ctx: &mut RequestContext,
        mut request: GatewayRequest,
    ) -> PrePhase {
        let mut ran = Vec::with_capacity(self.entries.len());
        for (idx, entry) in self.entries.iter().enumerate() {
            ran.push(idx);
            // Kept so an advisory failure can continue with the request
            // unmodified; the hook consumes its argument.
            let snapshot = request.clone();
            match entry.plugin.pre_hook(ctx, request).await {
                Ok(PreHookOutcome::Continue(next)) => {
                    request = next;
                }
                Ok(PreHookOutcome::ShortCircuitResponse(response)) => {
                    tracing::debug!(
                        target: "bifrost::plugin",
                        "plugin '{}' short-circuited with a response",
                        entry.plugin.name()
                    );
                    ctx.short_circuit = Some(ShortCircuit::Response(response.clone()));
                    return PrePhase::ShortCircuited(Ok(response), ran);
                }
                Ok(PreHookOutcome::ShortCircuitError(error)) => {
                    ctx.short_circuit = Some(ShortCircuit::Error(error.clone()));
                    return PrePhase::ShortCircuited(Err(error), ran);
                }
                Err(error) => {
                    if entry.descriptor.advisory {
                        tracing::warn!(
                            target: "bifrost::plugin",
                            "advisory plugin '{}' pre_hook failed, skipping: {}",
                            entry.plugin.name(),
                            error
                        );
                        request = snapshot;
                        continue;
                    }
                    let error = GatewayError::plugin(format!(
                        "plugin '{}' pre_hook failed: {}",
                        entry.plugin.name(),
                        error.message
                    ));
                    ctx.short_circuit = Some(ShortCircuit::Error(error.clone()));
                    return PrePhase::ShortCircuited(Err(error), ran);
                }
            }
        }
        PrePhase::Proceed(request, ran)
    }

    /// Run post-hooks over the final result, in reverse of the pre order.
    ///
    /// Hook failures are logged and swallowed. The error kind is sticky: a
    /// plugin may replace message and code but not silently re-tag an
    /// error; it may promote an error to success by returning a response.
    pub(crate) async fn run_post_hooks(
        &self,
        ctx: &mut RequestContext,
        mut result: HookResult,
        ran: &[usize],
    ) -> HookResult {
        for &idx in ran.iter().rev() {
            let entry = &self.entries[idx];
            let before_kind = result.as_ref().err().map(|e| e.kind);
            match entry.plugin.post_hook(ctx, result.clone()).await {
                Ok(next) => {
                    result = match (before_kind, next) {
                        (Some(kind), Err(mut e)) if e.kind != kind => {
                            tracing::warn!(
                                target: "bifrost::plugin",
                                "plugin '{}' tried to re-tag error kind {} as {}; keeping original",
                                entry.plugin.name(),
                                kind,
                                e.kind
                            );
                            e.kind = kind;
                            e.retryable = kind.is_retryable();
                            Err(e)
                        }
                        (_, next) => next,
                    };
                }
                Err(e) => {
                    tracing::warn!(
                        target: "bifrost::plugin",
                        "plugin '{}' post_hook failed (ignored): {}",
                        entry.plugin.name(),
                        e
                    );
                }
            }
        }
        result
    }

    /// Run every plugin's stream-chunk hook in ordinal order. `Ok(None)`
    /// means the chunk was dropped; an `Err` terminates the stream.
    pub(crate) async fn run_stream_chunk_hooks(
        &self,
        ctx: &mut RequestContext,
        chunk: StreamChunk,
    ) -> GatewayResult<Option<StreamChunk>> {
        let mut current = chunk;
        for entry in &self.entries {
            match entry.plugin.stream_chunk_hook(ctx, current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => return Ok(None),
                Err(e) => {
                    return Err(GatewayError::plugin(format!(
                        "plugin '{}' stream_chunk_hook failed: {}",
                        entry.plugin.name(),
                        e.message
                    )))
                }
            }
        }
        Ok(Some(current))
    }

    /// Run HTTP intercept hooks in ordinal order. Exposed for the
    /// transport host; the coordinator itself never calls it.
    pub async fn run_http_intercept(
        &self,
        ctx: &mut RequestContext,
        call: HttpCall,
    ) -> GatewayResult<HttpCall> {
        let mut current = call;
        for entry in &self.entries {
            current = entry.plugin.http_intercept(ctx, current).await?;
        }
        Ok(current)
    }
}
