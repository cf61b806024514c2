//! Shared test doubles: a scriptable mock adapter and a recording plugin.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;

use bifrost::config::NetworkConfig;
use bifrost::error::GatewayResult;
use bifrost::plugin::{HookResult, Plugin, PreHookOutcome};
use bifrost::provider::{Capability, ProviderAdapter, ProviderKey, ProviderStream};
use bifrost::types::{
    GatewayRequest, GatewayResponse, RequestContext, StreamChunk, Usage,
};

/// Scriptable adapter: pops scripted outcomes per call, falls back to a
/// canned success. Records call counts and the key ids it saw.
pub struct MockAdapter {
    name: String,
    calls: AtomicUsize,
    script: Mutex<VecDeque<GatewayResult<GatewayResponse>>>,
    seen_keys: Mutex<Vec<Option<String>>>,
    chunks: Mutex<Vec<StreamChunk>>,
    chunk_delay: Duration,
}

impl MockAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: AtomicUsize::new(0),
            script: Mutex::new(VecDeque::new()),
            seen_keys: Mutex::new(Vec::new()),
            chunks: Mutex::new(Vec::new()),
            chunk_delay: Duration::from_millis(30),
        }
    }

    /// Queue one scripted outcome; consumed in order.
    pub fn push(&self, outcome: GatewayResult<GatewayResponse>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Set the chunks the streaming path emits.
    pub fn set_chunks(&self, texts: &[&str]) {
        let mut chunks = self.chunks.lock().unwrap();
        chunks.clear();
        for (i, text) in texts.iter().enumerate() {
            let mut chunk = StreamChunk::content("mock-stream", "mock-model", *text);
            if i == texts.len() - 1 {
                chunk.finish_reason = Some("stop".to_string());
            }
            chunks.push(chunk);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_keys(&self) -> Vec<Option<String>> {
        self.seen_keys.lock().unwrap().clone()
    }

    fn default_response(&self, request: &GatewayRequest) -> GatewayResponse {
        let mut response = GatewayResponse::from_text(request.model.clone(), "Hello there!");
        response.usage = Some(Usage::new(7, 5));
        response
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![Capability::ChatCompletion, Capability::ChatCompletionStream]
    }

    async fn chat_completion(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        _network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_keys
            .lock()
            .unwrap()
            .push(key.map(|k| k.id.clone()));
        match self.script.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(self.default_response(request)),
        }
    }

    async fn chat_completion_stream(
        &self,
        _request: &GatewayRequest,
        key: Option<&ProviderKey>,
        _network: &NetworkConfig,
    ) -> GatewayResult<ProviderStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_keys
            .lock()
            .unwrap()
            .push(key.map(|k| k.id.clone()));
        if let Some(outcome) = self.script.lock().unwrap().pop_front() {
            // A scripted error fails the stream open.
            outcome?;
        }
        let chunks = self.chunks.lock().unwrap().clone();
        let delay = self.chunk_delay;
        let stream = futures_util::stream::iter(chunks.into_iter().map(Ok)).then(
            move |chunk| async move {
                tokio::time::sleep(delay).await;
                chunk
            },
        );
        Ok(Box::pin(stream))
    }
}

/// What the recorder observed for one hook invocation.
#[derive(Debug, Clone)]
pub enum HookEvent {
    Pre,
    PostResponse(String),
    PostError(bifrost::ErrorKind),
}

/// A plugin that journals its hook invocations.
pub struct RecorderPlugin {
    pub name: String,
    pub events: Arc<Mutex<Vec<HookEvent>>>,
    pub short_circuit_with: Option<String>,
    /// Set when a post-hook saw the accumulated partial response in the
    /// context (streaming error path).
    pub saw_partial: Arc<Mutex<bool>>,
}

impl RecorderPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Arc::new(Mutex::new(Vec::new())),
            short_circuit_with: None,
            saw_partial: Arc::new(Mutex::new(false)),
        }
    }

    pub fn short_circuiting(mut self, content: impl Into<String>) -> Self {
        self.short_circuit_with = Some(content.into());
        self
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Plugin for RecorderPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn pre_hook(
        &self,
        _ctx: &mut RequestContext,
        request: GatewayRequest,
    ) -> GatewayResult<PreHookOutcome> {
        self.events.lock().unwrap().push(HookEvent::Pre);
        match &self.short_circuit_with {
            Some(content) => Ok(PreHookOutcome::ShortCircuitResponse(
                GatewayResponse::from_text(request.model.clone(), content.clone()),
            )),
            None => Ok(PreHookOutcome::Continue(request)),
        }
    }

    async fn post_hook(
        &self,
        ctx: &mut RequestContext,
        result: HookResult,
    ) -> GatewayResult<HookResult> {
        let event = match &result {
            Ok(response) => HookEvent::PostResponse(
                response.first_content().unwrap_or_default().to_string(),
            ),
            Err(error) => HookEvent::PostError(error.kind),
        };
        self.events.lock().unwrap().push(event);
        if ctx.get_value("stream.partial_response").is_some() {
            *self.saw_partial.lock().unwrap() = true;
        }
        Ok(result)
    }
}
