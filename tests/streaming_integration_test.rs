//! Streaming fan-out scenarios: ordering, drops, cancellation, and the
//! exactly-once post-hook contract.

mod common;

use std::sync::Arc;

use bifrost::config::{GatewayConfig, KeyConfig, PluginDescriptor, ProviderConfig};
use bifrost::coordinator::{GatewayBuilder, IngressContext};
use bifrost::error::{ErrorKind, GatewayResult};
use bifrost::plugin::Plugin;
use bifrost::types::{
    ChunkDelta, GatewayRequest, Message, RequestContext, StreamChunk, StreamItem,
};

use common::{HookEvent, MockAdapter, RecorderPlugin};

fn provider_with_key(name: &str) -> ProviderConfig {
    ProviderConfig::named(name).with_key(KeyConfig::new("primary", format!("sk-{}", name)))
}

fn stream_request() -> GatewayRequest {
    GatewayRequest::chat("openai", "gpt-4o-mini", vec![Message::user("Hello")]).streaming()
}

fn chunk_text(item: &StreamItem) -> Option<String> {
    match item {
        StreamItem::Chunk(StreamChunk {
            delta: ChunkDelta::Content(text),
            ..
        }) => Some(text.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn test_stream_delivers_chunks_in_order() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));

    let adapter = Arc::new(MockAdapter::new("openai"));
    adapter.set_chunks(&["Hel", "lo", " world"]);

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    let (mut rx, _handle) = gateway
        .execute_stream(stream_request(), IngressContext::default())
        .await
        .unwrap();

    let mut texts = Vec::new();
    let mut ended = false;
    while let Some(item) = rx.recv().await {
        match item {
            StreamItem::Chunk(_) => texts.push(chunk_text(&item).unwrap()),
            StreamItem::End(end) => {
                assert!(end.error.is_none());
                ended = true;
            }
        }
    }
    assert!(ended);
    assert_eq!(texts, vec!["Hel", "lo", " world"]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_dropped_chunks_keep_subsequence_order() {
    struct DropShort;

    #[async_trait::async_trait]
    impl Plugin for DropShort {
        fn name(&self) -> &str {
            "drop-short"
        }

        async fn stream_chunk_hook(
            &self,
            _ctx: &mut RequestContext,
            chunk: StreamChunk,
        ) -> GatewayResult<Option<StreamChunk>> {
            match &chunk.delta {
                ChunkDelta::Content(text) if text.len() < 3 => Ok(None),
                _ => Ok(Some(chunk)),
            }
        }
    }

    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));

    let adapter = Arc::new(MockAdapter::new("openai"));
    adapter.set_chunks(&["alpha", "x", "bravo", "y", "charlie"]);

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .with_plugin(
            Arc::new(DropShort),
            PluginDescriptor::native("drop", "drop-short", 0),
        )
        .build()
        .await
        .unwrap();

    let (mut rx, _handle) = gateway
        .execute_stream(stream_request(), IngressContext::default())
        .await
        .unwrap();

    let mut texts = Vec::new();
    while let Some(item) = rx.recv().await {
        if let Some(text) = chunk_text(&item) {
            texts.push(text);
        }
    }
    // Delivered order is a subsequence of the emitted order.
    assert_eq!(texts, vec!["alpha", "bravo", "charlie"]);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_stream_cancellation_runs_post_hooks_once() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));

    let adapter = Arc::new(MockAdapter::new("openai"));
    adapter.set_chunks(&["one ", "two ", "three ", "four ", "five ", "six ", "seven "]);

    let recorder = RecorderPlugin::new("observer");
    let events = recorder.events.clone();
    let saw_partial = recorder.saw_partial.clone();

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .with_plugin(
            Arc::new(recorder),
            PluginDescriptor::native("observer", "observer", 0),
        )
        .build()
        .await
        .unwrap();

    let (mut rx, handle) = gateway
        .execute_stream(stream_request(), IngressContext::default())
        .await
        .unwrap();

    // Read two chunks, then cancel.
    let mut read = 0;
    let mut end_marker = None;
    while let Some(item) = rx.recv().await {
        match item {
            StreamItem::Chunk(_) => {
                read += 1;
                if read == 2 {
                    handle.cancel();
                }
            }
            StreamItem::End(end) => {
                end_marker = Some(end);
                break;
            }
        }
    }

    let end = end_marker.expect("stream must terminate with an end marker");
    assert_eq!(end.error.unwrap().kind, ErrorKind::Cancelled);

    // Exactly one post-hook invocation, with the cancelled error and the
    // accumulated partial response in the context.
    let events = events.lock().unwrap().clone();
    let posts: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, HookEvent::PostError(_) | HookEvent::PostResponse(_)))
        .collect();
    assert_eq!(posts.len(), 1);
    assert!(matches!(posts[0], HookEvent::PostError(ErrorKind::Cancelled)));
    assert!(*saw_partial.lock().unwrap());
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_stream_short_circuit_yields_synthetic_stream() {
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));

    let adapter = Arc::new(MockAdapter::new("openai"));
    let plugin = RecorderPlugin::new("mocker").short_circuiting("mocked");

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .with_plugin(
            Arc::new(plugin),
            PluginDescriptor::native("mocker", "mocker", 0),
        )
        .build()
        .await
        .unwrap();

    let (mut rx, _handle) = gateway
        .execute_stream(stream_request(), IngressContext::default())
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(chunk_text(&first).as_deref(), Some("mocked"));
    let end = rx.recv().await.unwrap();
    assert!(matches!(end, StreamItem::End(ref e) if e.error.is_none()));
    assert_eq!(adapter.calls(), 0);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_stream_open_failure_surfaces_error() {
    let mut config = GatewayConfig::default();
    let mut provider = provider_with_key("openai");
    provider.network.max_retries = 0;
    config.providers.push(provider);

    let adapter = Arc::new(MockAdapter::new("openai"));
    adapter.push(Err(bifrost::GatewayError::permanent("no streaming today")));

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    let err = gateway
        .execute_stream(stream_request(), IngressContext::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::ProviderPermanent);
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_stream_accumulates_like_non_streaming() {
    // execute(stream=true) concatenated equals the non-streaming content
    // for the same scripted output.
    let mut config = GatewayConfig::default();
    config.providers.push(provider_with_key("openai"));

    let adapter = Arc::new(MockAdapter::new("openai"));
    adapter.set_chunks(&["Hello", " ", "there!"]);

    let gateway = GatewayBuilder::new(config)
        .with_adapter("openai", adapter.clone())
        .build()
        .await
        .unwrap();

    let (mut rx, _handle) = gateway
        .execute_stream(stream_request(), IngressContext::default())
        .await
        .unwrap();
    let mut concatenated = String::new();
    while let Some(item) = rx.recv().await {
        if let Some(text) = chunk_text(&item) {
            concatenated.push_str(&text);
        }
    }

    let response = gateway
        .execute(
            GatewayRequest::chat("openai", "gpt-4o-mini", vec![Message::user("Hello")]),
            IngressContext::default(),
        )
        .await
        .unwrap();
    assert_eq!(concatenated, response.first_content().unwrap());
    gateway.shutdown().await;
}
