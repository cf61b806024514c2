//! OpenAI-compatible HTTP adapter.
//!
//! Speaks the `/chat/completions`, `/completions`, `/embeddings` and
//! `/models` dialect over HTTPS with bearer auth. Streaming uses SSE with
//! the `data: [DONE]` terminator.

use std::collections::HashMap;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::config::NetworkConfig;
use crate::error::{error_from_status, GatewayError, GatewayResult};
use crate::provider::{Capability, ProviderAdapter, ProviderKey, ProviderStream};
use crate::types::{
    ChunkDelta, GatewayRequest, GatewayResponse, RequestPayload, StreamChunk, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for any upstream speaking the OpenAI wire dialect.
pub struct OpenAiCompatAdapter {
    name: String,
    client: reqwest::Client,
    path_overrides: HashMap<String, String>,
    include_raw_request: bool,
    include_raw_response: bool,
}

impl OpenAiCompatAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            path_overrides: HashMap::new(),
            include_raw_request: false,
            include_raw_response: false,
        }
    }

    /// Override the request path for an operation (`"chat_completion"` →
    /// `"/v1/custom/chat"`).
    pub fn with_path_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.path_overrides = overrides;
        self
    }

    /// Echo raw request/response blobs on responses.
    pub fn with_raw_payloads(mut self, request: bool, response: bool) -> Self {
        self.include_raw_request = request;
        self.include_raw_response = response;
        self
    }

    fn url(&self, network: &NetworkConfig, operation: &str, default_path: &str) -> String {
        let base = if network.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            network.base_url.trim_end_matches('/')
        };
        let path = self
            .path_overrides
            .get(operation)
            .map(String::as_str)
            .unwrap_or(default_path);
        format!("{}{}", base, path)
    }

    fn request_builder(
        &self,
        url: &str,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .timeout(network.request_timeout())
            .header("Content-Type", "application/json");
        if let Some(key) = key {
            builder = builder.header("Authorization", format!("Bearer {}", key.secret));
        }
        for (name, value) in &network.extra_headers {
            builder = builder.header(name, value);
        }
        builder
    }

    fn chat_body(&self, request: &GatewayRequest, stream: bool) -> GatewayResult<Value> {
        let messages = match &request.payload {
            RequestPayload::Chat { messages } => messages,
            _ => return Err(GatewayError::internal("chat dispatch with non-chat payload")),
        };
        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        apply_params(&mut body, request);
        Ok(body)
    }

    async fn send_json(
        &self,
        builder: reqwest::RequestBuilder,
        body: &Value,
    ) -> GatewayResult<(u16, String)> {
        let response = builder.json(body).send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_reqwest_error)?;
        Ok((status, text))
    }

    fn decorate(&self, mut response: GatewayResponse, body: &Value, raw: &str) -> GatewayResponse {
        if self.include_raw_request {
            response.raw_request = Some(body.clone());
        }
        if self.include_raw_response {
            response.raw_response = serde_json::from_str(raw).ok();
        }
        response
    }
}

fn apply_params(body: &mut Value, request: &GatewayRequest) {
    let Some(params) = &request.params else {
        return;
    };
    if let Some(temperature) = params.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = params.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = params.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(stop) = &params.stop {
        body["stop"] = json!(stop);
    }
    if let Some(tools) = &params.tools {
        body["tools"] = json!(tools);
    }
    if let Some(tool_choice) = &params.tool_choice {
        body["tool_choice"] = tool_choice.clone();
    }
    if let Some(reasoning) = &params.reasoning {
        if let Some(effort) = &reasoning.effort {
            body["reasoning_effort"] = json!(effort);
        }
    }
    for (name, value) in &params.extra {
        body[name] = value.clone();
    }
}

fn map_reqwest_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::timeout()
    } else if err.is_connect() || err.is_request() {
        GatewayError::transient(format!("upstream connection failed: {}", err))
    } else {
        GatewayError::transient(format!("upstream transport error: {}", err))
    }
}

/// Parse one SSE data payload into a canonical chunk, or `None` for
/// keepalives and empty deltas.
fn parse_stream_data(provider: &str, data: &str) -> GatewayResult<Option<StreamChunk>> {
    let value: Value = serde_json::from_str(data)
        .map_err(|e| GatewayError::transient(format!("malformed stream chunk: {}", e)))?;

    let id = value["id"].as_str().unwrap_or_default().to_string();
    let model = value["model"].as_str().unwrap_or_default().to_string();
    let finish_reason = value
        .pointer("/choices/0/finish_reason")
        .and_then(|v| v.as_str())
        .map(String::from);

    // Usage-only sentinel: no choices, usage present.
    if value["choices"].as_array().map(|c| c.is_empty()).unwrap_or(true) {
        if let Ok(usage) = serde_json::from_value::<Usage>(value["usage"].clone()) {
            return Ok(Some(StreamChunk {
                id,
                model,
                provider: provider.to_string(),
                delta: ChunkDelta::Usage(usage),
                finish_reason,
            }));
        }
        return Ok(None);
    }

    let delta = &value["choices"][0]["delta"];
    if let Some(tool_calls) = delta["tool_calls"].as_array() {
        if let Some(tc) = tool_calls.first() {
            return Ok(Some(StreamChunk {
                id,
                model,
                provider: provider.to_string(),
                delta: ChunkDelta::ToolCall {
                    index: tc["index"].as_u64().unwrap_or(0) as usize,
                    id: tc["id"].as_str().map(String::from),
                    name: tc
                        .pointer("/function/name")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    arguments: tc
                        .pointer("/function/arguments")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                },
                finish_reason,
            }));
        }
    }
    if let Some(content) = delta["content"].as_str() {
        return Ok(Some(StreamChunk {
            id,
            model,
            provider: provider.to_string(),
            delta: ChunkDelta::Content(content.to_string()),
            finish_reason,
        }));
    }
    // Role-only or empty delta, but a finish_reason still matters.
    if let Some(reason) = finish_reason {
        return Ok(Some(StreamChunk {
            id,
            model,
            provider: provider.to_string(),
            delta: ChunkDelta::Content(String::new()),
            finish_reason: Some(reason),
        }));
    }
    Ok(None)
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Vec<Capability> {
        vec![
            Capability::ChatCompletion,
            Capability::ChatCompletionStream,
            Capability::TextCompletion,
            Capability::Embedding,
            Capability::ListModels,
        ]
    }

    async fn chat_completion(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let body = self.chat_body(request, false)?;
        let url = self.url(network, "chat_completion", "/chat/completions");
        let (status, text) = self
            .send_json(self.request_builder(&url, key, network), &body)
            .await?;
        if status >= 400 {
            return Err(error_from_status(status, &text));
        }
        let response: GatewayResponse = serde_json::from_str(&text).map_err(|e| {
            GatewayError::transient(format!("unparseable upstream response: {}", e))
        })?;
        Ok(self.decorate(response, &body, &text))
    }

    async fn chat_completion_stream(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<ProviderStream> {
        let body = self.chat_body(request, true)?;
        let url = self.url(network, "chat_completion", "/chat/completions");
        let response = self
            .request_builder(&url, key, network)
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        if status >= 400 {
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_status(status, &text));
        }

        let provider = self.name.clone();
        let events = response.bytes_stream().eventsource();
        let stream = events.filter_map(move |event| {
            let provider = provider.clone();
            async move {
                match event {
                    Ok(event) => {
                        if event.data.trim() == "[DONE]" {
                            return None;
                        }
                        parse_stream_data(&provider, &event.data).transpose()
                    }
                    Err(e) => Some(Err(GatewayError::transient(format!(
                        "stream read failed: {}",
                        e
                    )))),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn text_completion(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let prompt = match &request.payload {
            RequestPayload::Text { prompt } => prompt,
            _ => return Err(GatewayError::internal("text dispatch with non-text payload")),
        };
        let mut body = json!({"model": request.model, "prompt": prompt});
        apply_params(&mut body, request);
        let url = self.url(network, "text_completion", "/completions");
        let (status, text) = self
            .send_json(self.request_builder(&url, key, network), &body)
            .await?;
        if status >= 400 {
            return Err(error_from_status(status, &text));
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::transient(format!("unparseable upstream response: {}", e))
        })?;
        // Legacy completion choices carry `text`, not a message.
        let mut response = GatewayResponse::from_text(
            value["model"].as_str().unwrap_or(&request.model),
            value
                .pointer("/choices/0/text")
                .and_then(|v| v.as_str())
                .unwrap_or_default(),
        );
        response.object = "text_completion".to_string();
        if let Some(id) = value["id"].as_str() {
            response.id = id.to_string();
        }
        response.usage = serde_json::from_value(value["usage"].clone()).ok();
        if let Some(reason) = value.pointer("/choices/0/finish_reason").and_then(|v| v.as_str()) {
            response.choices[0].finish_reason = Some(reason.to_string());
        }
        Ok(self.decorate(response, &body, &text))
    }

    async fn embedding(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let input = match &request.payload {
            RequestPayload::Embedding { input } => input,
            _ => {
                return Err(GatewayError::internal(
                    "embedding dispatch with non-embedding payload",
                ))
            }
        };
        let mut body = json!({"model": request.model, "input": input});
        apply_params(&mut body, request);
        let url = self.url(network, "embedding", "/embeddings");
        let (status, text) = self
            .send_json(self.request_builder(&url, key, network), &body)
            .await?;
        if status >= 400 {
            return Err(error_from_status(status, &text));
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::transient(format!("unparseable upstream response: {}", e))
        })?;
        let mut response = GatewayResponse::from_text(request.model.clone(), "");
        response.object = "list".to_string();
        response.choices.clear();
        response.data = Some(value["data"].clone());
        response.usage = serde_json::from_value(value["usage"].clone()).ok();
        Ok(self.decorate(response, &body, &text))
    }

    async fn list_models(
        &self,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<Vec<String>> {
        let base = if network.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            network.base_url.trim_end_matches('/')
        };
        let mut builder = self
            .client
            .get(format!("{}/models", base))
            .timeout(network.request_timeout());
        if let Some(key) = key {
            builder = builder.header("Authorization", format!("Bearer {}", key.secret));
        }
        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let text = response.text().await.map_err(map_reqwest_error)?;
        if status >= 400 {
            return Err(error_from_status(status, &text));
        }
        let value: Value = serde_json::from_str(&text).map_err(|e| {
            GatewayError::transient(format!("unparseable model listing: {}", e))
        })?;
        Ok(value["data"]
            .as_array()
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default())
    }
}
