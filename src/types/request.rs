//! Canonical request model.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Operation kinds the gateway can dispatch. Streaming is a property of the
/// request, not a separate kind; see [`GatewayRequest::stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    ChatCompletion,
    TextCompletion,
    Embedding,
    Responses,
    Speech,
    Transcription,
    ImageGeneration,
    ImageEdit,
    ImageVariation,
    ListModels,
}

impl RequestKind {
    /// Stable tag used in traces and capability masks.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::ChatCompletion => "chat_completion",
            RequestKind::TextCompletion => "text_completion",
            RequestKind::Embedding => "embedding",
            RequestKind::Responses => "responses",
            RequestKind::Speech => "speech",
            RequestKind::Transcription => "transcription",
            RequestKind::ImageGeneration => "image_generation",
            RequestKind::ImageEdit => "image_edit",
            RequestKind::ImageVariation => "image_variation",
            RequestKind::ListModels => "list_models",
        }
    }

    /// Kinds that have a streaming variant.
    pub fn supports_streaming(&self) -> bool {
        matches!(
            self,
            RequestKind::ChatCompletion
                | RequestKind::TextCompletion
                | RequestKind::Responses
                | RequestKind::Speech
                | RequestKind::Transcription
        )
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(provider, model)` pair: the primary target after routing, or a
/// fallback entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub provider: String,
    pub model: String,
}

impl Target {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Parse a `provider/model` string. The split happens at the first `/`
    /// so model names containing slashes survive.
    pub fn parse(s: &str) -> GatewayResult<Self> {
        match s.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider, model))
            }
            _ => Err(GatewayError::validation(format!(
                "expected provider/model, got '{}'",
                s
            ))),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

/// A chat message in canonical (OpenAI-shaped) form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<super::ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Plain-text message with the given role.
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(serde_json::Value::String(content.into())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    /// Text content when the message carries plain text; `None` for
    /// structured content parts.
    pub fn content_text(&self) -> Option<&str> {
        self.content.as_ref().and_then(|c| c.as_str())
    }
}

/// Operation-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPayload {
    Chat { messages: Vec<Message> },
    Text { prompt: String },
    Embedding { input: serde_json::Value },
    Responses { input: serde_json::Value },
    Speech { input: String },
    Transcription { audio: Vec<u8>, filename: Option<String> },
    Image { prompt: Option<String>, image: Option<Vec<u8>>, mask: Option<Vec<u8>> },
    None,
}

impl RequestPayload {
    /// Whether this payload shape is valid for the given kind.
    fn matches(&self, kind: RequestKind) -> bool {
        matches!(
            (kind, self),
            (RequestKind::ChatCompletion, RequestPayload::Chat { .. })
                | (RequestKind::TextCompletion, RequestPayload::Text { .. })
                | (RequestKind::Embedding, RequestPayload::Embedding { .. })
                | (RequestKind::Responses, RequestPayload::Responses { .. })
                | (RequestKind::Speech, RequestPayload::Speech { .. })
                | (RequestKind::Transcription, RequestPayload::Transcription { .. })
                | (RequestKind::ImageGeneration, RequestPayload::Image { .. })
                | (RequestKind::ImageEdit, RequestPayload::Image { .. })
                | (RequestKind::ImageVariation, RequestPayload::Image { .. })
                | (RequestKind::ListModels, RequestPayload::None)
        )
    }
}

/// Reasoning controls for models that expose them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReasoningParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_summary: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// Audio controls for speech and transcription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

/// Optional generation parameters. `extra` carries provider-specific knobs
/// the core forwards untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioParams>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The canonical request: what ingress hands the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Target provider tag. May be empty at ingress when the model string
    /// is `provider/model`; non-empty after routing.
    pub provider: String,
    pub model: String,
    pub kind: RequestKind,
    pub payload: RequestPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
    /// Ordered fallback targets tried after the primary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<Target>,
    #[serde(default)]
    pub stream: bool,
    /// Ingress headers exposed to routing rules.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl GatewayRequest {
    /// Build a chat completion request. The model string may be
    /// `provider/model` or a bare model name with an explicit provider.
    pub fn chat(provider: impl Into<String>, model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            kind: RequestKind::ChatCompletion,
            payload: RequestPayload::Chat { messages },
            params: None,
            fallbacks: Vec::new(),
            stream: false,
            headers: HashMap::new(),
        }
    }

    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_fallbacks(mut self, fallbacks: Vec<Target>) -> Self {
        self.fallbacks = fallbacks;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// The request's primary target.
    pub fn target(&self) -> Target {
        Target::new(self.provider.clone(), self.model.clone())
    }

    /// Validate the request shape and normalize a `provider/model` model
    /// string into split fields. Called once at ACCEPTED.
    pub fn normalize(&mut self) -> GatewayResult<()> {
        if self.provider.is_empty() {
            if let Some((provider, model)) = self.model.split_once('/') {
                if provider.is_empty() || model.is_empty() {
                    return Err(GatewayError::validation(format!(
                        "malformed model string '{}'",
                        self.model
                    )));
                }
                self.provider = provider.to_string();
                self.model = model.to_string();
            }
        }
        if self.model.is_empty() && self.kind != RequestKind::ListModels {
            return Err(GatewayError::validation("model must not be empty"));
        }
        if !self.payload.matches(self.kind) {
            return Err(GatewayError::validation(format!(
                "payload does not match operation kind '{}'",
                self.kind
            )));
        }
        if self.stream && !self.kind.supports_streaming() {
            return Err(GatewayError::validation(format!(
                "operation kind '{}' has no streaming variant",
                self.kind
            )));
        }
        if let RequestPayload::Chat { messages } = &self.payload {
            if messages.is_empty() {
                return Err(GatewayError::validation("messages must not be empty"));
            }
        }
        Ok(())
    }

    /// The de-duplicated attempt list: primary target first, then fallbacks
    /// with repeats of any earlier `(provider, model)` removed. Cycles are
    /// impossible by construction.
    pub fn attempt_list(&self) -> Vec<Target> {
        let mut seen = std::collections::HashSet::new();
        let mut list = Vec::with_capacity(1 + self.fallbacks.len());
        for target in std::iter::once(self.target()).chain(self.fallbacks.iter().cloned()) {
            if seen.insert((target.provider.clone(), target.model.clone())) {
                list.push(target);
            }
        }
        list
    }
}
