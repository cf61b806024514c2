//! The provider adapter contract.
//!
//! An adapter translates canonical requests to one upstream's wire format
//! and back. Adapters are a capability set, not an inheritance tree: each
//! operation has a default implementation that reports "unsupported", and
//! the coordinator consults [`ProviderAdapter::capabilities`] before
//! dispatching, so no adapter implements what it cannot support.

use std::pin::Pin;

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::config::NetworkConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::types::{GatewayRequest, GatewayResponse, RequestKind, StreamChunk};

use super::keys::ProviderKey;

/// One operation an adapter may declare support for. Streaming variants
/// are separate capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ChatCompletion,
    ChatCompletionStream,
    TextCompletion,
    TextCompletionStream,
    Embedding,
    Responses,
    ResponsesStream,
    Speech,
    SpeechStream,
    Transcription,
    TranscriptionStream,
    ImageGeneration,
    ImageEdit,
    ImageVariation,
    ListModels,
}

impl Capability {
    /// The capability required by a `(kind, stream)` pair, or `None` when
    /// the combination does not exist.
    pub fn required_for(kind: RequestKind, stream: bool) -> Option<Capability> {
        match (kind, stream) {
            (RequestKind::ChatCompletion, false) => Some(Capability::ChatCompletion),
            (RequestKind::ChatCompletion, true) => Some(Capability::ChatCompletionStream),
            (RequestKind::TextCompletion, false) => Some(Capability::TextCompletion),
            (RequestKind::TextCompletion, true) => Some(Capability::TextCompletionStream),
            (RequestKind::Embedding, false) => Some(Capability::Embedding),
            (RequestKind::Responses, false) => Some(Capability::Responses),
            (RequestKind::Responses, true) => Some(Capability::ResponsesStream),
            (RequestKind::Speech, false) => Some(Capability::Speech),
            (RequestKind::Speech, true) => Some(Capability::SpeechStream),
            (RequestKind::Transcription, false) => Some(Capability::Transcription),
            (RequestKind::Transcription, true) => Some(Capability::TranscriptionStream),
            (RequestKind::ImageGeneration, false) => Some(Capability::ImageGeneration),
            (RequestKind::ImageEdit, false) => Some(Capability::ImageEdit),
            (RequestKind::ImageVariation, false) => Some(Capability::ImageVariation),
            (RequestKind::ListModels, false) => Some(Capability::ListModels),
            _ => None,
        }
    }
}

/// Boxed canonical chunk stream an adapter returns for streaming
/// operations.
pub type ProviderStream = Pin<Box<dyn Stream<Item = GatewayResult<StreamChunk>> + Send>>;

fn unsupported(adapter: &str, what: &str) -> GatewayError {
    GatewayError::permanent(format!("provider '{}' does not support {}", adapter, what))
}

/// The adapter contract. One implementation per upstream dialect.
///
/// Errors surface as [`GatewayError`] with the retryability bit set by the
/// adapter; the coordinator's retry and fallback machinery keys off it.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider tag for logging (`openai`, `anthropic`, ...).
    fn name(&self) -> &str;

    /// Operations this adapter supports. The coordinator skips targets
    /// whose mask does not include the request's operation.
    fn capabilities(&self) -> Vec<Capability>;

    async fn chat_completion(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "chat completions"))
    }

    async fn chat_completion_stream(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<ProviderStream> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "streaming chat completions"))
    }

    async fn text_completion(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "text completions"))
    }

    async fn text_completion_stream(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<ProviderStream> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "streaming text completions"))
    }

    async fn embedding(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "embeddings"))
    }

    async fn responses(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "the responses API"))
    }

    async fn responses_stream(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<ProviderStream> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "streaming responses"))
    }

    async fn speech(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "speech synthesis"))
    }

    async fn speech_stream(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<ProviderStream> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "streaming speech synthesis"))
    }

    async fn transcription(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "transcription"))
    }

    async fn transcription_stream(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<ProviderStream> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "streaming transcription"))
    }

    async fn image_generation(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "image generation"))
    }

    async fn image_edit(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "image edits"))
    }

    async fn image_variation(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        let _ = (request, key, network);
        Err(unsupported(self.name(), "image variations"))
    }

    async fn list_models(
        &self,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<Vec<String>> {
        let _ = (key, network);
        Err(unsupported(self.name(), "model listing"))
    }

    /// Dispatch a non-streaming request to the operation method matching
    /// its kind.
    async fn dispatch(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<GatewayResponse> {
        match request.kind {
            RequestKind::ChatCompletion => self.chat_completion(request, key, network).await,
            RequestKind::TextCompletion => self.text_completion(request, key, network).await,
            RequestKind::Embedding => self.embedding(request, key, network).await,
            RequestKind::Responses => self.responses(request, key, network).await,
            RequestKind::Speech => self.speech(request, key, network).await,
            RequestKind::Transcription => self.transcription(request, key, network).await,
            RequestKind::ImageGeneration => self.image_generation(request, key, network).await,
            RequestKind::ImageEdit => self.image_edit(request, key, network).await,
            RequestKind::ImageVariation => self.image_variation(request, key, network).await,
            RequestKind::ListModels => {
                let models = self.list_models(key, network).await?;
                let mut response = GatewayResponse::from_text(String::new(), String::new());
                response.object = "list".to_string();
                response.choices.clear();
                response.data = Some(serde_json::json!(models
                    .into_iter()
                    .map(|id| serde_json::json!({"id": id, "object": "model"}))
                    .collect::<Vec<_>>()));
                Ok(response)
            }
        }
    }

    /// Dispatch a streaming request to the operation method matching its
    /// kind.
    async fn dispatch_stream(
        &self,
        request: &GatewayRequest,
        key: Option<&ProviderKey>,
        network: &NetworkConfig,
    ) -> GatewayResult<ProviderStream> {
        match request.kind {
            RequestKind::ChatCompletion => {
                self.chat_completion_stream(request, key, network).await
            }
            RequestKind::TextCompletion => {
                self.text_completion_stream(request, key, network).await
            }
            RequestKind::Responses => self.responses_stream(request, key, network).await,
            RequestKind::Speech => self.speech_stream(request, key, network).await,
            RequestKind::Transcription => {
                self.transcription_stream(request, key, network).await
            }
            kind => Err(GatewayError::validation(format!(
                "operation kind '{}' has no streaming variant",
                kind
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ChatOnly;

    #[async_trait::async_trait]
    impl ProviderAdapter for ChatOnly {
        fn name(&self) -> &str {
            "chat-only"
        }

        fn capabilities(&self) -> Vec<Capability> {
            vec![Capability::ChatCompletion]
        }

        async fn chat_completion(
            &self,
            request: &GatewayRequest,
            _key: Option<&ProviderKey>,
            _network: &NetworkConfig,
        ) -> GatewayResult<GatewayResponse> {
            Ok(GatewayResponse::from_text(request.model.clone(), "ok"))
        }
    }

    #[tokio::test]
    async fn test_default_methods_report_unsupported() {
        use crate::types::Message;
        let adapter = ChatOnly;
        let request = GatewayRequest::chat("x", "m", vec![Message::user("hi")]);
        let network = NetworkConfig::default();

        assert!(adapter.chat_completion(&request, None, &network).await.is_ok());
        let err = adapter.embedding(&request, None, &network).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ProviderPermanent);
        assert!(err.message.contains("chat-only"));
    }

    #[test]
    fn test_capability_required_for() {
        assert_eq!(
            Capability::required_for(RequestKind::ChatCompletion, true),
            Some(Capability::ChatCompletionStream)
        );
        assert_eq!(Capability::required_for(RequestKind::Embedding, true), None);
        assert_eq!(
            Capability::required_for(RequestKind::ListModels, false),
            Some(Capability::ListModels)
        );
    }
}
