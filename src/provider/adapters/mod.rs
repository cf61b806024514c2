//! Concrete provider adapters.
//!
//! Only the OpenAI-compatible dialect ships in-core; it covers OpenAI,
//! Groq, Mistral, Ollama, OpenRouter and other upstreams that speak the
//! same wire format, and serves as the reference implementation of the
//! [`crate::provider::ProviderAdapter`] trait. Other dialects plug in
//! through the same trait from outside the core.

mod openai;

pub use openai::OpenAiCompatAdapter;
