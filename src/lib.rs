//! Bifrost request core: the path from "provider-shaped request accepted"
//! to "provider-shaped response returned".
//!
//! The crate fronts many upstream model providers behind one canonical,
//! OpenAI-shaped API and owns the hard middle of an LLM gateway:
//!
//! - **`provider`** - the adapter capability set, weighted key pools with
//!   health-based rotation, and bounded per-provider worker pools
//! - **`plugin`** - the symmetric pre/post hook pipeline, shared by native
//!   and WASM plugins
//! - **`mcp`** - MCP clients (stdio/HTTP/SSE), tool sync, and filtered
//!   tool execution
//! - **`governance`** - budget and rate-limit admission with atomic
//!   reservations, committed from real token usage
//! - **`routing`** - CEL-conditioned target overrides with scope
//!   precedence
//! - **`coordinator`** - the state machine tying it all together,
//!   including streaming fan-out, fallbacks, retries, and cancellation
//!
//! # Example
//!
//! ```no_run
//! use bifrost::config::{GatewayConfig, KeyConfig, ProviderConfig};
//! use bifrost::coordinator::{GatewayBuilder, IngressContext};
//! use bifrost::types::{GatewayRequest, Message};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = GatewayConfig::default();
//! config.providers.push(
//!     ProviderConfig::named("openai")
//!         .with_key(KeyConfig::new("primary", "env.OPENAI_API_KEY")),
//! );
//!
//! let gateway = GatewayBuilder::new(config).build().await?;
//! let request = GatewayRequest::chat(
//!     "openai",
//!     "gpt-4o-mini",
//!     vec![Message::user("Hello")],
//! );
//! let response = gateway.execute(request, IngressContext::default()).await?;
//! println!("{}", response.first_content().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod governance;
pub mod mcp;
pub mod plugin;
pub mod provider;
pub mod routing;
pub mod types;

pub use coordinator::{Gateway, GatewayBuilder, IngressContext, StreamHandle};
pub use error::{ErrorKind, GatewayError, GatewayResult};

/// Convenient imports for embedding the core.
pub mod prelude {
    pub use crate::config::{GatewayConfig, KeyConfig, PluginDescriptor, ProviderConfig};
    pub use crate::coordinator::{Gateway, GatewayBuilder, IngressContext};
    pub use crate::error::{ErrorKind, GatewayError, GatewayResult};
    pub use crate::plugin::{Plugin, PreHookOutcome};
    pub use crate::provider::{Capability, ProviderAdapter};
    pub use crate::types::{GatewayRequest, GatewayResponse, Message, StreamItem};
}
