//! Canonical request, response, and streaming shapes.
//!
//! Everything that crosses the core boundary is expressed in these types:
//! ingress rewrites provider-native payloads into a [`GatewayRequest`],
//! adapters translate to and from upstream wire formats, and plugins see
//! the same shapes on both sides of the dispatch.

mod context;
mod request;
mod response;
mod stream;

pub use context::{RequestContext, ShortCircuit};
pub use request::{
    AudioParams, GatewayRequest, Message, ReasoningParams, RequestKind, RequestParams,
    RequestPayload, Target,
};
pub use response::{
    Choice, CompletionTokensDetails, FunctionCall, GatewayResponse, PromptTokensDetails,
    ResponseMessage, ToolCall, Usage,
};
pub use stream::{ChunkDelta, StreamAccumulator, StreamChunk, StreamEnd, StreamItem};
