//! Model Context Protocol (MCP) integration.
//!
//! The registry owns a set of MCP clients (stdio, HTTP, SSE), keeps their
//! tool manifests synced, and executes tool calls from the request path
//! with allow/auto-execute filtering and per-tool pricing. Code-mode
//! meta-tools route to the designated code-mode client.

mod client;
mod codemode;
mod registry;
mod types;

pub use client::McpClient;
pub use codemode::{is_code_mode_only, is_meta_tool, EXECUTE_TOOL_CODE, LIST_TOOL_FILES, READ_TOOL_FILE};
pub use registry::McpRegistry;
pub use types::{CallOrigin, ConnectionState, McpTool, McpToolCall, McpToolResult};
