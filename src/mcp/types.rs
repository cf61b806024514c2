//! MCP wire and registry types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC request envelope.
#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification (no id, no response expected).
#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC response envelope.
#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcResponse {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub id: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcError {
    #[allow(dead_code)]
    pub code: i64,
    pub message: String,
    #[allow(dead_code)]
    pub data: Option<Value>,
}

/// Connection lifecycle of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Health check failing but the transport is still up.
    Degraded,
    Disconnected,
    Error,
}

/// A tool advertised by an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A canonical tool call entering the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl McpToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("call-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            arguments,
        }
    }
}

/// A canonical tool result leaving the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    pub call_id: String,
    /// Concatenated text content.
    pub content: String,
    pub is_error: bool,
    /// The raw MCP content array.
    pub raw_content: Value,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Where a tool call originated; code-mode calls face the stricter
/// auto-execute filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOrigin {
    Direct,
    CodeMode,
}

/// Extract the text content from an MCP `tools/call` result.
pub(crate) fn text_of_content(content: &Value) -> String {
    match content.as_array() {
        Some(items) => items
            .iter()
            .filter_map(|item| {
                (item["type"].as_str() == Some("text"))
                    .then(|| item["text"].as_str().unwrap_or_default().to_string())
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => content.to_string(),
    }
}
