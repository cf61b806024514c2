//! MCP client transports.
//!
//! Each connection is single-owner: one task owns the transport and
//! dispatches responses to callers by message id. HTTP is plain
//! request/response; stdio and SSE multiplex over a pending-call map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::{McpClientConfig, McpConnectionConfig};
use crate::error::{GatewayError, GatewayResult};

use super::types::{
    text_of_content, ConnectionState, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    McpTool,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// Route a decoded response to the caller waiting on its id.
fn dispatch_response(pending: &PendingMap, response: JsonRpcResponse) {
    let Some(id) = response.id.as_ref().and_then(|v| v.as_u64()) else {
        // Server-initiated message (notification/request); nothing waits
        // on it.
        return;
    };
    if let Some(sender) = pending.lock().unwrap().remove(&id) {
        let _ = sender.send(response);
    }
}

struct StdioConn {
    stdin: ChildStdin,
    child: Child,
    reader: JoinHandle<()>,
}

struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    conn: Mutex<Option<StdioConn>>,
    pending: PendingMap,
}

impl StdioTransport {
    async fn connect(&self, state: &Arc<StdRwLock<ConnectionState>>) -> GatewayResult<()> {
        let mut guard = self.conn.lock().await;
        if let Some(old) = guard.take() {
            old.reader.abort();
            let mut child = old.child;
            let _ = child.start_kill();
        }

        let mut child = tokio::process::Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GatewayError::transient(format!("failed to spawn '{}': {}", self.command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::internal("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::internal("child stdout unavailable"))?;

        let pending = self.pending.clone();
        let state = state.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(&line) {
                            Ok(response) => dispatch_response(&pending, response),
                            Err(e) => {
                                tracing::debug!(
                                    target: "bifrost::mcp",
                                    "ignoring unparseable stdio line: {}",
                                    e
                                );
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
            // Child exited; pending calls will time out, the supervisor
            // respawns.
            *state.write().unwrap() = ConnectionState::Disconnected;
            pending.lock().unwrap().clear();
        });

        *guard = Some(StdioConn {
            stdin,
            child,
            reader,
        });
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> GatewayResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| GatewayError::transient("stdio client is not connected"))?;
        conn.stdin
            .write_all(payload)
            .await
            .map_err(|e| GatewayError::transient(format!("stdio write failed: {}", e)))?;
        conn.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| GatewayError::transient(format!("stdio write failed: {}", e)))?;
        conn.stdin
            .flush()
            .await
            .map_err(|e| GatewayError::transient(format!("stdio flush failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.reader.abort();
            let mut child = conn.child;
            let _ = child.start_kill();
        }
    }
}

struct SseConn {
    endpoint: String,
    reader: JoinHandle<()>,
}

struct SseTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    conn: Mutex<Option<SseConn>>,
    pending: PendingMap,
}

impl SseTransport {
    async fn connect(&self, state: &Arc<StdRwLock<ConnectionState>>) -> GatewayResult<()> {
        let mut guard = self.conn.lock().await;
        if let Some(old) = guard.take() {
            old.reader.abort();
        }

        let mut request = self.client.get(&self.url).header("Accept", "text/event-stream");
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::transient(format!("SSE connect failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(GatewayError::transient(format!(
                "SSE connect failed: HTTP {}",
                response.status()
            )));
        }

        let mut events = response.bytes_stream().eventsource();

        // The server's first event announces the message endpoint.
        let endpoint = loop {
            match tokio::time::timeout(RPC_TIMEOUT, events.next()).await {
                Ok(Some(Ok(event))) if event.event == "endpoint" => {
                    break resolve_endpoint(&self.url, event.data.trim());
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => {
                    return Err(GatewayError::transient(format!("SSE read failed: {}", e)))
                }
                Ok(None) => {
                    return Err(GatewayError::transient("SSE stream closed before endpoint"))
                }
                Err(_) => return Err(GatewayError::timeout()),
            }
        };

        let pending = self.pending.clone();
        let state = state.clone();
        let reader = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        if let Ok(response) =
                            serde_json::from_str::<JsonRpcResponse>(&event.data)
                        {
                            dispatch_response(&pending, response);
                        }
                    }
                    Err(_) => break,
                }
            }
            *state.write().unwrap() = ConnectionState::Disconnected;
            pending.lock().unwrap().clear();
        });

        *guard = Some(SseConn { endpoint, reader });
        Ok(())
    }

    async fn post(&self, payload: &Value) -> GatewayResult<()> {
        let endpoint = {
            let guard = self.conn.lock().await;
            guard
                .as_ref()
                .map(|c| c.endpoint.clone())
                .ok_or_else(|| GatewayError::transient("SSE client is not connected"))?
        };
        let mut request = self.client.post(&endpoint).json(payload);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::transient(format!("SSE post failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(GatewayError::transient(format!(
                "SSE post failed: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.reader.abort();
        }
    }
}

/// Resolve a relative message endpoint against the SSE URL's origin.
fn resolve_endpoint(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let origin = base
        .find("://")
        .and_then(|scheme_end| {
            base[scheme_end + 3..]
                .find('/')
                .map(|path_start| &base[..scheme_end + 3 + path_start])
        })
        .unwrap_or(base);
    format!("{}{}", origin.trim_end_matches('/'), endpoint)
}

struct HttpTransport {
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl HttpTransport {
    async fn round_trip(&self, payload: &Value) -> GatewayResult<JsonRpcResponse> {
        let mut request = self.client.post(&self.url).json(payload);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::transient(format!("MCP HTTP request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(GatewayError::transient(format!(
                "MCP HTTP request failed: HTTP {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| GatewayError::transient(format!("MCP HTTP response unparseable: {}", e)))
    }
}

enum Transport {
    Http(HttpTransport),
    Stdio(StdioTransport),
    Sse(SseTransport),
}

/// One MCP client: config, connection state, and the transport.
pub struct McpClient {
    config: McpClientConfig,
    state: Arc<StdRwLock<ConnectionState>>,
    next_id: AtomicU64,
    transport: Transport,
}

impl McpClient {
    pub fn new(config: McpClientConfig) -> Self {
        let transport = match &config.connection {
            McpConnectionConfig::Http { url, headers } => Transport::Http(HttpTransport {
                url: url.clone(),
                headers: headers.clone(),
                client: reqwest::Client::new(),
            }),
            McpConnectionConfig::Stdio { command, args, env } => Transport::Stdio(StdioTransport {
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
                conn: Mutex::new(None),
                pending: Arc::new(StdMutex::new(HashMap::new())),
            }),
            McpConnectionConfig::Sse { url, headers } => Transport::Sse(SseTransport {
                url: url.clone(),
                headers: headers.clone(),
                client: reqwest::Client::new(),
                conn: Mutex::new(None),
                pending: Arc::new(StdMutex::new(HashMap::new())),
            }),
        };
        Self {
            config,
            state: Arc::new(StdRwLock::new(ConnectionState::Disconnected)),
            next_id: AtomicU64::new(1),
            transport,
        }
    }

    pub fn config(&self) -> &McpClientConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap() = state;
    }

    /// Establish the transport and run the MCP initialize handshake.
    pub async fn connect(&self) -> GatewayResult<()> {
        self.set_state(ConnectionState::Connecting);
        let result = self.connect_inner().await;
        match &result {
            Ok(()) => self.set_state(ConnectionState::Connected),
            Err(e) => {
                tracing::warn!(
                    target: "bifrost::mcp",
                    "client '{}' connect failed: {}",
                    self.config.name,
                    e
                );
                self.set_state(ConnectionState::Error);
            }
        }
        result
    }

    async fn connect_inner(&self) -> GatewayResult<()> {
        match &self.transport {
            Transport::Http(_) => {}
            Transport::Stdio(t) => t.connect(&self.state).await?,
            Transport::Sse(t) => t.connect(&self.state).await?,
        }
        self.request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "bifrost",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        )
        .await?;
        self.notify("notifications/initialized", None).await?;
        Ok(())
    }

    /// Send a request and await its matched response.
    pub(crate) async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> GatewayResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_value(&request)
            .map_err(|e| GatewayError::internal(format!("request encoding failed: {}", e)))?;

        let response = match &self.transport {
            Transport::Http(t) => t.round_trip(&payload).await?,
            Transport::Stdio(t) => {
                let (tx, rx) = oneshot::channel();
                t.pending.lock().unwrap().insert(id, tx);
                let bytes = serde_json::to_vec(&payload)
                    .map_err(|e| GatewayError::internal(format!("encoding failed: {}", e)))?;
                if let Err(e) = t.send(&bytes).await {
                    t.pending.lock().unwrap().remove(&id);
                    return Err(e);
                }
                match tokio::time::timeout(RPC_TIMEOUT, rx).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) => {
                        return Err(GatewayError::transient("MCP connection dropped"))
                    }
                    Err(_) => {
                        t.pending.lock().unwrap().remove(&id);
                        return Err(GatewayError::timeout());
                    }
                }
            }
            Transport::Sse(t) => {
                let (tx, rx) = oneshot::channel();
                t.pending.lock().unwrap().insert(id, tx);
                if let Err(e) = t.post(&payload).await {
                    t.pending.lock().unwrap().remove(&id);
                    return Err(e);
                }
                match tokio::time::timeout(RPC_TIMEOUT, rx).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(_)) => {
                        return Err(GatewayError::transient("MCP connection dropped"))
                    }
                    Err(_) => {
                        t.pending.lock().unwrap().remove(&id);
                        return Err(GatewayError::timeout());
                    }
                }
            }
        };

        if let Some(error) = response.error {
            return Err(GatewayError::permanent(format!(
                "MCP error from '{}': {}",
                self.config.name, error.message
            )));
        }
        response
            .result
            .ok_or_else(|| GatewayError::permanent("MCP response carried no result"))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> GatewayResult<()> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_value(&notification)
            .map_err(|e| GatewayError::internal(format!("encoding failed: {}", e)))?;
        match &self.transport {
            Transport::Http(t) => {
                // Some servers reject notifications; treat that as benign.
                let _ = t.round_trip(&payload).await;
                Ok(())
            }
            Transport::Stdio(t) => {
                let bytes = serde_json::to_vec(&payload)
                    .map_err(|e| GatewayError::internal(format!("encoding failed: {}", e)))?;
                t.send(&bytes).await
            }
            Transport::Sse(t) => t.post(&payload).await,
        }
    }

    /// Health probe: MCP `ping` when available, a cheap `tools/list`
    /// otherwise.
    pub async fn health_check(&self) -> GatewayResult<()> {
        if self.config.is_ping_available {
            self.request("ping", None).await.map(|_| ())
        } else {
            self.list_tools().await.map(|_| ())
        }
    }

    /// Fetch the tool manifest.
    pub async fn list_tools(&self) -> GatewayResult<Vec<McpTool>> {
        let result = self.request("tools/list", Some(json!({}))).await?;
        serde_json::from_value::<Vec<McpTool>>(result["tools"].clone())
            .map_err(|e| GatewayError::permanent(format!("unparseable tool manifest: {}", e)))
    }

    /// Invoke one tool and return `(text, is_error, raw content)`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &Value,
    ) -> GatewayResult<(String, bool, Value)> {
        let result = self
            .request(
                "tools/call",
                Some(json!({"name": name, "arguments": arguments})),
            )
            .await?;
        let is_error = result["isError"].as_bool().unwrap_or(false);
        let content = result.get("content").cloned().unwrap_or_else(|| json!([]));
        Ok((text_of_content(&content), is_error, content))
    }

    /// Tear the transport down.
    pub async fn close(&self) {
        match &self.transport {
            Transport::Http(_) => {}
            Transport::Stdio(t) => t.close().await,
            Transport::Sse(t) => t.close().await,
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_endpoint() {
        assert_eq!(
            resolve_endpoint("http://localhost:8000/sse", "/message?id=1"),
            "http://localhost:8000/message?id=1"
        );
        assert_eq!(
            resolve_endpoint("http://localhost:8000/sse", "http://other/message"),
            "http://other/message"
        );
    }

    #[test]
    fn test_dispatch_matches_by_id() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        let response: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#).unwrap();
        dispatch_response(&pending, response);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.result.unwrap()["ok"], true);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dispatch_ignores_unknown_ids() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let response: JsonRpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":99,"result":{}}"#).unwrap();
        dispatch_response(&pending, response);
    }

    #[tokio::test]
    async fn test_stdio_request_without_connection_fails() {
        let client = McpClient::new(McpClientConfig {
            id: "c1".to_string(),
            name: "files".to_string(),
            connection: McpConnectionConfig::Stdio {
                command: "mcp-files".to_string(),
                args: Vec::new(),
                env: HashMap::new(),
            },
            tools_to_execute: vec!["*".to_string()],
            tools_to_auto_execute: Vec::new(),
            tool_sync_interval_mins: 0,
            is_code_mode_client: false,
            is_ping_available: false,
            tool_pricing: HashMap::new(),
        });
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let err = client.request("tools/list", None).await.unwrap_err();
        assert!(err.message.contains("not connected"));
    }
}
