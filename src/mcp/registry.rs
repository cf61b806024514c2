//! The MCP tool registry: client lifecycle, tool sync, and execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::{McpClientConfig, McpConfig};
use crate::error::{GatewayError, GatewayResult};

use super::client::McpClient;
use super::codemode::{is_code_mode_only, is_meta_tool};
use super::types::{CallOrigin, ConnectionState, McpTool, McpToolCall, McpToolResult};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct RegisteredTool {
    tool: McpTool,
    client_id: String,
    /// Removed upstream; in-flight calls complete, then the next sync
    /// drops it.
    soft_deleted: bool,
}

/// Process-wide MCP registry. Owns client supervision and tool manifests.
pub struct McpRegistry {
    clients: StdRwLock<HashMap<String, Arc<McpClient>>>,
    tools: StdRwLock<HashMap<String, RegisteredTool>>,
    global_sync_mins: i64,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl McpRegistry {
    /// Build the registry and start supervision and sync tasks for every
    /// configured client.
    pub fn new(config: &McpConfig) -> Arc<Self> {
        let registry = Arc::new(Self {
            clients: StdRwLock::new(HashMap::new()),
            tools: StdRwLock::new(HashMap::new()),
            global_sync_mins: config.tool_sync_interval_mins,
            tasks: StdMutex::new(Vec::new()),
        });
        for client_config in &config.clients {
            registry.clone().register_client(client_config.clone());
        }
        registry
    }

    /// Add a client at runtime and start its background tasks.
    pub fn register_client(self: Arc<Self>, config: McpClientConfig) {
        let client = Arc::new(McpClient::new(config.clone()));
        self.clients
            .write()
            .unwrap()
            .insert(config.id.clone(), client.clone());

        let supervisor = {
            let registry = self.clone();
            let client = client.clone();
            tokio::spawn(async move {
                registry.supervise(client).await;
            })
        };
        self.tasks.lock().unwrap().push(supervisor);

        let sync_mins = effective_sync_interval(&config, self.global_sync_mins);
        if let Some(interval) = sync_mins {
            let syncer = {
                let registry = self.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        ticker.tick().await;
                        if client.state() == ConnectionState::Connected {
                            if let Err(e) = registry.sync_client(&client).await {
                                tracing::warn!(
                                    target: "bifrost::mcp",
                                    "tool sync for '{}' failed: {}",
                                    client.config().name,
                                    e
                                );
                            }
                        }
                    }
                })
            };
            self.tasks.lock().unwrap().push(syncer);
        }
    }

    /// Remove a client: drop its tools and close the transport.
    pub async fn remove_client(&self, client_id: &str) {
        let client = self.clients.write().unwrap().remove(client_id);
        self.tools
            .write()
            .unwrap()
            .retain(|_, registered| registered.client_id != client_id);
        if let Some(client) = client {
            client.close().await;
        }
    }

    /// Connection supervision: reconnect with exponential backoff and
    /// jitter, then health-check on an interval. Stdio children respawn
    /// through the same path.
    async fn supervise(&self, client: Arc<McpClient>) {
        let mut backoff = RECONNECT_BASE;
        loop {
            match client.state() {
                ConnectionState::Connected => {
                    tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
                    if client.state() != ConnectionState::Connected {
                        continue;
                    }
                    if let Err(e) = client.health_check().await {
                        tracing::warn!(
                            target: "bifrost::mcp",
                            "health check for '{}' failed: {}",
                            client.config().name,
                            e
                        );
                        client.set_state(ConnectionState::Degraded);
                    } else {
                        backoff = RECONNECT_BASE;
                    }
                }
                ConnectionState::Connecting => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                ConnectionState::Degraded
                | ConnectionState::Disconnected
                | ConnectionState::Error => {
                    let jitter = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(0.0..1.0)
                    };
                    let delay = backoff.mul_f64(jitter);
                    tokio::time::sleep(delay).await;
                    if client.connect().await.is_ok() {
                        backoff = RECONNECT_BASE;
                        if let Err(e) = self.sync_client(&client).await {
                            tracing::warn!(
                                target: "bifrost::mcp",
                                "initial tool sync for '{}' failed: {}",
                                client.config().name,
                                e
                            );
                        }
                    } else {
                        backoff = (backoff * 2).min(RECONNECT_MAX);
                    }
                }
            }
        }
    }

    /// Re-fetch one client's manifest: add new tools, soft-delete removed
    /// ones, drop tools soft-deleted on the previous pass.
    async fn sync_client(&self, client: &McpClient) -> GatewayResult<()> {
        let manifest = client.list_tools().await?;
        let client_id = client.config().id.clone();
        let client_name = client.config().name.clone();

        let mut tools = self.tools.write().unwrap();
        tools.retain(|_, registered| {
            !(registered.client_id == client_id && registered.soft_deleted)
        });

        let fresh: std::collections::HashSet<&str> =
            manifest.iter().map(|t| t.name.as_str()).collect();
        for registered in tools.values_mut() {
            if registered.client_id == client_id && !fresh.contains(registered.tool.name.as_str())
            {
                tracing::debug!(
                    target: "bifrost::mcp",
                    "tool '{}' removed upstream, soft-deleting",
                    registered.tool.name
                );
                registered.soft_deleted = true;
            }
        }

        for tool in manifest {
            let exposed = match tools.get(&tool.name) {
                Some(existing) if existing.client_id != client_id => {
                    // Name collision across clients: namespace ours.
                    format!("{}-{}", client_name, tool.name)
                }
                _ => tool.name.clone(),
            };
            tools.insert(
                exposed,
                RegisteredTool {
                    tool,
                    client_id: client_id.clone(),
                    soft_deleted: false,
                },
            );
        }
        Ok(())
    }

    /// The merged manifest of active tools, for attachment to outgoing
    /// requests. Keys are the exposed (possibly namespaced) names.
    pub fn list_tools(&self) -> Vec<(String, McpTool)> {
        self.tools
            .read()
            .unwrap()
            .iter()
            .filter(|(_, registered)| !registered.soft_deleted)
            .map(|(exposed, registered)| (exposed.clone(), registered.tool.clone()))
            .collect()
    }

    /// Execute a tool call.
    pub async fn execute_tool(
        &self,
        call: &McpToolCall,
        origin: CallOrigin,
    ) -> GatewayResult<McpToolResult> {
        if is_meta_tool(&call.name) {
            return self.execute_meta_tool(call, origin).await;
        }

        let (client, tool_name) = {
            let tools = self.tools.read().unwrap();
            let registered = tools
                .get(&call.name)
                .filter(|r| !r.soft_deleted)
                .ok_or_else(|| {
                    GatewayError::validation(format!("unknown tool '{}'", call.name))
                })?;
            let clients = self.clients.read().unwrap();
            let client = clients
                .get(&registered.client_id)
                .ok_or_else(|| GatewayError::internal("tool's owning client is gone"))?
                .clone();
            (client, registered.tool.name.clone())
        };

        check_filters(client.config(), &tool_name, origin)?;
        self.dispatch(&client, &tool_name, call).await
    }

    async fn execute_meta_tool(
        &self,
        call: &McpToolCall,
        origin: CallOrigin,
    ) -> GatewayResult<McpToolResult> {
        if origin == CallOrigin::CodeMode && is_code_mode_only(&call.name) {
            return Err(GatewayError::permanent(format!(
                "'{}' cannot be called from inside executeToolCode",
                call.name
            )));
        }
        let client = {
            let clients = self.clients.read().unwrap();
            clients
                .values()
                .find(|c| c.config().is_code_mode_client)
                .cloned()
                .ok_or_else(|| {
                    GatewayError::validation("no code-mode MCP client is configured")
                })?
        };
        self.dispatch(&client, &call.name, call).await
    }

    async fn dispatch(
        &self,
        client: &McpClient,
        tool_name: &str,
        call: &McpToolCall,
    ) -> GatewayResult<McpToolResult> {
        if client.state() != ConnectionState::Connected {
            return Err(GatewayError::transient(format!(
                "MCP client '{}' is not connected",
                client.config().name
            )));
        }
        let started = std::time::Instant::now();
        let (content, is_error, raw_content) = client.call_tool(tool_name, &call.arguments).await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        let cost_usd = client.config().tool_pricing.get(tool_name).copied();

        if let Some(cost) = cost_usd {
            tracing::debug!(
                target: "bifrost::mcp",
                "tool '{}' took {}ms, cost ${}",
                tool_name,
                latency_ms,
                cost
            );
        }
        Ok(McpToolResult {
            call_id: call.id.clone(),
            content,
            is_error,
            raw_content,
            latency_ms,
            cost_usd,
        })
    }

    /// Stop background tasks and close every client.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let clients: Vec<_> = self.clients.read().unwrap().values().cloned().collect();
        for client in clients {
            client.close().await;
        }
    }
}

/// Per-client sync interval: a positive override wins, 0 uses the global
/// default, -1 disables sync.
fn effective_sync_interval(config: &McpClientConfig, global_mins: i64) -> Option<Duration> {
    let mins = match config.tool_sync_interval_mins {
        -1 => return None,
        0 => global_mins,
        n => n,
    };
    (mins > 0).then(|| Duration::from_secs(mins as u64 * 60))
}

/// Allow-list enforcement: `tools_to_execute` for every call, plus
/// `tools_to_auto_execute` for calls originating inside a code-mode
/// script.
fn check_filters(
    config: &McpClientConfig,
    tool_name: &str,
    origin: CallOrigin,
) -> GatewayResult<()> {
    let allowed = config
        .tools_to_execute
        .iter()
        .any(|t| t == "*" || t == tool_name);
    if !allowed {
        return Err(GatewayError::permanent(format!(
            "tool '{}' is not in the execute allow-list of client '{}'",
            tool_name, config.name
        )));
    }
    if origin == CallOrigin::CodeMode {
        let auto = config
            .tools_to_auto_execute
            .iter()
            .any(|t| t == "*" || t == tool_name);
        if !auto {
            return Err(GatewayError::permanent(format!(
                "tool '{}' is not auto-executable from code mode",
                tool_name
            )));
        }
    }
    Ok(())
}
