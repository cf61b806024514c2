//! JSON configuration model (`config.json`).
//!
//! The config file defines providers and their keys, plugins, MCP clients,
//! governance entities, and routing rules. Secret values may be inlined or
//! referenced as `env.VAR_NAME`; see [`super::EnvironmentLoader`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::provider::Capability;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub plugins: Vec<PluginDescriptor>,
    #[serde(default)]
    pub mcp: Option<McpConfig>,
    #[serde(default)]
    pub governance: Option<GovernanceConfig>,
    #[serde(default)]
    pub routing_rules: Vec<RoutingRuleConfig>,
    /// Price table keyed `provider/model`. Custom providers declare their
    /// pricing inside their [`ProviderConfig`] instead.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
}

impl GatewayConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Enforce the structural invariants the runtime relies on.
    pub fn validate(&self) -> Result<()> {
        for provider in &self.providers {
            provider
                .validate()
                .with_context(|| format!("Invalid provider config '{}'", provider.name))?;
        }
        if let Some(mcp) = &self.mcp {
            for client in &mcp.clients {
                client
                    .validate()
                    .with_context(|| format!("Invalid MCP client config '{}'", client.name))?;
            }
        }
        for rule in &self.routing_rules {
            rule.validate()
                .with_context(|| format!("Invalid routing rule '{}'", rule.name))?;
        }
        Ok(())
    }

    /// Find a provider config by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Coordinator-level knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Default request deadline. Ingress may override per request.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Interval of the background sweep that restores degraded keys.
    #[serde(default = "default_key_health_secs")]
    pub key_health_check_interval_secs: u64,
    /// Grace period for draining worker queues on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_key_health_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            key_health_check_interval_secs: default_key_health_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl CoreConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// One upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider tag (`openai`, `anthropic`, ... or a custom name).
    pub name: String,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Capability mask override. `None` means "whatever the adapter
    /// declares".
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    /// Per-operation request path overrides for providers with
    /// non-standard mounts.
    #[serde(default)]
    pub request_path_overrides: HashMap<String, String>,
    /// Wire dialect for custom providers (`openai`, `anthropic`).
    #[serde(default)]
    pub custom_base_format: Option<String>,
    /// Per-model pricing for custom providers. Registry providers use the
    /// global price table.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,
    /// Provider-scoped governance counters, applied before tenant scopes.
    #[serde(default)]
    pub governance: Option<ScopeLimits>,
    #[serde(default)]
    pub send_back_raw_request: bool,
    #[serde(default)]
    pub send_back_raw_response: bool,
}

impl ProviderConfig {
    /// Minimal provider config for the given name; network and
    /// performance sections take their defaults.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            network: NetworkConfig::default(),
            performance: PerformanceConfig::default(),
            proxy: None,
            capabilities: None,
            request_path_overrides: HashMap::new(),
            custom_base_format: None,
            pricing: HashMap::new(),
            governance: None,
            send_back_raw_request: false,
            send_back_raw_response: false,
        }
    }

    pub fn with_key(mut self, key: KeyConfig) -> Self {
        self.keys.push(key);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("provider name must not be empty");
        }
        if self.performance.concurrency == 0 {
            anyhow::bail!("concurrency must be >= 1");
        }
        if self.performance.buffer_size < self.performance.concurrency {
            anyhow::bail!(
                "buffer_size ({}) must be >= concurrency ({})",
                self.performance.buffer_size,
                self.performance.concurrency
            );
        }
        if self.network.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be positive");
        }
        for key in &self.keys {
            if key.weight <= 0.0 {
                anyhow::bail!("key '{}' weight must be strictly positive", key.id);
            }
        }
        Ok(())
    }
}

/// Network section of a provider config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub retry_backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    10_000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            request_timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_initial_ms: default_backoff_initial_ms(),
            retry_backoff_max_ms: default_backoff_max_ms(),
            extra_headers: HashMap::new(),
        }
    }
}

impl NetworkConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }
}

/// Worker-pool sizing and overflow policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Number of workers (N).
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Queue capacity (B). Must be >= concurrency.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// `true`: a full queue fails the attempt with `provider_transient`.
    /// `false`: the submitter blocks until a slot opens or the deadline
    /// fires.
    #[serde(default)]
    pub drop_excess_requests: bool,
}

fn default_concurrency() -> usize {
    10
}

fn default_buffer_size() -> usize {
    100
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            buffer_size: default_buffer_size(),
            drop_excess_requests: false,
        }
    }
}

/// Outbound proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// One API key owned by a provider config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub id: String,
    /// The secret, inline or `env.VAR_NAME`.
    pub value: String,
    /// Models this key may serve. Empty means all models.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl KeyConfig {
    pub fn new(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            models: Vec::new(),
            weight: 1.0,
            enabled: true,
        }
    }
}

/// Plugin kinds the pipeline can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Native,
    Wasm,
}

/// One plugin in the pipeline. Order is by ascending `ordinal`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub id: String,
    pub name: String,
    pub kind: PluginKind,
    /// Path to the `.wasm` module for WASM plugins.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub ordinal: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Advisory plugins never short-circuit: a pre-hook failure is logged
    /// and skipped.
    #[serde(default)]
    pub advisory: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl PluginDescriptor {
    pub fn native(id: impl Into<String>, name: impl Into<String>, ordinal: i32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: PluginKind::Native,
            path: None,
            ordinal,
            enabled: true,
            advisory: false,
            config: serde_json::Value::Null,
        }
    }
}

/// MCP section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    /// Global tool sync interval in minutes; clients with
    /// `tool_sync_interval_mins = 0` use this.
    #[serde(default = "default_sync_mins")]
    pub tool_sync_interval_mins: i64,
    #[serde(default)]
    pub clients: Vec<McpClientConfig>,
}

fn default_sync_mins() -> i64 {
    30
}

/// Transport configuration for one MCP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpConnectionConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// One MCP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpClientConfig {
    pub id: String,
    pub name: String,
    pub connection: McpConnectionConfig,
    /// Tools the request path may execute. `["*"]` means all.
    #[serde(default = "default_wildcard")]
    pub tools_to_execute: Vec<String>,
    /// Tools a code-mode script may call without confirmation. Must be a
    /// subset of `tools_to_execute`. `["*"]` collapses to "every allowed
    /// tool".
    #[serde(default)]
    pub tools_to_auto_execute: Vec<String>,
    /// Minutes between tool syncs: 0 = global default, -1 = disabled.
    #[serde(default)]
    pub tool_sync_interval_mins: i64,
    #[serde(default)]
    pub is_code_mode_client: bool,
    #[serde(default)]
    pub is_ping_available: bool,
    /// USD price per invocation, by tool name.
    #[serde(default)]
    pub tool_pricing: HashMap<String, f64>,
}

fn default_wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

impl McpClientConfig {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("MCP client name must not be empty");
        }
        let allows_all = self.tools_to_execute.iter().any(|t| t == "*");
        if !allows_all {
            for tool in &self.tools_to_auto_execute {
                if tool != "*" && !self.tools_to_execute.contains(tool) {
                    anyhow::bail!(
                        "tools_to_auto_execute entry '{}' is not in tools_to_execute",
                        tool
                    );
                }
            }
        }
        if self.tool_sync_interval_mins < -1 {
            anyhow::bail!("tool_sync_interval_mins must be >= -1");
        }
        Ok(())
    }
}

/// Governance section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub virtual_keys: Vec<TenantConfig>,
    #[serde(default)]
    pub teams: Vec<TenantConfig>,
    #[serde(default)]
    pub customers: Vec<TenantConfig>,
    #[serde(default)]
    pub global: Option<ScopeLimits>,
    /// Keep the request-count charge when a request fails. Default:
    /// release on error.
    #[serde(default)]
    pub count_failed_requests: bool,
    /// Budget reservation per request, used until a response reports real
    /// usage.
    #[serde(default = "default_reservation")]
    pub budget_reservation_usd: f64,
}

fn default_reservation() -> f64 {
    0.005
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            virtual_keys: Vec::new(),
            teams: Vec::new(),
            customers: Vec::new(),
            global: None,
            count_failed_requests: false,
            budget_reservation_usd: default_reservation(),
        }
    }
}

/// A governance entity at any level of the hierarchy. For virtual keys,
/// `key` is the opaque value callers present; teams and customers leave it
/// empty. `parent_team` / `parent_customer` wire the hierarchy upward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub parent_team: Option<String>,
    #[serde(default)]
    pub parent_customer: Option<String>,
    #[serde(default)]
    pub limits: ScopeLimits,
}

/// Budget and rate limits for one scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeLimits {
    #[serde(default)]
    pub budget: Option<BudgetConfig>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

/// A budget counter definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum spend in USD per reset period.
    pub max_limit: f64,
    pub reset_duration: ResetDuration,
    /// Seed usage, for restoring counters across restarts.
    #[serde(default)]
    pub current_usage: f64,
}

/// Token and request rate limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub token_max_limit: Option<u64>,
    #[serde(default = "ResetDuration::hour")]
    pub token_reset_duration: ResetDuration,
    #[serde(default)]
    pub request_max_limit: Option<u64>,
    #[serde(default = "ResetDuration::hour")]
    pub request_reset_duration: ResetDuration,
}

/// Allowed counter reset periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetDuration {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "1d")]
    Day,
    #[serde(rename = "1w")]
    Week,
    /// Calendar month.
    #[serde(rename = "1M")]
    Month,
}

impl ResetDuration {
    fn hour() -> Self {
        ResetDuration::Hour
    }

    /// Whether a period started at `start` has elapsed by `now`. Months
    /// use calendar arithmetic, everything else a fixed span.
    pub fn has_elapsed(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        match self {
            ResetDuration::Hour => now - start >= chrono::Duration::hours(1),
            ResetDuration::Day => now - start >= chrono::Duration::days(1),
            ResetDuration::Week => now - start >= chrono::Duration::weeks(1),
            ResetDuration::Month => {
                use chrono::Datelike;
                let now_months = now.year() as i64 * 12 + now.month() as i64;
                let start_months = start.year() as i64 * 12 + start.month() as i64;
                now_months - start_months >= 1
            }
        }
    }
}

impl Default for ResetDuration {
    fn default() -> Self {
        ResetDuration::Hour
    }
}

/// Routing rule scopes, outermost last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Global,
    Team,
    Customer,
    VirtualKey,
}

/// One routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRuleConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// CEL predicate. Empty or whitespace matches unconditionally.
    #[serde(default)]
    pub cel_expression: String,
    /// Target provider; empty keeps the request's provider.
    #[serde(default)]
    pub provider: String,
    /// Target model; empty keeps the request's model.
    #[serde(default)]
    pub model: String,
    /// Fallbacks as `provider/model` strings, prepended on match.
    #[serde(default)]
    pub fallbacks: Vec<String>,
    pub scope: RuleScope,
    /// Required for non-global scopes.
    #[serde(default)]
    pub scope_id: Option<String>,
    /// Lower = higher precedence, 0-1000.
    #[serde(default)]
    pub priority: u16,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RoutingRuleConfig {
    fn validate(&self) -> Result<()> {
        if self.priority > 1000 {
            anyhow::bail!("priority must be in 0..=1000");
        }
        if self.scope != RuleScope::Global && self.scope_id.is_none() {
            anyhow::bail!("non-global rules require a scope_id");
        }
        Ok(())
    }
}

/// Per-token USD pricing for one model.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_token: f64,
    pub output_cost_per_token: f64,
}
