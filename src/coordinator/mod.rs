//! The request coordinator.
//!
//! [`Gateway`] owns the per-request state machine: governance admission →
//! routing → plugin pre-hooks → worker dispatch with key rotation, retry
//! and fallbacks → plugin post-hooks → governance commit. States are
//! observable in traces under the `bifrost::coordinator` target.

mod stream;

pub use stream::StreamHandle;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{
    EnvironmentLoader, GatewayConfig, PluginDescriptor, PluginKind, ProviderConfig, SnapshotCell,
};
use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::governance::{GovernanceStore, PriceTable, Reservation};
use crate::mcp::{CallOrigin, McpRegistry, McpToolCall, McpToolResult};
use crate::plugin::{Plugin, PluginPipeline, PrePhase};
use crate::provider::adapters::OpenAiCompatAdapter;
use crate::provider::{Capability, KeyPool, ProviderAdapter, WorkerPool};
use crate::routing::RoutingEngine;
use crate::types::{
    GatewayRequest, GatewayResponse, RequestContext, StreamItem, Target, Usage,
};

/// Per-request ingress options supplied by the transport.
#[derive(Debug, Clone, Default)]
pub struct IngressContext {
    /// The opaque virtual key presented by the caller, if any.
    pub virtual_key: Option<String>,
    /// Ingress headers, exposed to routing rules.
    pub headers: HashMap<String, String>,
    /// Overrides the configured default deadline.
    pub timeout_override: Option<Duration>,
    /// Caller disconnect signal.
    pub cancel: Option<CancellationToken>,
}

/// Everything the coordinator needs for one provider.
pub(crate) struct ProviderRuntime {
    pub config: ProviderConfig,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub keys: KeyPool,
    pub pool: WorkerPool,
    pub capabilities: HashSet<Capability>,
}

/// One immutable configuration generation. In-flight requests keep the
/// snapshot they started with; config changes take effect on the next
/// request boundary.
pub(crate) struct GatewaySnapshot {
    pub config: GatewayConfig,
    pub providers: HashMap<String, Arc<ProviderRuntime>>,
    pub pipeline: Arc<PluginPipeline>,
    pub routing: RoutingEngine,
    pub governance: Arc<GovernanceStore>,
    pub pricing: Arc<PriceTable>,
}

/// Assembles a [`Gateway`]: config plus injected adapters and native
/// plugins.
pub struct GatewayBuilder {
    config: GatewayConfig,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    plugins: Vec<(Arc<dyn Plugin>, PluginDescriptor)>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            adapters: HashMap::new(),
            plugins: Vec::new(),
        }
    }

    /// Load `config.json`, resolve `env.VAR` references, and start from
    /// there.
    pub fn from_config_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = GatewayConfig::load(path)?;
        EnvironmentLoader::new(None).resolve_config(&mut config)?;
        Ok(Self::new(config))
    }

    /// Inject an adapter for a provider. Providers without an injected
    /// adapter get the OpenAI-compatible one.
    pub fn with_adapter(
        mut self,
        provider: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        self.adapters.insert(provider.into(), adapter);
        self
    }

    /// Register a native plugin with its descriptor.
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>, descriptor: PluginDescriptor) -> Self {
        self.plugins.push((plugin, descriptor));
        self
    }

    /// Build the gateway: spawn worker pools, compile routing rules, load
    /// WASM plugins, initialize the pipeline, and start background tasks.
    pub async fn build(self) -> GatewayResult<Gateway> {
        let snapshot = assemble(&self.config, &self.adapters, &self.plugins).await?;
        let mcp = self.config.mcp.as_ref().map(McpRegistry::new);
        let gateway = Gateway {
            snapshot: SnapshotCell::new(snapshot),
            mcp: StdMutex::new(mcp),
            adapters: self.adapters,
            native_plugins: self.plugins,
            accepting: AtomicBool::new(true),
            tasks: StdMutex::new(Vec::new()),
        };
        gateway.start_key_health_task();
        Ok(gateway)
    }
}

/// Build one snapshot from a validated config.
async fn assemble(
    config: &GatewayConfig,
    adapters: &HashMap<String, Arc<dyn ProviderAdapter>>,
    native_plugins: &[(Arc<dyn Plugin>, PluginDescriptor)],
) -> GatewayResult<GatewaySnapshot> {
    config
        .validate()
        .map_err(|e| GatewayError::validation(format!("invalid config: {:#}", e)))?;

    let mut pipeline = PluginPipeline::new();
    let mut registered: HashSet<String> = HashSet::new();
    for (plugin, descriptor) in native_plugins {
        registered.insert(descriptor.id.clone());
        pipeline.register(plugin.clone(), descriptor.clone());
    }
    for descriptor in &config.plugins {
        if registered.contains(&descriptor.id) {
            continue;
        }
        match descriptor.kind {
            PluginKind::Native => {
                tracing::warn!(
                    target: "bifrost::coordinator",
                    "native plugin '{}' declared in config but not registered, skipping",
                    descriptor.name
                );
            }
            PluginKind::Wasm => {
                #[cfg(feature = "wasm")]
                {
                    let path = descriptor.path.as_deref().ok_or_else(|| {
                        GatewayError::validation(format!(
                            "WASM plugin '{}' has no path",
                            descriptor.name
                        ))
                    })?;
                    let plugin = crate::plugin::wasm::WasmPlugin::load(path)?;
                    pipeline.register(Arc::new(plugin), descriptor.clone());
                }
                #[cfg(not(feature = "wasm"))]
                return Err(GatewayError::validation(format!(
                    "WASM plugin '{}' configured but the wasm feature is disabled",
                    descriptor.name
                )));
            }
        }
    }
    pipeline.seal();
    pipeline.init_all().await?;

    let mut providers = HashMap::new();
    for provider_config in &config.providers {
        let adapter = adapters.get(&provider_config.name).cloned().unwrap_or_else(|| {
            Arc::new(
                OpenAiCompatAdapter::new(provider_config.name.clone())
                    .with_path_overrides(provider_config.request_path_overrides.clone())
                    .with_raw_payloads(
                        provider_config.send_back_raw_request,
                        provider_config.send_back_raw_response,
                    ),
            ) as Arc<dyn ProviderAdapter>
        });
        let capabilities: HashSet<Capability> = match &provider_config.capabilities {
            Some(mask) => mask.iter().copied().collect(),
            None => adapter.capabilities().into_iter().collect(),
        };
        providers.insert(
            provider_config.name.clone(),
            Arc::new(ProviderRuntime {
                keys: KeyPool::new(provider_config.keys.clone()),
                pool: WorkerPool::new(provider_config.name.clone(), &provider_config.performance),
                adapter,
                capabilities,
                config: provider_config.clone(),
            }),
        );
    }

    Ok(GatewaySnapshot {
        providers,
        pipeline: Arc::new(pipeline),
        routing: RoutingEngine::from_rules(&config.routing_rules),
        governance: Arc::new(GovernanceStore::from_config(config)),
        pricing: Arc::new(PriceTable::from_config(config)),
        config: config.clone(),
    })
}

/// The gateway core: entry point for the request path.
pub struct Gateway {
    snapshot: SnapshotCell<GatewaySnapshot>,
    mcp: StdMutex<Option<Arc<McpRegistry>>>,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    native_plugins: Vec<(Arc<dyn Plugin>, PluginDescriptor)>,
    accepting: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    fn start_key_health_task(&self) {
        let snapshot = self.snapshot.load();
        let interval = Duration::from_secs(
            snapshot.config.core.key_health_check_interval_secs.max(1),
        );
        let providers: Vec<_> = snapshot.providers.values().map(|r| r.keys.clone()).collect();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for keys in &providers {
                    keys.restore_degraded();
                }
            }
        });
        self.tasks.lock().unwrap().push(task);
    }

    /// Execute a non-streaming request end-to-end.
    pub async fn execute(
        &self,
        request: GatewayRequest,
        ingress: IngressContext,
    ) -> GatewayResult<GatewayResponse> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(GatewayError::cancelled());
        }
        let snapshot = self.snapshot.load();

        // ACCEPTED
        let mut request = request;
        request.normalize()?;
        if request.provider.is_empty() {
            return Err(GatewayError::validation("no target provider"));
        }
        request.headers.extend(ingress.headers.clone());
        let timeout = ingress
            .timeout_override
            .unwrap_or_else(|| snapshot.config.core.default_timeout());
        if timeout.is_zero() {
            return Err(GatewayError::timeout());
        }
        let deadline = Instant::now() + timeout;
        let mut ctx = RequestContext::new(deadline);
        if let Some(parent) = &ingress.cancel {
            ctx = ctx.linked_to(parent);
        }
        tracing::debug!(
            target: "bifrost::coordinator",
            "{} ACCEPTED {} {}/{}",
            ctx.request_id,
            request.kind,
            request.provider,
            request.model
        );

        // GOVERNED
        let reservation = snapshot.governance.admit(
            &mut ctx,
            ingress.virtual_key.as_deref(),
            &request.provider,
        )?;
        tracing::debug!(target: "bifrost::coordinator", "{} GOVERNED", ctx.request_id);

        // ROUTED
        apply_routing(&snapshot.routing, &mut request, &ctx);
        tracing::debug!(
            target: "bifrost::coordinator",
            "{} ROUTED -> {}/{}",
            ctx.request_id,
            request.provider,
            request.model
        );

        // PRE_HOOKED
        let phase = snapshot
            .pipeline
            .run_pre_hooks(&mut ctx, request.clone())
            .await;
        let (result, ran) = match phase {
            PrePhase::ShortCircuited(result, ran) => (result, ran),
            PrePhase::Proceed(routed_request, ran) => {
                // DISPATCHED
                let cancel = ctx.cancel.clone();
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(GatewayError::cancelled()),
                    _ = tokio::time::sleep_until(deadline) => Err(GatewayError::timeout()),
                    result = dispatch_attempts(&snapshot, &mut ctx, &routed_request) => result,
                };
                (result, ran)
            }
        };

        // POST_HOOKED
        let result = snapshot.pipeline.run_post_hooks(&mut ctx, result, &ran).await;
        tracing::debug!(target: "bifrost::coordinator", "{} POST_HOOKED", ctx.request_id);

        // COMMITTED
        settle_governance(reservation, &snapshot.pricing, &request, &result);
        tracing::debug!(target: "bifrost::coordinator", "{} RETURNED", ctx.request_id);

        // RETURNED
        result
    }

    /// Execute a streaming request: returns the caller's chunk channel and
    /// a cancel handle. Post-hooks and governance settle exactly once when
    /// the stream ends, fails, or is cancelled.
    pub async fn execute_stream(
        &self,
        request: GatewayRequest,
        ingress: IngressContext,
    ) -> GatewayResult<(mpsc::Receiver<StreamItem>, StreamHandle)> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(GatewayError::cancelled());
        }
        let snapshot = self.snapshot.load();

        let mut request = request;
        request.stream = true;
        request.normalize()?;
        if request.provider.is_empty() {
            return Err(GatewayError::validation("no target provider"));
        }
        request.headers.extend(ingress.headers.clone());
        let timeout = ingress
            .timeout_override
            .unwrap_or_else(|| snapshot.config.core.default_timeout());
        if timeout.is_zero() {
            return Err(GatewayError::timeout());
        }
        let deadline = Instant::now() + timeout;
        let mut ctx = RequestContext::new(deadline);
        if let Some(parent) = &ingress.cancel {
            ctx = ctx.linked_to(parent);
        }

        let reservation = snapshot.governance.admit(
            &mut ctx,
            ingress.virtual_key.as_deref(),
            &request.provider,
        )?;
        apply_routing(&snapshot.routing, &mut request, &ctx);

        stream::start(snapshot, ctx, request, reservation, deadline).await
    }

    /// Execute an MCP tool call (`POST /v1/mcp/tool/execute`).
    pub async fn execute_mcp_tool(&self, call: &McpToolCall) -> GatewayResult<McpToolResult> {
        let registry = self
            .mcp
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| GatewayError::validation("MCP is not configured"))?;
        registry.execute_tool(call, CallOrigin::Direct).await
    }

    /// The MCP registry, when configured.
    pub fn mcp(&self) -> Option<Arc<McpRegistry>> {
        self.mcp.lock().unwrap().clone()
    }

    /// Committed budget usage of a virtual key, for tests and the config
    /// API.
    pub fn virtual_key_usage(&self, key: &str) -> Option<f64> {
        self.snapshot.load().governance.virtual_key_usage(key)
    }

    /// Current worker concurrency of a provider, for introspection.
    pub fn provider_active_count(&self, provider: &str) -> Option<usize> {
        self.snapshot
            .load()
            .providers
            .get(provider)
            .map(|r| r.pool.active_count())
    }

    /// Swap in a new configuration. Worker pools, routing rules,
    /// governance counters, the pipeline, and MCP clients are rebuilt;
    /// in-flight requests finish on the snapshot they started with.
    pub async fn apply_config(&self, config: GatewayConfig) -> GatewayResult<()> {
        let fresh = assemble(&config, &self.adapters, &self.native_plugins).await?;
        let old = self.snapshot.load();
        self.snapshot.store(fresh);

        // Deleting a provider cancels its in-flight requests.
        let current = self.snapshot.load();
        for (name, runtime) in &old.providers {
            if !current.providers.contains_key(name) {
                runtime.pool.shutdown(Duration::ZERO).await;
            }
        }

        let new_mcp = config.mcp.as_ref().map(McpRegistry::new);
        let old_mcp = {
            let mut guard = self.mcp.lock().unwrap();
            std::mem::replace(&mut *guard, new_mcp)
        };
        if let Some(old_mcp) = old_mcp {
            old_mcp.shutdown().await;
        }

        // Restart the key sweeper against the new pools.
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.start_key_health_task();
        Ok(())
    }

    /// Graceful shutdown: stop intake, drain pools to the grace period,
    /// run plugin cleanup, close MCP clients.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let snapshot = self.snapshot.load();
        let grace = Duration::from_secs(snapshot.config.core.shutdown_grace_secs);
        for runtime in snapshot.providers.values() {
            runtime.pool.shutdown(grace).await;
        }
        snapshot.pipeline.cleanup_all().await;
        let mcp = self.mcp.lock().unwrap().take();
        if let Some(mcp) = mcp {
            mcp.shutdown().await;
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

/// Apply the first matching routing rule: override provider/model, prepend
/// fallbacks.
fn apply_routing(routing: &RoutingEngine, request: &mut GatewayRequest, ctx: &RequestContext) {
    let Some(route) = routing.evaluate(request, ctx) else {
        return;
    };
    tracing::debug!(
        target: "bifrost::routing",
        "rule '{}' matched: {:?}/{:?}",
        route.rule_id,
        route.provider,
        route.model
    );
    if let Some(provider) = route.provider {
        request.provider = provider;
    }
    if let Some(model) = route.model {
        request.model = model;
    }
    let mut fallbacks = route.fallbacks;
    fallbacks.append(&mut request.fallbacks);
    request.fallbacks = fallbacks;
}

/// Walk the attempt list in declared order. Capability-mismatched and
/// unknown providers are skipped; a later fallback runs only after every
/// earlier target failed or was skipped.
pub(crate) async fn dispatch_attempts(
    snapshot: &GatewaySnapshot,
    ctx: &mut RequestContext,
    request: &GatewayRequest,
) -> GatewayResult<GatewayResponse> {
    let mut last_error: Option<GatewayError> = None;
    for target in request.attempt_list() {
        let Some(runtime) = snapshot.providers.get(&target.provider) else {
            tracing::debug!(
                target: "bifrost::coordinator",
                "skipping unknown provider '{}'",
                target.provider
            );
            last_error = Some(GatewayError::permanent(format!(
                "provider '{}' is not configured",
                target.provider
            )));
            continue;
        };
        if !capability_allows(runtime, request, false) {
            tracing::debug!(
                target: "bifrost::coordinator",
                "provider '{}' lacks capability for {}, skipping",
                target.provider,
                request.kind
            );
            last_error = Some(GatewayError::permanent(format!(
                "provider '{}' does not support {}",
                target.provider, request.kind
            )));
            continue;
        }

        let attempt_request = retarget(request, &target);
        let attempt = run_attempt(
            runtime.clone(),
            attempt_request,
            ctx.cancel.clone(),
            ctx.deadline,
        );
        match runtime.pool.submit(&ctx.cancel, ctx.deadline, attempt).await {
            Ok(mut response) => {
                response.provider = target.provider.clone();
                ctx.served_by = Some(target.provider.clone());
                return Ok(response);
            }
            Err(e) if matches!(e.kind, ErrorKind::Cancelled | ErrorKind::Timeout) => {
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(
                    target: "bifrost::coordinator",
                    "target {}/{} failed ({}), advancing",
                    target.provider,
                    target.model,
                    e.kind
                );
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| GatewayError::internal("empty attempt list")))
}

pub(crate) fn capability_allows(
    runtime: &ProviderRuntime,
    request: &GatewayRequest,
    stream: bool,
) -> bool {
    match Capability::required_for(request.kind, stream) {
        Some(capability) => runtime.capabilities.contains(&capability),
        None => false,
    }
}

pub(crate) fn retarget(request: &GatewayRequest, target: &Target) -> GatewayRequest {
    let mut request = request.clone();
    request.provider = target.provider.clone();
    request.model = target.model.clone();
    request
}

/// One target's attempt: key selection, the adapter call, and the retry
/// loop. Runs on a pool worker.
///
/// Transient errors retry up to `max_retries` with exponential backoff and
/// full jitter. An auth/quota failure on one key degrades it and rotates
/// to the next candidate without consuming a retry.
async fn run_attempt(
    runtime: Arc<ProviderRuntime>,
    request: GatewayRequest,
    cancel: CancellationToken,
    deadline: Instant,
) -> GatewayResult<GatewayResponse> {
    let network = runtime.config.network.clone();
    let mut keys = runtime.keys.candidates(&request.model).into_iter();
    let mut current_key = keys.next();
    if current_key.is_none() && !runtime.keys.is_empty() {
        return Err(GatewayError::permanent(format!(
            "no eligible keys for {}/{}",
            request.provider, request.model
        )));
    }

    let mut retries = 0u32;
    let mut backoff = network.backoff_initial();
    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::cancelled()),
            _ = tokio::time::sleep_until(deadline) => return Err(GatewayError::timeout()),
            outcome = runtime.adapter.dispatch(&request, current_key.as_ref(), &network) => outcome,
        };
        match outcome {
            Ok(response) => return Ok(response),
            Err(e) if e.is_auth() && current_key.is_some() => {
                if let Some(key) = current_key.take() {
                    runtime.keys.mark_degraded(&key.id);
                }
                match keys.next() {
                    // Key rotation does not count against max_retries.
                    Some(next) => current_key = Some(next),
                    None => return Err(e),
                }
            }
            Err(e) if request.kind == crate::types::RequestKind::ListModels => {
                // A listing failure flags the key but leaves it usable
                // for inference.
                if let Some(key) = &current_key {
                    runtime.keys.mark_listing_failed(&key.id);
                }
                return Err(e);
            }
            Err(e) if e.retryable => {
                if retries >= network.max_retries {
                    return Err(e);
                }
                retries += 1;
                let jittered = backoff.mul_f64(rand::random::<f64>());
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::cancelled()),
                    _ = tokio::time::sleep_until(deadline) => return Err(GatewayError::timeout()),
                    _ = tokio::time::sleep(jittered) => {}
                }
                backoff = std::cmp::min(backoff * 2, network.backoff_max());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Convert the reservation into a charge (success) or release it (error).
pub(crate) fn settle_governance(
    reservation: Reservation,
    pricing: &PriceTable,
    request: &GatewayRequest,
    result: &GatewayResult<GatewayResponse>,
) {
    match result {
        Ok(response) => {
            let usage = response.usage.unwrap_or_else(|| estimate_usage(response));
            let provider = if response.provider.is_empty() {
                request.provider.as_str()
            } else {
                response.provider.as_str()
            };
            let cost = pricing.cost(provider, &response.model, &usage);
            reservation.commit(cost, usage.total_tokens);
        }
        Err(_) => reservation.release(),
    }
}

/// Usage estimate for responses without one: a lower bound of ~4
/// characters per completion token.
pub(crate) fn estimate_usage(response: &GatewayResponse) -> Usage {
    let chars: usize = response
        .choices
        .iter()
        .filter_map(|c| c.message.content.as_deref())
        .map(str::len)
        .sum();
    Usage::new(0, (chars / 4) as u64)
}
