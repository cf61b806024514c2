//! WASM plugin host.
//!
//! WASM plugins are plain linear-memory core modules loaded with wasmtime.
//! The guest exports an allocator and the hook surface; every hook payload
//! is UTF-8 JSON. String-returning exports pack the guest pointer and
//! length into one `u64` as `(ptr << 32) | len`.
//!
//! Guest ABI:
//!   - `malloc(u32) -> u32` / `free(u32)` for host-to-guest buffers
//!   - `get_name() -> u64` (packed)
//!   - `init(cfg_ptr, cfg_len) -> i32` (0 = success)
//!   - `pre_hook(in_ptr, in_len) -> u64` (packed JSON `PreHookOutput`)
//!   - symmetric `post_hook`, `http_intercept`, `stream_chunk_hook`
//!   - `cleanup() -> i32`
//!
//! A guest returning malformed JSON is a plugin error; the pipeline's
//! symmetry guarantees still hold around it.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use wasmtime::{Engine, Instance, Linker, Memory, Module, Store, TypedFunc};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{GatewayRequest, GatewayResponse, RequestContext, StreamChunk};

use super::{HookResult, HttpCall, Plugin, PreHookOutcome};

/// Context snapshot passed to and echoed back from the guest. The echoed
/// map is merged into the host context after every hook.
#[derive(Debug, Serialize, Deserialize, Default)]
struct WireContext {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    values: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct PreHookInput<'a> {
    request: &'a GatewayRequest,
    context: WireContext,
}

#[derive(Debug, Deserialize)]
struct ShortCircuitBody {
    #[serde(default)]
    response: Option<GatewayResponse>,
    #[serde(default)]
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct PreHookOutput {
    #[serde(default)]
    request: Option<GatewayRequest>,
    #[serde(default)]
    context: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    has_short_circuit: bool,
    #[serde(default)]
    short_circuit: Option<ShortCircuitBody>,
}

#[derive(Debug, Serialize)]
struct PostHookInput<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<&'a GatewayResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a GatewayError>,
    context: WireContext,
}

#[derive(Debug, Deserialize)]
struct PostHookOutput {
    #[serde(default)]
    response: Option<GatewayResponse>,
    #[serde(default)]
    error: Option<GatewayError>,
    #[serde(default)]
    context: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct ChunkHookInput<'a> {
    chunk: &'a StreamChunk,
    context: WireContext,
}

#[derive(Debug, Deserialize)]
struct ChunkHookOutput {
    #[serde(default)]
    chunk: Option<StreamChunk>,
    #[serde(default)]
    skip: bool,
    #[serde(default)]
    context: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Serialize)]
struct HttpHookInput<'a> {
    call: &'a HttpCall,
    context: WireContext,
}

#[derive(Debug, Deserialize)]
struct HttpHookOutput {
    #[serde(default)]
    call: Option<HttpCall>,
    #[serde(default)]
    context: Option<HashMap<String, serde_json::Value>>,
}

struct GuestInstance {
    store: Store<()>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
    init: TypedFunc<(u32, u32), i32>,
    cleanup: TypedFunc<(), i32>,
    pre_hook: Option<TypedFunc<(u32, u32), u64>>,
    post_hook: Option<TypedFunc<(u32, u32), u64>>,
    http_intercept: Option<TypedFunc<(u32, u32), u64>>,
    stream_chunk_hook: Option<TypedFunc<(u32, u32), u64>>,
}

impl GuestInstance {
    fn read_packed(&mut self, packed: u64) -> GatewayResult<Vec<u8>> {
        if packed == 0 {
            return Err(GatewayError::plugin("guest hook returned no output"));
        }
        let ptr = (packed >> 32) as u32;
        let len = (packed & 0xFFFF_FFFF) as u32;
        let mut buffer = vec![0u8; len as usize];
        self.memory
            .read(&self.store, ptr as usize, &mut buffer)
            .map_err(|e| GatewayError::plugin(format!("guest memory read failed: {}", e)))?;
        // The guest owns the output buffer; return it to its allocator.
        let _ = self.free.call(&mut self.store, ptr);
        Ok(buffer)
    }

    fn write_guest(&mut self, bytes: &[u8]) -> GatewayResult<(u32, u32)> {
        let len = bytes.len() as u32;
        let ptr = self
            .malloc
            .call(&mut self.store, len)
            .map_err(|e| GatewayError::plugin(format!("guest malloc failed: {}", e)))?;
        self.memory
            .write(&mut self.store, ptr as usize, bytes)
            .map_err(|e| GatewayError::plugin(format!("guest memory write failed: {}", e)))?;
        Ok((ptr, len))
    }

    /// Serialize the input, call one packed hook export, parse the JSON it
    /// returns.
    fn call_hook<I: Serialize, O: for<'de> Deserialize<'de>>(
        &mut self,
        hook: TypedFunc<(u32, u32), u64>,
        hook_name: &str,
        input: &I,
    ) -> GatewayResult<O> {
        let payload = serde_json::to_vec(input)
            .map_err(|e| GatewayError::plugin(format!("{} input encoding failed: {}", hook_name, e)))?;
        let (ptr, len) = self.write_guest(&payload)?;
        let packed = hook
            .call(&mut self.store, (ptr, len))
            .map_err(|e| GatewayError::plugin(format!("{} trapped: {}", hook_name, e)))?;
        let _ = self.free.call(&mut self.store, ptr);
        let output = self.read_packed(packed)?;
        serde_json::from_slice(&output).map_err(|e| {
            GatewayError::plugin(format!("{} returned malformed JSON: {}", hook_name, e))
        })
    }
}

/// A WASM plugin instance. Hook calls are serialized through a mutex; the
/// guest is single-threaded by construction.
pub struct WasmPlugin {
    name: String,
    inner: Mutex<GuestInstance>,
}

impl WasmPlugin {
    /// Load and instantiate a module, then read its name via `get_name`.
    pub fn load(path: &Path) -> GatewayResult<Self> {
        let engine = Engine::default();
        let module = Module::from_file(&engine, path).map_err(|e| {
            GatewayError::plugin(format!("failed to load WASM module {}: {}", path.display(), e))
        })?;
        let linker: Linker<()> = Linker::new(&engine);
        let mut store = Store::new(&engine, ());
        let instance = linker.instantiate(&mut store, &module).map_err(|e| {
            GatewayError::plugin(format!("failed to instantiate WASM module: {}", e))
        })?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| GatewayError::plugin("WASM module exports no memory"))?;

        let malloc = required_func(&instance, &mut store, "malloc")?;
        let free = required_func(&instance, &mut store, "free")?;
        let init = required_func(&instance, &mut store, "init")?;
        let cleanup: TypedFunc<(), i32> = instance
            .get_typed_func(&mut store, "cleanup")
            .map_err(|e| GatewayError::plugin(format!("missing export 'cleanup': {}", e)))?;
        let get_name: TypedFunc<(), u64> = instance
            .get_typed_func(&mut store, "get_name")
            .map_err(|e| GatewayError::plugin(format!("missing export 'get_name': {}", e)))?;

        let pre_hook = optional_func(&instance, &mut store, "pre_hook");
        let post_hook = optional_func(&instance, &mut store, "post_hook");
        let http_intercept = optional_func(&instance, &mut store, "http_intercept");
        let stream_chunk_hook = optional_func(&instance, &mut store, "stream_chunk_hook");

        let mut guest = GuestInstance {
            store,
            memory,
            malloc,
            free,
            init,
            cleanup,
            pre_hook,
            post_hook,
            http_intercept,
            stream_chunk_hook,
        };

        let packed = get_name
            .call(&mut guest.store, ())
            .map_err(|e| GatewayError::plugin(format!("get_name trapped: {}", e)))?;
        let name_bytes = guest.read_packed(packed)?;
        let name = String::from_utf8(name_bytes)
            .map_err(|_| GatewayError::plugin("get_name returned invalid UTF-8"))?;

        tracing::debug!(target: "bifrost::plugin", "loaded WASM plugin '{}'", name);
        Ok(Self {
            name,
            inner: Mutex::new(guest),
        })
    }

    fn wire_context(ctx: &RequestContext) -> WireContext {
        WireContext {
            request_id: ctx.request_id.clone(),
            values: ctx.values.clone(),
        }
    }

    fn merge_context(ctx: &mut RequestContext, returned: Option<HashMap<String, serde_json::Value>>) {
        if let Some(values) = returned {
            ctx.values.extend(values);
        }
    }
}

fn required_func<P, R>(
    instance: &Instance,
    store: &mut Store<()>,
    name: &str,
) -> GatewayResult<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func(&mut *store, name)
        .map_err(|e| GatewayError::plugin(format!("missing export '{}': {}", name, e)))
}

fn optional_func(
    instance: &Instance,
    store: &mut Store<()>,
    name: &str,
) -> Option<TypedFunc<(u32, u32), u64>> {
    instance.get_typed_func(&mut *store, name).ok()
}

#[async_trait::async_trait]
impl Plugin for WasmPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self, config: &serde_json::Value) -> GatewayResult<()> {
        let payload = serde_json::to_vec(config)
            .map_err(|e| GatewayError::plugin(format!("config encoding failed: {}", e)))?;
        let mut guest = self.inner.lock().await;
        let (ptr, len) = guest.write_guest(&payload)?;
        let init_fn = guest.init.clone();
        let code = init_fn
            .call(&mut guest.store, (ptr, len))
            .map_err(|e| GatewayError::plugin(format!("init trapped: {}", e)))?;
        let free_fn = guest.free.clone();
        let _ = free_fn.call(&mut guest.store, ptr);
        if code != 0 {
            return Err(GatewayError::plugin(format!(
                "plugin '{}' init returned {}",
                self.name, code
            )));
        }
        Ok(())
    }

    async fn cleanup(&self) -> GatewayResult<()> {
        let mut guest = self.inner.lock().await;
        let cleanup_fn = guest.cleanup.clone();
        let code = cleanup_fn
            .call(&mut guest.store, ())
            .map_err(|e| GatewayError::plugin(format!("cleanup trapped: {}", e)))?;
        if code != 0 {
            return Err(GatewayError::plugin(format!(
                "plugin '{}' cleanup returned {}",
                self.name, code
            )));
        }
        Ok(())
    }

    async fn pre_hook(
        &self,
        ctx: &mut RequestContext,
        request: GatewayRequest,
    ) -> GatewayResult<PreHookOutcome> {
        let mut guest = self.inner.lock().await;
        let Some(hook) = guest.pre_hook.clone() else {
            return Ok(PreHookOutcome::Continue(request));
        };
        let input = PreHookInput {
            request: &request,
            context: Self::wire_context(ctx),
        };
        let output: PreHookOutput = guest.call_hook(hook, "pre_hook", &input)?;
        drop(guest);

        Self::merge_context(ctx, output.context);
        if output.has_short_circuit {
            match output.short_circuit {
                Some(ShortCircuitBody {
                    response: Some(response),
                    ..
                }) => return Ok(PreHookOutcome::ShortCircuitResponse(response)),
                Some(ShortCircuitBody {
                    error: Some(error), ..
                }) => return Ok(PreHookOutcome::ShortCircuitError(error)),
                _ => {
                    return Err(GatewayError::plugin(
                        "short_circuit set without a response or error",
                    ))
                }
            }
        }
        Ok(PreHookOutcome::Continue(output.request.unwrap_or(request)))
    }

    async fn post_hook(
        &self,
        ctx: &mut RequestContext,
        result: HookResult,
    ) -> GatewayResult<HookResult> {
        let mut guest = self.inner.lock().await;
        let Some(hook) = guest.post_hook.clone() else {
            return Ok(result);
        };
        let input = PostHookInput {
            response: result.as_ref().ok(),
            error: result.as_ref().err(),
            context: Self::wire_context(ctx),
        };
        let output: PostHookOutput = guest.call_hook(hook, "post_hook", &input)?;
        drop(guest);

        Self::merge_context(ctx, output.context);
        match (output.response, output.error) {
            (Some(response), _) => Ok(Ok(response)),
            (None, Some(error)) => Ok(Err(error)),
            (None, None) => Ok(result),
        }
    }

    async fn http_intercept(
        &self,
        ctx: &mut RequestContext,
        call: HttpCall,
    ) -> GatewayResult<HttpCall> {
        let mut guest = self.inner.lock().await;
        let Some(hook) = guest.http_intercept.clone() else {
            return Ok(call);
        };
        let input = HttpHookInput {
            call: &call,
            context: Self::wire_context(ctx),
        };
        let output: HttpHookOutput = guest.call_hook(hook, "http_intercept", &input)?;
        drop(guest);

        Self::merge_context(ctx, output.context);
        Ok(output.call.unwrap_or(call))
    }

    async fn stream_chunk_hook(
        &self,
        ctx: &mut RequestContext,
        chunk: StreamChunk,
    ) -> GatewayResult<Option<StreamChunk>> {
        let mut guest = self.inner.lock().await;
        let Some(hook) = guest.stream_chunk_hook.clone() else {
            return Ok(Some(chunk));
        };
        let input = ChunkHookInput {
            chunk: &chunk,
            context: Self::wire_context(ctx),
        };
        let output: ChunkHookOutput = guest.call_hook(hook, "stream_chunk_hook", &input)?;
        drop(guest);

        Self::merge_context(ctx, output.context);
        if output.skip {
            return Ok(None);
        }
        Ok(Some(output.chunk.unwrap_or(chunk)))
    }
}
