//! Streaming fan-out.
//!
//! One consumer task reads the adapter's event stream, runs every
//! plugin's stream-chunk hook per chunk, and forwards surviving chunks to
//! the caller over a bounded channel (a slow caller backpressures the
//! upstream read). Deltas accumulate into a synthesized response so
//! post-hooks and governance run exactly once when the stream ends, fails,
//! or is cancelled.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, GatewayError, GatewayResult};
use crate::governance::Reservation;
use crate::plugin::PrePhase;
use crate::provider::ProviderStream;
use crate::types::{
    ChunkDelta, GatewayRequest, RequestContext, StreamAccumulator, StreamChunk, StreamEnd,
    StreamItem, Usage,
};

use super::{
    capability_allows, estimate_usage, retarget, settle_governance, GatewaySnapshot,
};

/// Caller-side chunk buffer. Small on purpose: it is the backpressure
/// boundary between a slow consumer and the upstream read.
const CHUNK_BUFFER: usize = 16;

/// Cancels the stream it was returned with. Dropping the receiver has the
/// same effect.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Run pre-hooks, open the upstream stream (with fallbacks), and spawn the
/// fan-out task. Called by [`super::Gateway::execute_stream`] after
/// governance and routing.
pub(crate) async fn start(
    snapshot: Arc<GatewaySnapshot>,
    mut ctx: RequestContext,
    request: GatewayRequest,
    reservation: Reservation,
    deadline: Instant,
) -> GatewayResult<(mpsc::Receiver<StreamItem>, StreamHandle)> {
    let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
    let handle = StreamHandle {
        cancel: ctx.cancel.clone(),
    };

    // PRE_HOOKED
    let phase = snapshot
        .pipeline
        .run_pre_hooks(&mut ctx, request.clone())
        .await;
    match phase {
        PrePhase::ShortCircuited(result, ran) => {
            let snapshot = snapshot.clone();
            tokio::spawn(async move {
                emit_short_circuit(snapshot, ctx, request, reservation, result, ran, tx).await;
            });
            Ok((rx, handle))
        }
        PrePhase::Proceed(routed_request, ran) => {
            match open_stream(&snapshot, &mut ctx, &routed_request).await {
                Ok((upstream, provider)) => {
                    let snapshot = snapshot.clone();
                    let mut routed_request = routed_request;
                    routed_request.provider = provider;
                    tokio::spawn(async move {
                        pump(
                            snapshot,
                            ctx,
                            routed_request,
                            reservation,
                            deadline,
                            upstream,
                            ran,
                            tx,
                        )
                        .await;
                    });
                    Ok((rx, handle))
                }
                Err(error) => {
                    // The stream never opened; the symmetry contract still
                    // holds for the pre-hooks that ran.
                    let result = snapshot
                        .pipeline
                        .run_post_hooks(&mut ctx, Err(error), &ran)
                        .await;
                    settle_governance(reservation, &snapshot.pricing, &request, &result);
                    match result {
                        Ok(response) => {
                            // A post-hook promoted the failure; deliver it
                            // as a short synthetic stream.
                            let id = response.id.clone();
                            let model = response.model.clone();
                            let content = response.first_content().unwrap_or_default().to_string();
                            let usage = response.usage;
                            tokio::spawn(async move {
                                let _ = tx
                                    .send(StreamItem::Chunk(StreamChunk::content(id, model, content)))
                                    .await;
                                let _ = tx
                                    .send(StreamItem::End(StreamEnd {
                                        error: None,
                                        usage,
                                        finish_reason: Some("stop".to_string()),
                                    }))
                                    .await;
                            });
                            Ok((rx, handle))
                        }
                        Err(error) => Err(error),
                    }
                }
            }
        }
    }
}

/// Walk the attempt list until a target yields an open stream.
async fn open_stream(
    snapshot: &GatewaySnapshot,
    ctx: &mut RequestContext,
    request: &GatewayRequest,
) -> GatewayResult<(ProviderStream, String)> {
    let mut last_error: Option<GatewayError> = None;
    for target in request.attempt_list() {
        let Some(runtime) = snapshot.providers.get(&target.provider) else {
            last_error = Some(GatewayError::permanent(format!(
                "provider '{}' is not configured",
                target.provider
            )));
            continue;
        };
        if !capability_allows(runtime, request, true) {
            last_error = Some(GatewayError::permanent(format!(
                "provider '{}' does not support streaming {}",
                target.provider, request.kind
            )));
            continue;
        }

        let attempt_request = retarget(request, &target);
        let runtime_for_attempt = runtime.clone();
        let cancel = ctx.cancel.clone();
        let deadline = ctx.deadline;
        let network = runtime.config.network.clone();
        let attempt = async move {
            let mut keys = runtime_for_attempt
                .keys
                .candidates(&attempt_request.model)
                .into_iter();
            let mut current_key = keys.next();
            if current_key.is_none() && !runtime_for_attempt.keys.is_empty() {
                return Err(GatewayError::permanent(format!(
                    "no eligible keys for {}/{}",
                    attempt_request.provider, attempt_request.model
                )));
            }
            let mut retries = 0u32;
            let mut backoff = network.backoff_initial();
            loop {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::cancelled()),
                    _ = tokio::time::sleep_until(deadline) => return Err(GatewayError::timeout()),
                    outcome = runtime_for_attempt
                        .adapter
                        .dispatch_stream(&attempt_request, current_key.as_ref(), &network) => outcome,
                };
                match outcome {
                    Ok(stream) => return Ok(stream),
                    Err(e) if e.is_auth() && current_key.is_some() => {
                        if let Some(key) = current_key.take() {
                            runtime_for_attempt.keys.mark_degraded(&key.id);
                        }
                        match keys.next() {
                            Some(next) => current_key = Some(next),
                            None => return Err(e),
                        }
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
        };

        match runtime.pool.submit(&ctx.cancel, ctx.deadline, attempt).await {
            Ok(stream) => {
                ctx.served_by = Some(target.provider.clone());
                return Ok((stream, target.provider.clone()));
            }
            Err(e) if matches!(e.kind, ErrorKind::Cancelled | ErrorKind::Timeout) => {
                return Err(e);
            }
            Err(e) => {
                tracing::debug!(
                    target: "bifrost::coordinator",
                    "stream target {}/{} failed ({}), advancing",
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

/// The single consumer/producer loop.
#[allow(clippy::too_many_arguments)]
async fn pump(
    snapshot: Arc<GatewaySnapshot>,
    mut ctx: RequestContext,
    request: GatewayRequest,
    reservation: Reservation,
    deadline: Instant,
    mut upstream: ProviderStream,
    ran: Vec<usize>,
    tx: mpsc::Sender<StreamItem>,
) {
    let cancel = ctx.cancel.clone();
    let mut accumulator = StreamAccumulator::new();
    let mut stream_error: Option<GatewayError> = None;
    let mut finish_reason: Option<String> = None;

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                stream_error = Some(GatewayError::cancelled());
                break;
            }
            _ = tokio::time::sleep_until(deadline) => {
                stream_error = Some(GatewayError::timeout());
                break;
            }
            next = upstream.next() => next,
        };
        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                stream_error = Some(e);
                break;
            }
        };

        match snapshot.pipeline.run_stream_chunk_hooks(&mut ctx, chunk).await {
            Ok(None) => continue,
            Ok(Some(mut chunk)) => {
                if chunk.provider.is_empty() {
                    chunk.provider = request.provider.clone();
                }
                accumulator.push(&chunk);
                if let Some(reason) = &chunk.finish_reason {
                    finish_reason = Some(reason.clone());
                }
                // Bounded send: a slow caller backpressures this loop and,
                // through it, the upstream read.
                tokio::select! {
                    _ = cancel.cancelled() => {
                        stream_error = Some(GatewayError::cancelled());
                        break;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        stream_error = Some(GatewayError::timeout());
                        break;
                    }
                    sent = tx.send(StreamItem::Chunk(chunk)) => {
                        if sent.is_err() {
                            // Receiver dropped: caller went away.
                            stream_error = Some(GatewayError::cancelled());
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                stream_error = Some(e);
                break;
            }
        }
    }
    // Closing the adapter stream aborts the upstream transport.
    drop(upstream);

    let usage = accumulator.usage();
    let delivered_chars = accumulator.delivered_chars();
    let mut partial = accumulator.finish();
    partial.provider = request.provider.clone();
    if partial.model.is_empty() {
        partial.model = request.model.clone();
    }

    // POST_HOOKED: exactly once, with the accumulated response or the
    // error. The partial response rides in the context for error-path
    // hooks that want the delivered prefix.
    let result = match stream_error.clone() {
        None => Ok(partial.clone()),
        Some(error) => {
            if let Ok(partial_json) = serde_json::to_value(&partial) {
                ctx.set_value("stream.partial_response", partial_json);
            }
            Err(error)
        }
    };
    let final_result = snapshot.pipeline.run_post_hooks(&mut ctx, result, &ran).await;

    // COMMITTED. Cancellation releases everything; a partial failure with
    // delivered content commits the lower-bound estimate.
    let committed_usage = usage.unwrap_or_else(|| Usage::new(0, (delivered_chars / 4) as u64));
    match &stream_error {
        None => {
            let cost = snapshot
                .pricing
                .cost(&request.provider, &partial.model, &committed_usage);
            reservation.commit(cost, committed_usage.total_tokens);
        }
        Some(e) if e.kind == ErrorKind::Cancelled => reservation.release(),
        Some(_) if delivered_chars > 0 || usage.is_some() => {
            let cost = snapshot
                .pricing
                .cost(&request.provider, &partial.model, &committed_usage);
            reservation.commit(cost, committed_usage.total_tokens);
        }
        Some(_) => reservation.release(),
    }

    // Exactly one end-of-stream marker.
    let end = StreamEnd {
        error: final_result.as_ref().err().cloned(),
        usage: final_result
            .as_ref()
            .ok()
            .and_then(|r| r.usage)
            .or(Some(committed_usage)),
        finish_reason,
    };
    let _ = tx.send(StreamItem::End(end)).await;
    tracing::debug!(
        target: "bifrost::coordinator",
        "{} stream finished ({} chars delivered)",
        ctx.request_id,
        delivered_chars
    );
}

/// Deliver a short-circuited result as a synthetic stream, preserving the
/// post-hook and governance contract.
async fn emit_short_circuit(
    snapshot: Arc<GatewaySnapshot>,
    mut ctx: RequestContext,
    request: GatewayRequest,
    reservation: Reservation,
    result: crate::plugin::HookResult,
    ran: Vec<usize>,
    tx: mpsc::Sender<StreamItem>,
) {
    let final_result = snapshot.pipeline.run_post_hooks(&mut ctx, result, &ran).await;
    settle_governance(reservation, &snapshot.pricing, &request, &final_result);

    match final_result {
        Ok(response) => {
            let content = response.first_content().unwrap_or_default().to_string();
            let chunk = StreamChunk {
                id: response.id.clone(),
                model: response.model.clone(),
                provider: response.provider.clone(),
                delta: ChunkDelta::Content(content),
                finish_reason: response
                    .choices
                    .first()
                    .and_then(|c| c.finish_reason.clone()),
            };
            let usage = response.usage.or_else(|| Some(estimate_usage(&response)));
            let _ = tx.send(StreamItem::Chunk(chunk)).await;
            let _ = tx
                .send(StreamItem::End(StreamEnd {
                    error: None,
                    usage,
                    finish_reason: Some("stop".to_string()),
                }))
                .await;
        }
        Err(error) => {
            let _ = tx
                .send(StreamItem::End(StreamEnd {
                    error: Some(error),
                    usage: None,
                    finish_reason: None,
                }))
                .await;
        }
    }
}
