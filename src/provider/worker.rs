//! Per-provider bounded worker pool.
//!
//! A pool owns a bounded queue of capacity B and N workers that pull
//! attempts off it. Workers are stateless across requests; at most N
//! attempts run at any instant. Overflow behavior is configurable: drop
//! (fail fast with `provider_transient`) or block the submitter until a
//! slot opens or the request deadline fires.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PerformanceConfig;
use crate::error::{GatewayError, GatewayResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Bounded MPMC worker pool for one provider.
pub struct WorkerPool {
    name: String,
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    drop_excess: bool,
    /// Stop accepting new attempts; workers drain what is queued.
    quiesce: CancellationToken,
    /// Abort everything still outstanding after the grace period.
    hard_stop: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn N workers over a queue of capacity B.
    pub fn new(name: impl Into<String>, performance: &PerformanceConfig) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>(performance.buffer_size);
        let rx = Arc::new(Mutex::new(rx));
        let quiesce = CancellationToken::new();
        let hard_stop = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let handles = (0..performance.concurrency)
            .map(|i| {
                let rx = rx.clone();
                let quiesce = quiesce.clone();
                let hard_stop = hard_stop.clone();
                let worker_name = format!("{}[{}]", name, i);
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            tokio::select! {
                                biased;
                                _ = hard_stop.cancelled() => break,
                                job = rx.recv() => job,
                                _ = quiesce.cancelled() => {
                                    // Drain phase: run what is already
                                    // queued, then exit.
                                    match rx.try_recv() {
                                        Ok(job) => Some(job),
                                        Err(_) => break,
                                    }
                                }
                            }
                        };
                        match job {
                            Some(job) => {
                                tokio::select! {
                                    _ = hard_stop.cancelled() => break,
                                    _ = job => {}
                                }
                            }
                            None => {
                                tracing::debug!(
                                    target: "bifrost::worker",
                                    "worker {} stopping",
                                    worker_name
                                );
                                break;
                            }
                        }
                    }
                })
            })
            .collect();

        Self {
            name,
            tx,
            rx,
            drop_excess: performance.drop_excess_requests,
            quiesce,
            hard_stop,
            handles,
            active,
        }
    }

    /// Submit an attempt and await its result.
    ///
    /// The enqueue wait observes both the caller's cancel token and the
    /// request deadline. When the queue is full and `drop_excess_requests`
    /// is set, the attempt fails immediately with `provider_transient`.
    pub async fn submit<T, F>(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        attempt: F,
    ) -> GatewayResult<T>
    where
        T: Send + 'static,
        F: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        if self.quiesce.is_cancelled() {
            return Err(GatewayError::cancelled());
        }

        let (result_tx, result_rx) = oneshot::channel();
        let active = self.active.clone();
        let job: Job = Box::pin(async move {
            active.fetch_add(1, Ordering::SeqCst);
            let result = attempt.await;
            active.fetch_sub(1, Ordering::SeqCst);
            let _ = result_tx.send(result);
        });

        if self.drop_excess {
            self.tx.try_send(job).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => GatewayError::transient(format!(
                    "provider '{}' worker queue is full",
                    self.name
                )),
                mpsc::error::TrySendError::Closed(_) => GatewayError::cancelled(),
            })?;
        } else {
            tokio::select! {
                _ = cancel.cancelled() => return Err(GatewayError::cancelled()),
                _ = tokio::time::sleep_until(deadline) => return Err(GatewayError::timeout()),
                sent = self.tx.send(job) => {
                    sent.map_err(|_| GatewayError::cancelled())?;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::cancelled()),
            result = result_rx => result.map_err(|_| GatewayError::cancelled())?,
        }
    }

    /// Attempts executing right now. Never exceeds the configured
    /// concurrency.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers in this pool.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    fn queued_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Stop accepting attempts, drain the queue for up to `grace`, then
    /// fail everything still outstanding with `cancelled`.
    pub async fn shutdown(&self, grace: Duration) {
        self.quiesce.cancel();

        let drained = async {
            while self.active_count() > 0 || self.queued_count() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(grace, drained).await.is_err() {
            tracing::warn!(
                target: "bifrost::worker",
                "pool '{}' grace period elapsed, aborting outstanding attempts",
                self.name
            );
            self.hard_stop.cancel();
            // Dropping queued jobs drops their result senders, so waiting
            // submitters observe `cancelled`.
            let mut rx = self.rx.lock().await;
            while rx.try_recv().is_ok() {}
        }
    }
}
