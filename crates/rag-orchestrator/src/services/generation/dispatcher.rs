//! Bounded-concurrency, deadline-aware front for the generation backend.
//!
//! Call path: lazy backend start (once), optional batching delay, permit,
//! backend call, permit release. The caller's deadline covers the whole path,
//! a slow or hung start included.
//!
//! When a deadline fires the in-flight backend future is dropped. For HTTP
//! backends that aborts the request on our side; the server may still finish
//! the work. Backends that spawn their own tasks are not cancelled at all.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, info, warn};

use super::backend::GenerationBackend;
use crate::config::DispatcherConfig;
use crate::models::GenerationRequest;
use crate::utils::error::{RagError, RagResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    NotStarted,
    Started,
    Closed,
}

pub struct GenerationDispatcher {
    backend: Arc<dyn GenerationBackend>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    batch_window: Duration,
    default_timeout: Duration,
    drain_timeout: Duration,
    started: OnceCell<()>,
    closed: AtomicBool,
    backend_closed: AtomicBool,
    in_flight: AtomicUsize,
}

/// Decrements the in-flight gauge on every exit path, including cancellation.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GenerationDispatcher {
    pub fn new(backend: Arc<dyn GenerationBackend>, config: &DispatcherConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            batch_window: Duration::from_millis(config.batch_window_ms),
            default_timeout: Duration::from_millis(config.request_timeout_ms),
            drain_timeout: Duration::from_millis(config.drain_timeout_ms),
            started: OnceCell::new(),
            closed: AtomicBool::new(false),
            backend_closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> DispatcherState {
        if self.closed.load(Ordering::SeqCst) {
            DispatcherState::Closed
        } else if self.started.initialized() {
            DispatcherState::Started
        } else {
            DispatcherState::NotStarted
        }
    }

    /// Calls currently executing the backend.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Starts the backend if needed. Concurrent callers share one initialization;
    /// a failed or cancelled start leaves the dispatcher `NotStarted` so the next
    /// call retries.
    ///
    /// A start that completes after `close()` has run closes the backend itself
    /// and reports `DispatcherClosed`.
    pub async fn start(&self) -> RagResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RagError::DispatcherClosed);
        }
        self.started
            .get_or_try_init(|| async {
                info!(
                    max_concurrency = self.max_concurrency,
                    batch_window_ms = self.batch_window.as_millis() as u64,
                    "Starting generation backend"
                );
                self.backend.start().await.map_err(RagError::backend)
            })
            .await?;

        if self.closed.load(Ordering::SeqCst) {
            self.close_backend().await?;
            return Err(RagError::DispatcherClosed);
        }
        Ok(())
    }

    pub async fn generate(&self, request: GenerationRequest) -> RagResult<String> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let started_at = Instant::now();

        let call = async {
            self.start().await?;
            self.dispatch(&request).await
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(text)) => {
                debug!(
                    conversation_id = %request.conversation_id,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "Generation complete"
                );
                Ok(text)
            }
            Ok(Err(e)) => {
                warn!(conversation_id = %request.conversation_id, kind = e.kind(), "Generation failed: {}", e);
                Err(e)
            }
            Err(_) => {
                warn!(
                    conversation_id = %request.conversation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Generation deadline exceeded"
                );
                Err(RagError::GenerationTimeout { timeout })
            }
        }
    }

    async fn dispatch(&self, request: &GenerationRequest) -> RagResult<String> {
        if !self.batch_window.is_zero() {
            tokio::time::sleep(self.batch_window).await;
        }

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RagError::DispatcherClosed)?;

        // Closed while queued.
        if self.closed.load(Ordering::SeqCst) {
            return Err(RagError::DispatcherClosed);
        }

        let _in_flight = InFlight::enter(&self.in_flight);
        self.backend
            .generate(&request.prompt_messages, &request.sampling_params)
            .await
            .map_err(RagError::backend)
    }

    /// Rejects new calls, waits (bounded) for in-flight ones, then closes the
    /// backend. Idempotent.
    pub async fn close(&self) -> RagResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let all = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        match tokio::time::timeout(self.drain_timeout, self.permits.acquire_many(all)).await {
            Ok(_) => debug!("Generation dispatcher drained"),
            Err(_) => warn!(
                in_flight = self.in_flight(),
                "Drain timeout elapsed, closing with calls in flight"
            ),
        }
        self.permits.close();

        // `closed` is set before this check, so a start finishing after it
        // sees the flag and closes the backend on its own.
        if self.started.initialized() {
            self.close_backend().await?;
        }
        info!("Generation dispatcher closed");
        Ok(())
    }

    async fn close_backend(&self) -> RagResult<()> {
        if self.backend_closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.close().await.map_err(RagError::backend)
    }
}
