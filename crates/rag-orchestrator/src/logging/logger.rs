use anyhow::Result;
use async_trait::async_trait;
use flume::{bounded, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::types::{ActivityLog, ActivityStatus};

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Queue capacity (max entries in memory before dropping)
    pub queue_capacity: usize,

    /// Entries per sink write
    pub batch_size: usize,

    /// Max wait time before flushing a partial batch (milliseconds)
    pub batch_timeout_ms: u64,

    pub worker_count: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            batch_timeout_ms: 1000,
            worker_count: 1,
        }
    }
}

/// Destination for drained activity batches.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn write_batch(&self, batch: &[ActivityLog]) -> Result<usize>;
}

/// Emits one structured `tracing` event per entry under the `activity` target.
pub struct TracingSink;

#[async_trait]
impl ActivitySink for TracingSink {
    async fn write_batch(&self, batch: &[ActivityLog]) -> Result<usize> {
        for log in batch {
            let fields = serde_json::to_string(&log.custom_fields)?;
            match log.activity_status {
                ActivityStatus::Error | ActivityStatus::Warning => warn!(
                    target: "activity",
                    turn_id = %log.turn_id,
                    conversation_id = %log.conversation_id,
                    activity = log.activity_type.as_str(),
                    status = log.activity_status.as_str(),
                    error_type = log.error_type.as_deref().unwrap_or_default(),
                    error = log.error_message.as_deref().unwrap_or_default(),
                    fields = %fields,
                    "activity recorded"
                ),
                _ => info!(
                    target: "activity",
                    turn_id = %log.turn_id,
                    conversation_id = %log.conversation_id,
                    activity = log.activity_type.as_str(),
                    status = log.activity_status.as_str(),
                    tokens = log.token_count,
                    links = log.link_count,
                    target_overlap = log.target_overlap,
                    processing_ms = log.processing_time_ms,
                    llm_ms = log.llm_call_duration_ms,
                    retrieval_ms = log.retrieval_duration_ms,
                    fields = %fields,
                    "activity recorded"
                ),
            }
        }
        Ok(batch.len())
    }
}

/// Async activity logger with queue mechanism
#[derive(Clone)]
pub struct ActivityLogger {
    sender: Sender<ActivityLog>,
}

impl ActivityLogger {
    /// Spawns the workers; must be called inside a Tokio runtime.
    pub fn new(sink: Arc<dyn ActivitySink>, config: LoggerConfig) -> Self {
        let (sender, receiver) = bounded(config.queue_capacity.max(1));

        info!(
            "Initializing ActivityLogger: queue={}, batch={}, timeout={}ms, workers={}",
            config.queue_capacity, config.batch_size, config.batch_timeout_ms, config.worker_count
        );

        for worker_id in 0..config.worker_count.max(1) {
            let sink = sink.clone();
            let receiver = receiver.clone();
            let config = config.clone();
            tokio::spawn(async move {
                Self::worker_loop(worker_id, sink, receiver, config).await;
            });
        }

        Self { sender }
    }

    /// Never blocks; a full queue drops the entry.
    pub fn log(&self, activity: ActivityLog) {
        if let Err(e) = self.sender.try_send(activity) {
            warn!("Failed to enqueue activity log (queue full?): {}", e);
        }
    }

    async fn worker_loop(
        worker_id: usize,
        sink: Arc<dyn ActivitySink>,
        receiver: Receiver<ActivityLog>,
        config: LoggerConfig,
    ) {
        debug!("Activity worker {} started", worker_id);

        let batch_size = config.batch_size.max(1);
        let batch_timeout = Duration::from_millis(config.batch_timeout_ms);
        let mut batch: Vec<ActivityLog> = Vec::with_capacity(batch_size);

        loop {
            // Block for the first entry, then fill up until size or deadline.
            match receiver.recv_async().await {
                Ok(log) => batch.push(log),
                Err(_) => {
                    debug!("Activity worker {} shutting down (channel closed)", worker_id);
                    return;
                }
            }

            let deadline = tokio::time::Instant::now() + batch_timeout;
            let mut closed = false;
            while batch.len() < batch_size {
                match tokio::time::timeout_at(deadline, receiver.recv_async()).await {
                    Ok(Ok(log)) => batch.push(log),
                    Ok(Err(_)) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            Self::flush_batch(sink.as_ref(), &batch, worker_id).await;
            batch.clear();

            if closed {
                debug!("Activity worker {} shutting down (channel closed)", worker_id);
                return;
            }
        }
    }

    async fn flush_batch(sink: &dyn ActivitySink, batch: &[ActivityLog], worker_id: usize) {
        match sink.write_batch(batch).await {
            Ok(written) => debug!("Worker {} flushed {} activity logs", worker_id, written),
            Err(e) => error!("Worker {} failed to write activity batch: {}", worker_id, e),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_queue_full(&self) -> bool {
        self.sender.is_full()
    }
}

/// Collects entries in memory; for tests and local inspection.
#[derive(Default)]
pub struct MemorySink {
    entries: parking_lot::Mutex<Vec<ActivityLog>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ActivityLog> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl ActivitySink for MemorySink {
    async fn write_batch(&self, batch: &[ActivityLog]) -> Result<usize> {
        self.entries.lock().extend_from_slice(batch);
        Ok(batch.len())
    }
}
