use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Per-conversation write locks. Turns for one conversation id run one at a
/// time; different ids never contend.
#[derive(Clone)]
pub struct ConversationLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    /// Idle entries are swept once the map grows past this size.
    sweep_threshold: usize,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::with_sweep_threshold(1024)
    }

    pub fn with_sweep_threshold(sweep_threshold: usize) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            sweep_threshold,
        }
    }

    pub async fn acquire(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        if self.locks.len() > self.sweep_threshold {
            self.cleanup_idle();
        }

        let lock = self
            .locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        lock.lock_owned().await
    }

    /// Removes locks nobody holds or waits on. Returns how many were removed.
    pub fn cleanup_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            debug!("Swept {} idle conversation locks", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for ConversationLocks {
    fn default() -> Self {
        Self::new()
    }
}
