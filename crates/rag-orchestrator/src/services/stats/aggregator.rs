use std::sync::Arc;
use tracing::debug;

use crate::database::KvStore;
use crate::models::UsageCounter;
use crate::utils::error::{RagError, RagResult};

/// Counter family (`questions`, `themes`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsKind {
    Questions,
    Themes,
}

impl StatsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Questions => "questions",
            Self::Themes => "themes",
        }
    }
}

/// Frequency counters with a bounded sample of literal phrasings per key.
#[derive(Clone)]
pub struct UsageStatsAggregator {
    store: Arc<dyn KvStore>,
    prefix: String,
    kind: StatsKind,
    sample_size: usize,
}

impl UsageStatsAggregator {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>, kind: StatsKind, sample_size: usize) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            kind,
            sample_size,
        }
    }

    pub fn kind(&self) -> StatsKind {
        self.kind
    }

    fn counter_key(&self) -> String {
        format!("{}:stats:{}", self.prefix, self.kind.as_str())
    }

    fn examples_key(&self, normalized_key: &str) -> String {
        format!("{}:stats:{}:examples:{}", self.prefix, self.kind.as_str(), normalized_key)
    }

    /// Bumps the counter and records `raw_example` if the sample has room.
    /// Blank keys are ignored.
    pub async fn increment(&self, normalized_key: &str, raw_example: &str) -> RagResult<()> {
        let key = normalized_key.trim();
        if key.is_empty() {
            return Ok(());
        }

        let count = self
            .store
            .zincr(&self.counter_key(), key, 1.0)
            .await
            .map_err(RagError::persistence)?;

        let example = raw_example.trim();
        if self.sample_size > 0 && !example.is_empty() {
            self.store
                .sadd_bounded(&self.examples_key(key), example, self.sample_size)
                .await
                .map_err(RagError::persistence)?;
        }

        debug!(kind = self.kind.as_str(), key, count, "Usage counter incremented");
        Ok(())
    }

    /// Entries by count descending, ties by key ascending. The store applies
    /// the tie order before cutting at `n`.
    pub async fn top_k(&self, n: usize) -> RagResult<Vec<UsageCounter>> {
        let ranked = self
            .store
            .ztop(&self.counter_key(), n)
            .await
            .map_err(RagError::persistence)?;

        let mut counters = Vec::with_capacity(ranked.len());
        for (key, score) in ranked {
            let examples = self
                .store
                .smembers(&self.examples_key(&key))
                .await
                .map_err(RagError::persistence)?;
            counters.push(UsageCounter {
                normalized_key: key,
                count: score.max(0.0).round() as u64,
                examples,
            });
        }
        Ok(counters)
    }

    /// Removes the counters and their example samples.
    pub async fn clear(&self) -> RagResult<()> {
        let keys = self
            .store
            .ztop(&self.counter_key(), usize::MAX)
            .await
            .map_err(RagError::persistence)?;
        for (key, _) in keys {
            self.store
                .delete(&self.examples_key(&key))
                .await
                .map_err(RagError::persistence)?;
        }
        self.store
            .delete(&self.counter_key())
            .await
            .map_err(RagError::persistence)?;
        Ok(())
    }
}
