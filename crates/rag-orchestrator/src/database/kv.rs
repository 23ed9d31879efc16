use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Key-value store with TTL and sorted-set counters.
///
/// `zincr` must be atomic at the store level; everything else follows the
/// usual last-writer-wins semantics.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// `ttl = None` keeps the value until deleted.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Adds `by` to `member`'s score and returns the new score.
    async fn zincr(&self, key: &str, member: &str, by: f64) -> Result<f64>;

    /// The `n` highest-scored members, best first. Equal scores order by
    /// member ascending, including at the cutoff, so the result is the same
    /// for every backend. See [`rank_top`].
    async fn ztop(&self, key: &str, n: usize) -> Result<Vec<(String, f64)>>;

    /// Adds `member` unless the set already holds `max_len` members.
    /// Returns whether the member is now in the set.
    async fn sadd_bounded(&self, key: &str, member: &str, max_len: usize) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;
}

/// Sorts by score descending, then member ascending, and keeps `n`.
pub fn rank_top(ranked: &mut Vec<(String, f64)>, n: usize) {
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(n);
}
