use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::kv::KvStore;
use crate::models::{FeedbackEntry, RatingSummary};
use crate::utils::error::{RagError, RagResult};

const RATING_SUM: &str = "sum";
const RATING_COUNT: &str = "count";

/// Answer ratings and free-text feedback, kept per session without expiry.
#[derive(Clone)]
pub struct FeedbackRepository {
    store: Arc<dyn KvStore>,
    prefix: String,
    max_entries: usize,
}

impl FeedbackRepository {
    pub fn new(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            max_entries: 1_000,
        }
    }

    /// Cap on stored feedback entries per session.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    fn rating_key(&self, session: &str) -> String {
        format!("{}:rating:{}", self.prefix, session)
    }

    fn feedback_index_key(&self, session: &str) -> String {
        format!("{}:feedback:{}", self.prefix, session)
    }

    fn feedback_key(&self, session: &str, id: &str) -> String {
        format!("{}:feedback:{}:{}", self.prefix, session, id)
    }

    /// Folds `rating` into the session's running sum and count. Range checks
    /// belong to the caller.
    pub async fn add_rating(&self, session: &str, rating: u8) -> RagResult<RatingSummary> {
        let key = self.rating_key(session);
        let sum = self
            .store
            .zincr(&key, RATING_SUM, f64::from(rating))
            .await
            .map_err(RagError::persistence)?;
        let count = self
            .store
            .zincr(&key, RATING_COUNT, 1.0)
            .await
            .map_err(RagError::persistence)?;

        debug!(session, rating, count, "Rating recorded");
        Ok(summary(sum, count))
    }

    /// `None` until the session has been rated.
    pub async fn rating_summary(&self, session: &str) -> RagResult<Option<RatingSummary>> {
        let fields = self
            .store
            .ztop(&self.rating_key(session), 2)
            .await
            .map_err(RagError::persistence)?;
        let field = |name: &str| fields.iter().find(|(m, _)| m == name).map(|(_, v)| *v);

        match (field(RATING_SUM), field(RATING_COUNT)) {
            (Some(sum), Some(count)) if count >= 1.0 => Ok(Some(summary(sum, count))),
            _ => Ok(None),
        }
    }

    /// Stores `entry` under a fresh id. Returns `false` once the session
    /// already holds the maximum number of entries.
    pub async fn add_feedback(&self, entry: &FeedbackEntry) -> RagResult<bool> {
        let id = Uuid::new_v4().to_string();
        let accepted = self
            .store
            .sadd_bounded(&self.feedback_index_key(&entry.session), &id, self.max_entries)
            .await
            .map_err(RagError::persistence)?;
        if !accepted {
            warn!(session = %entry.session, "Feedback limit reached, entry dropped");
            return Ok(false);
        }

        let raw = serde_json::to_vec(entry).map_err(RagError::persistence)?;
        self.store
            .set(&self.feedback_key(&entry.session, &id), Bytes::from(raw), None)
            .await
            .map_err(RagError::persistence)?;
        Ok(true)
    }

    /// Entries of one session, oldest first, then by request id.
    pub async fn list_feedback(&self, session: &str) -> RagResult<Vec<FeedbackEntry>> {
        let ids = self
            .store
            .smembers(&self.feedback_index_key(session))
            .await
            .map_err(RagError::persistence)?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let key = self.feedback_key(session, &id);
            let Some(raw) = self.store.get(&key).await.map_err(RagError::persistence)? else {
                continue;
            };
            let entry: FeedbackEntry =
                serde_json::from_slice(&raw).map_err(|e| RagError::MalformedPersistedState {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            entries.push(entry);
        }
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        Ok(entries)
    }
}

fn summary(sum: f64, count: f64) -> RatingSummary {
    RatingSummary {
        count: count.max(0.0).round() as u64,
        average: if count > 0.0 { sum / count } else { 0.0 },
    }
}
