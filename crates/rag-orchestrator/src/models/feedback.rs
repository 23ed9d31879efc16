use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-text reaction to one answer. Either `feedback` (submitted on its own)
/// or `comment` (attached to a rating) is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub request_id: String,
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FeedbackEntry {
    pub fn feedback(request_id: impl Into<String>, session: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            session: session.into(),
            feedback: Some(text.into()),
            comment: None,
            created_at: Utc::now(),
        }
    }

    pub fn comment(request_id: impl Into<String>, session: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            comment: Some(text.into()),
            feedback: None,
            ..Self::feedback(request_id, session, "")
        }
    }
}

/// Aggregate of the 1..=5 ratings given in one session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingSummary {
    pub count: u64,
    pub average: f64,
}
