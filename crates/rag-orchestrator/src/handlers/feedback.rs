use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::database::FeedbackRepository;
use crate::models::FeedbackEntry;
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct RatingRequest {
    pub request_id: String,
    pub history_session: String,
    /// Signed so out-of-range values reach the range check instead of failing
    /// deserialization.
    pub rating: i64,
    pub comment: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub request_id: String,
    pub history_session: String,
    pub feedback: String,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct RatingAverageResponse {
    pub session: String,
    pub count: u64,
    pub average: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackListResponse {
    pub session: String,
    pub entries: Vec<FeedbackEntry>,
}

fn require_session(session: &str) -> Result<(), ApiError> {
    if session.trim().is_empty() {
        return Err(ApiError::BadRequest("history_session must not be empty".to_string()));
    }
    Ok(())
}

pub async fn submit_rating_handler(
    State(feedback): State<FeedbackRepository>,
    Json(request): Json<RatingRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    require_session(&request.history_session)?;
    let rating = u8::try_from(request.rating)
        .ok()
        .filter(|r| (1..=5).contains(r))
        .ok_or_else(|| ApiError::BadRequest("rating must be 1..5".to_string()))?;

    let summary = feedback.add_rating(&request.history_session, rating).await?;
    info!(
        session = %request.history_session,
        rating,
        count = summary.count,
        "Rating submitted"
    );

    if let Some(comment) = request.comment.filter(|c| !c.trim().is_empty()) {
        let entry = FeedbackEntry::comment(request.request_id, request.history_session, comment);
        feedback.add_feedback(&entry).await?;
    }
    Ok(Json(AckResponse { ok: true }))
}

pub async fn rating_average_handler(
    State(feedback): State<FeedbackRepository>,
    Path(session): Path<String>,
) -> Result<Json<RatingAverageResponse>, ApiError> {
    let summary = feedback.rating_summary(&session).await?;
    Ok(Json(RatingAverageResponse {
        session,
        count: summary.map_or(0, |s| s.count),
        average: summary.map(|s| s.average),
    }))
}

pub async fn submit_feedback_handler(
    State(feedback): State<FeedbackRepository>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    require_session(&request.history_session)?;
    if request.feedback.trim().is_empty() {
        return Err(ApiError::BadRequest("feedback must not be empty".to_string()));
    }

    let entry = FeedbackEntry::feedback(request.request_id, request.history_session, request.feedback);
    feedback.add_feedback(&entry).await?;
    info!(session = %entry.session, "Feedback submitted");
    Ok(Json(AckResponse { ok: true }))
}

pub async fn list_feedback_handler(
    State(feedback): State<FeedbackRepository>,
    Path(session): Path<String>,
) -> Result<Json<FeedbackListResponse>, ApiError> {
    let entries = feedback.list_feedback(&session).await?;
    Ok(Json(FeedbackListResponse { session, entries }))
}
