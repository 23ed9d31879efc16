use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::UsageCounter;
use crate::services::conversation::ConversationOrchestrator;
use crate::utils::error::ApiError;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub generated_at: DateTime<Utc>,
    pub limit: usize,
    pub results: Vec<UsageCounter>,
}

fn checked_limit(query: &StatsQuery) -> Result<usize, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }
    Ok(limit)
}

pub async fn common_questions_handler(
    State(orchestrator): State<Arc<ConversationOrchestrator>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let limit = checked_limit(&query)?;
    let results = orchestrator.top_questions(limit).await?;
    Ok(Json(StatsResponse {
        generated_at: Utc::now(),
        limit,
        results,
    }))
}

pub async fn common_themes_handler(
    State(orchestrator): State<Arc<ConversationOrchestrator>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let limit = checked_limit(&query)?;
    let results = orchestrator.top_themes(limit).await?;
    Ok(Json(StatsResponse {
        generated_at: Utc::now(),
        limit,
        results,
    }))
}
