use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::services::conversation::{CitationReport, ConversationOrchestrator};
use crate::utils::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub user_id: String,
    pub query: String,
    /// Reference answer to score the reply against.
    pub target: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub user_id: String,
    /// `[answer, links]`
    pub response: (String, Vec<String>),
    pub theme: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<CitationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_overlap: Option<f32>,
}

pub async fn query_handler(
    State(orchestrator): State<Arc<ConversationOrchestrator>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    if request.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id must not be empty".to_string()));
    }
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".to_string()));
    }
    info!("Query from {}: {} chars", request.user_id, request.query.len());

    let outcome = orchestrator
        .handle_turn(&request.user_id, &request.query, request.target.as_deref())
        .await?;

    Ok(Json(QueryResponse {
        user_id: request.user_id,
        response: (outcome.answer, outcome.links),
        theme: outcome.theme,
        citations: outcome.citations,
        target_overlap: outcome.target_overlap,
    }))
}
