use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::models::Message;
use crate::services::conversation::ConversationOrchestrator;
use crate::utils::error::ApiError;

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: String,
    pub history: Vec<Message>,
    pub theme: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub session: String,
    pub cleared: bool,
}

pub async fn get_session_handler(
    State(orchestrator): State<Arc<ConversationOrchestrator>>,
    Path(session): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let history = orchestrator.history(&session).await?;
    let theme = orchestrator.theme(&session).await?;
    if history.is_empty() && theme.is_none() {
        return Err(ApiError::NotFound(format!("session {}", session)));
    }

    Ok(Json(SessionResponse {
        session,
        history,
        theme,
    }))
}

pub async fn clear_session_handler(
    State(orchestrator): State<Arc<ConversationOrchestrator>>,
    Path(session): Path<String>,
) -> Result<Json<ClearResponse>, ApiError> {
    let cleared = orchestrator.clear_conversation(&session).await?;
    Ok(Json(ClearResponse { session, cleared }))
}
