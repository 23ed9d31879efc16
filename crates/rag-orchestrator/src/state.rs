use axum::extract::FromRef;
use std::sync::Arc;

use crate::config::Settings;
use crate::database::{FeedbackRepository, KvStore};
use crate::services::conversation::ConversationOrchestrator;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ConversationOrchestrator>,
    pub store: Arc<dyn KvStore>,
    pub feedback: FeedbackRepository,
    pub settings: Arc<Settings>,
}

impl FromRef<AppState> for Arc<ConversationOrchestrator> {
    fn from_ref(state: &AppState) -> Self {
        state.orchestrator.clone()
    }
}

impl FromRef<AppState> for Arc<dyn KvStore> {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for FeedbackRepository {
    fn from_ref(state: &AppState) -> Self {
        state.feedback.clone()
    }
}
