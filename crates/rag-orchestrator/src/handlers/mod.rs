pub mod feedback;
pub mod health;
pub mod query;
pub mod session;
pub mod stats;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Routes of the service, without transport layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/api/v1/query", post(query::query_handler))
        .route("/api/v1/common_questions", get(stats::common_questions_handler))
        .route("/api/v1/common_themes", get(stats::common_themes_handler))
        .route("/api/v1/session/{id}", get(session::get_session_handler))
        .route("/api/v1/session/clear/{id}", post(session::clear_session_handler))
        .route("/api/v1/rating", post(feedback::submit_rating_handler))
        .route("/api/v1/rating/average/{id}", get(feedback::rating_average_handler))
        .route("/api/v1/feedback", post(feedback::submit_feedback_handler))
        .route("/api/v1/feedback/{id}", get(feedback::list_feedback_handler))
        .with_state(state)
}
