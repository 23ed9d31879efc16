use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::models::Modality;

/// Failure taxonomy of the orchestration core.
///
/// Only the generation path (`GenerationTimeout`, `GenerationBackend`,
/// `DispatcherClosed`) aborts a turn. The rest are recovered where they occur
/// and only reach the caller through logs or accessor calls.
#[derive(Error, Debug)]
pub enum RagError {
    #[error("{modality} retrieval unavailable: {reason}")]
    RetrievalUnavailable { modality: Modality, reason: String },

    #[error("reranking unavailable: {0}")]
    RerankUnavailable(String),

    #[error("generation timed out after {}ms", timeout.as_millis())]
    GenerationTimeout { timeout: Duration },

    #[error("generation backend error: {0}")]
    GenerationBackend(String),

    #[error("generation dispatcher is closed")]
    DispatcherClosed,

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("malformed persisted state at '{key}': {reason}")]
    MalformedPersistedState { key: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl RagError {
    /// Stable machine-readable kind, safe to expose to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RetrievalUnavailable { .. } => "retrieval_unavailable",
            Self::RerankUnavailable(_) => "rerank_unavailable",
            Self::GenerationTimeout { .. } => "generation_timeout",
            Self::GenerationBackend(_) => "generation_backend_error",
            Self::DispatcherClosed => "dispatcher_closed",
            Self::PersistenceUnavailable(_) => "persistence_unavailable",
            Self::MalformedPersistedState { .. } => "malformed_persisted_state",
            Self::InvalidConfig(_) => "invalid_config",
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::PersistenceUnavailable(err.to_string())
    }

    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::GenerationBackend(err.to_string())
    }
}

pub type RagResult<T> = Result<T, RagError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Core(#[from] RagError),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl ApiError {
    fn parts(self) -> (StatusCode, String, String) {
        match self {
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound".into(), msg)
            }
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest".into(), msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError".into(), msg)
            }
            ApiError::Core(err) => {
                let status = match &err {
                    RagError::GenerationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    RagError::GenerationBackend(_)
                    | RagError::DispatcherClosed
                    | RagError::PersistenceUnavailable(_)
                    | RagError::RetrievalUnavailable { .. }
                    | RagError::RerankUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    RagError::MalformedPersistedState { .. } | RagError::InvalidConfig(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                tracing::error!(kind = err.kind(), "Turn failed: {}", err);
                (status, err.kind().to_string(), err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = self.parts();
        (status, Json(ErrorResponse { error, message })).into_response()
    }
}
