//! HTTP API (Axum) for message moderation.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;

use crate::classifier::{Moderation, ModerationError, TextClassifier};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("moderation failed: {0}")]
    Classifier(#[from] ModerationError),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "moderation request failed");
        let body = Json(ErrorResponse {
            detail: self.to_string(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ModerateRequest {
    pub text: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub fn create_router(classifier: Arc<dyn TextClassifier>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/moderate", post(moderate_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(classifier)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn moderate_handler(
    State(classifier): State<Arc<dyn TextClassifier>>,
    Json(req): Json<ModerateRequest>,
) -> Result<Json<Moderation>, ApiError> {
    let chars = req.text.chars().count();
    let verdict = tokio::task::spawn_blocking(move || classifier.classify(&req.text))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    tracing::info!(chars, label = verdict.label, score = verdict.score, "message moderated");
    Ok(Json(verdict))
}
