//! HTTP API (Axum) for face verification and engine health.

pub mod error;


use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, State},
    http::HeaderValue,
    routing::{get, post},
};
use matchu_core::{Clock, EngineFactory, SystemClock, VerificationDecision, Verifier};
use serde::Serialize;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use error::ApiError;

/// Headroom for multipart framing on top of the two file payloads.
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

/// Shared handler state.
pub struct AppState<F: EngineFactory, C: Clock = SystemClock> {
    pub verifier: Verifier<F, C>,
    pub config: Config,
}

impl<F: EngineFactory, C: Clock> AppState<F, C> {
    pub fn new(verifier: Verifier<F, C>, config: Config) -> Self {
        Self { verifier, config }
    }
}

pub fn create_router<F: EngineFactory, C: Clock>(state: Arc<AppState<F, C>>) -> Router {
    let body_limit = state
        .config
        .max_upload_bytes()
        .saturating_mul(2)
        .saturating_add(MULTIPART_OVERHEAD);
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(root_handler::<F, C>))
        .route("/health", get(health_handler))
        .route("/health/engine", get(engine_health_handler::<F, C>))
        .route("/face/verify", post(verify_handler::<F, C>))
        .route("/v1/face/verify", post(verify_handler::<F, C>))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.allows_any_origin() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_allow_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring unusable CORS origin");
                None
            }
        })
        .collect();

    // Credentials rule out wildcards, so methods and headers are mirrored.
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

#[derive(Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineHealthResponse {
    pub status: &'static str,
    pub engine_available: bool,
    pub error: Option<String>,
}

async fn root_handler<F: EngineFactory, C: Clock>(
    State(state): State<Arc<AppState<F, C>>>,
) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: state.config.app_name.clone(),
        version: state.config.app_version.clone(),
        status: "ok",
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Warm the engine up and report whether it is usable.
#[tracing::instrument(skip(state))]
async fn engine_health_handler<F: EngineFactory, C: Clock>(
    State(state): State<Arc<AppState<F, C>>>,
) -> Json<EngineHealthResponse> {
    let manager = Arc::clone(state.verifier.manager());
    let available = match tokio::task::spawn_blocking(move || manager.warmup()).await {
        Ok(available) => available,
        Err(e) => {
            tracing::error!(error = %e, "engine warmup task failed");
            false
        }
    };

    Json(EngineHealthResponse {
        status: if available { "ok" } else { "degraded" },
        engine_available: available,
        error: state.verifier.manager().last_error(),
    })
}

/// One buffered file field. Reading stops buffering past the upload cap.
struct Upload {
    content_type: Option<String>,
    data: Vec<u8>,
    oversized: bool,
}

impl Upload {
    fn validate_content_type(&self, field: &'static str) -> Result<(), ApiError> {
        let content_type = self.content_type.as_deref().unwrap_or("").to_ascii_lowercase();
        if !content_type.is_empty()
            && !content_type.starts_with("image/")
            && content_type != "application/octet-stream"
        {
            return Err(ApiError::UnsupportedMediaType { field });
        }
        Ok(())
    }

    fn into_bytes(self, field: &'static str, limit_mb: usize) -> Result<Vec<u8>, ApiError> {
        if self.oversized {
            return Err(ApiError::TooLarge { field, limit_mb });
        }
        if self.data.is_empty() {
            return Err(ApiError::EmptyUpload { field });
        }
        Ok(self.data)
    }
}

async fn read_uploads(
    mut multipart: Multipart,
    max_bytes: usize,
) -> Result<HashMap<String, Upload>, ApiError> {
    let mut uploads = HashMap::new();

    while let Some(mut field) = multipart.next_field().await? {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        let wanted = matches!(name.as_str(), "selfie" | "live" | "live_frame");
        if !wanted || uploads.contains_key(&name) {
            continue;
        }

        let mut upload = Upload {
            content_type: field.content_type().map(str::to_string),
            data: Vec::new(),
            oversized: false,
        };
        while let Some(chunk) = field.chunk().await? {
            if upload.oversized {
                continue;
            }
            if upload.data.len() + chunk.len() > max_bytes {
                upload.oversized = true;
                upload.data = Vec::new();
            } else {
                upload.data.extend_from_slice(&chunk);
            }
        }
        uploads.insert(name, upload);
    }

    Ok(uploads)
}

/// `POST /face/verify`: compare a selfie with a live capture.
async fn verify_handler<F: EngineFactory, C: Clock>(
    State(state): State<Arc<AppState<F, C>>>,
    multipart: Multipart,
) -> Result<Json<VerificationDecision>, ApiError> {
    let config = &state.config;
    let mut uploads = read_uploads(multipart, config.max_upload_bytes()).await?;

    let selfie = uploads
        .remove("selfie")
        .ok_or_else(|| {
            ApiError::MissingField("Missing file field: provide `selfie`.".to_string())
        })?;
    let live = uploads
        .remove("live_frame")
        .or_else(|| uploads.remove("live"))
        .ok_or_else(|| {
            ApiError::MissingField(
                "Missing file field: provide `live` or `live_frame`.".to_string(),
            )
        })?;

    selfie.validate_content_type("selfie")?;
    live.validate_content_type("live_frame")?;

    let selfie = selfie.into_bytes("selfie", config.max_upload_size_mb)?;
    let live = live.into_bytes("live_frame", config.max_upload_size_mb)?;

    let verifier = state.verifier.clone();
    let threshold = config.similarity_threshold;
    let decision = tokio::task::spawn_blocking(move || verifier.verify(&selfie, &live, threshold))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    Ok(Json(decision))
}
