use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::PipelineError;
use crate::pipeline::{Pipeline, Prediction};

/// Name of the multipart field carrying the upload.
pub const IMAGE_FIELD: &str = "image";

/// Shared, read-only state handed to every request.
pub struct AppState {
    pub pipeline: Pipeline,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("missing multipart field `image`")]
    MissingImage,
    #[error("malformed multipart body: {0}")]
    Multipart(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("prediction task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::MissingImage => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Multipart(_) => StatusCode::BAD_REQUEST,
            AppError::Pipeline(e) if e.is_client_fault() => StatusCode::BAD_REQUEST,
            AppError::Pipeline(_) | AppError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = ?self, "prediction error");
        } else {
            info!(error = %self, "rejected request");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn home() -> Json<Value> {
    Json(json!({ "status": "ok", "message": "B-cos Pipeline API is running." }))
}

async fn predict(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Prediction>, AppError> {
    let mut image_bytes = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Multipart(e.to_string()))?
    {
        if field.name() == Some(IMAGE_FIELD) {
            let file_name = field.file_name().map(str::to_owned);
            let data = field
                .bytes()
                .await
                .map_err(|e| AppError::Multipart(e.to_string()))?;
            info!(file = file_name.as_deref().unwrap_or("<unnamed>"), bytes = data.len(), "received upload");
            image_bytes = Some(data);
            break;
        }
    }
    let image_bytes = image_bytes.ok_or(AppError::MissingImage)?;

    let prediction =
        tokio::task::spawn_blocking(move || state.pipeline.predict(&image_bytes)).await??;
    Ok(Json(prediction))
}
