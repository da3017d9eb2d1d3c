//! HTTP routes for registering reference clips and recognizing uploads.
//!
//! Every endpoint takes a multipart form with the audio in a field named
//! `file`. Decoding and fingerprinting run on the blocking pool.

use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info};

use crate::audio::{chunk_clip, decode::ingest};
use crate::config::EngineConfig;
use crate::error::{ConfigError, DecodeError, RecognitionError, StoreError};
use crate::fingerprint::{fingerprint_pipeline, Fingerprint};
use crate::persistance::{Metadata, SongId, SqliteStore};
use crate::recognition::{PipelineStats, RecognitionPipeline};
use crate::streaming::models::DetectionEvent;
use crate::streaming::PublishHandle;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub config: Arc<EngineConfig>,
    /// Where `/recognize` detections are published, when a transport is up.
    pub publisher: Option<PublishHandle>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed upload: {0}")]
    Multipart(#[from] MultipartError),

    #[error("missing form field `{0}`")]
    MissingField(&'static str),

    #[error("metadata must be a JSON object")]
    Metadata,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("clip cannot be analyzed: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    #[error("worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Multipart(_) | ApiError::MissingField(_) | ApiError::Metadata | ApiError::Config(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Decode(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Store(_) | ApiError::Recognition(_) | ApiError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "healthy" }))
        .route("/fingerprint", post(fingerprint))
        .route("/register", post(register))
        .route("/recognize", post(recognize))
        .with_state(state)
}

#[derive(Default)]
struct Upload {
    file: Option<Vec<u8>>,
    name: Option<String>,
    metadata: Option<String>,
}

async fn read_upload(mut form: Multipart) -> Result<Upload, ApiError> {
    let mut upload = Upload::default();

    while let Some(field) = form.next_field().await? {
        match field.name() {
            Some("file") => upload.file = Some(field.bytes().await?.to_vec()),
            Some("name") => upload.name = Some(field.text().await?),
            Some("metadata") => upload.metadata = Some(field.text().await?),
            _ => {}
        }
    }

    Ok(upload)
}

#[derive(Serialize)]
pub struct FingerprintResponse {
    fingerprints: Vec<Fingerprint>,
}

async fn fingerprint(State(state): State<AppState>, form: Multipart) -> Result<Json<FingerprintResponse>, ApiError> {
    let bytes = read_upload(form).await?.file.ok_or(ApiError::MissingField("file"))?;

    let config = Arc::clone(&state.config);
    let fingerprints = tokio::task::spawn_blocking(move || fingerprint_pipeline(&bytes, &config)).await??;

    Ok(Json(FingerprintResponse { fingerprints }))
}

#[derive(Serialize)]
pub struct RegisterResponse {
    song_id: SongId,
    name: String,
    hashes: usize,
}

async fn register(State(state): State<AppState>, form: Multipart) -> Result<Json<RegisterResponse>, ApiError> {
    let upload = read_upload(form).await?;
    let bytes = upload.file.ok_or(ApiError::MissingField("file"))?;
    let name = upload.name.ok_or(ApiError::MissingField("name"))?;
    let metadata = upload.metadata.as_deref().map(parse_metadata).transpose()?;

    let config = Arc::clone(&state.config);
    let fingerprints = tokio::task::spawn_blocking(move || fingerprint_pipeline(&bytes, &config)).await??;

    let song_id = state
        .store
        .register(&name, &fingerprints, metadata.as_ref(), None)
        .await?;

    Ok(Json(RegisterResponse {
        song_id,
        name,
        hashes: fingerprints.len(),
    }))
}

fn parse_metadata(raw: &str) -> Result<Metadata, ApiError> {
    match serde_json::from_str(raw) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        _ => Err(ApiError::Metadata),
    }
}

#[derive(Serialize)]
pub struct RecognizeResponse {
    events: Vec<DetectionEvent>,
    stats: PipelineStats,
}

async fn recognize(State(state): State<AppState>, form: Multipart) -> Result<Json<RecognizeResponse>, ApiError> {
    let bytes = read_upload(form).await?.file.ok_or(ApiError::MissingField("file"))?;

    let rate = state.config.sample_rate;
    let samples = tokio::task::spawn_blocking(move || ingest(&bytes, rate)).await??;

    let (events, stats) = recognize_clip(&state, &samples).await?;
    info!(detections = events.len(), "recognized upload");

    Ok(Json(RecognizeResponse { events, stats }))
}

/// Stream a decoded clip through a fresh pipeline. Clips shorter than the
/// configured window shrink the window to the clip.
pub async fn recognize_clip(
    state: &AppState,
    samples: &[f32],
) -> Result<(Vec<DetectionEvent>, PipelineStats), ApiError> {
    let mut config = (*state.config).clone();
    if samples.len() < config.window_samples() {
        config.window_duration_secs = samples.len() as f64 / config.sample_rate as f64;
    }

    let chunk_len = config.chunk_samples();
    let rate = config.sample_rate;
    let store = Arc::clone(&state.store);
    let mut pipeline = RecognitionPipeline::new(config, store.clone())?.with_metadata(store);
    if let Some(publisher) = &state.publisher {
        pipeline = pipeline.with_publisher(publisher.clone());
    }

    let mut events = Vec::new();
    for chunk in chunk_clip(samples, chunk_len, rate) {
        if let Some(event) = pipeline.process_chunk(&chunk).await? {
            events.push(event);
        }
    }

    Ok((events, pipeline.stats()))
}
