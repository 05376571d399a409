//! HTTP transport. Every failure leaves as `{"error": message}` with the
//! status chosen in [`ApiError::status`].

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, instrument, warn};

use crate::dispatcher::{DispatchError, Dispatcher, PredictMode, Prediction, PredictionResult, UnknownMode};
use crate::engine::FeatureRow;
use crate::registry::{ModelDescriptor, ModelRegistry, RegistryError, VersionTag};

pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub dispatcher: Dispatcher,
    pub model_dir: PathBuf,
    pub budget_bytes: u64,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Deserialize)]
pub struct SamplesRequest {
    pub features: Vec<FeatureRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub model: String,
    pub uuid: VersionTag,
    #[serde(rename = "sizeMB")]
    pub size_mb: f64,
}

impl From<ModelDescriptor> for ModelSummary {
    fn from(d: ModelDescriptor) -> Self {
        Self { size_mb: d.size_mb(), model: d.name, uuid: d.version }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PredictResponse {
    Vector { model_uuid: VersionTag, predictions: Vec<f64> },
    Winner { model_uuid: VersionTag, winner: usize, prediction: f64 },
}

impl From<Prediction> for PredictResponse {
    fn from(p: Prediction) -> Self {
        match p.result {
            PredictionResult::Vector(predictions) => PredictResponse::Vector { model_uuid: p.model_version, predictions },
            PredictionResult::Winner { index, value } => {
                PredictResponse::Winner { model_uuid: p.model_version, winner: index, prediction: value }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Model name is missing.")]
    MissingModel,
    #[error("Model not loaded in memory.")]
    NotLoaded,
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error(transparent)]
    UnknownMode(#[from] UnknownMode),
    #[error("method {0} not allowed, use SEARCH or POST")]
    MethodNotAllowed(Method),
    #[error("no route for {0}")]
    NoRoute(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingModel | ApiError::InvalidBody(_) | ApiError::UnknownMode(_) => StatusCode::BAD_REQUEST,
            ApiError::NotLoaded => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::NoRoute(_) => StatusCode::NOT_FOUND,
            ApiError::Registry(RegistryError::Oversize { .. }) => StatusCode::FORBIDDEN,
            ApiError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Dispatch(DispatchError::EmptyBatch) => StatusCode::BAD_REQUEST,
            ApiError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %message, "request failed");
        } else {
            warn!(status = status.as_u16(), error = %message, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/models", get(list_models))
        .route("/models/load", get(load_models))
        .route("/models/:model/load", get(load_model))
        .route("/models/:model/predict", any(predict))
        .route("/models/:model/predict/:mode", any(predict_with_mode))
        .fallback(fallback)
        .with_state(state)
}

async fn list_models(State(state): State<SharedState>) -> Json<Vec<ModelSummary>> {
    Json(state.registry.list().into_iter().map(ModelSummary::from).collect())
}

#[instrument(skip_all)]
async fn load_models(State(state): State<SharedState>) -> Result<Json<Vec<ModelSummary>>, ApiError> {
    let st = state.clone();
    let loaded = tokio::task::spawn_blocking(move || st.registry.refresh(&st.model_dir, st.budget_bytes)).await??;
    Ok(Json(loaded.into_iter().map(ModelSummary::from).collect()))
}

#[instrument(skip_all, fields(model = %model))]
async fn load_model(State(state): State<SharedState>, Path(model): Path<String>) -> Result<Json<ModelSummary>, ApiError> {
    if model.is_empty() {
        return Err(ApiError::MissingModel);
    }
    let st = state.clone();
    let loaded = tokio::task::spawn_blocking(move || st.registry.refresh_one(&st.model_dir, st.budget_bytes, &model)).await??;
    Ok(Json(loaded.into()))
}

async fn predict(
    State(state): State<SharedState>,
    method: Method,
    Path(model): Path<String>,
    body: Bytes,
) -> Result<Json<PredictResponse>, ApiError> {
    run_prediction(&state, &method, &model, None, &body).await
}

async fn predict_with_mode(
    State(state): State<SharedState>,
    method: Method,
    Path((model, mode)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<PredictResponse>, ApiError> {
    run_prediction(&state, &method, &model, Some(&mode), &body).await
}

#[instrument(skip(state, body), fields(rows = tracing::field::Empty))]
async fn run_prediction(
    state: &AppState,
    method: &Method,
    model: &str,
    mode: Option<&str>,
    body: &[u8],
) -> Result<Json<PredictResponse>, ApiError> {
    if method != Method::POST && method.as_str() != "SEARCH" {
        return Err(ApiError::MethodNotAllowed(method.clone()));
    }
    if model.is_empty() {
        return Err(ApiError::MissingModel);
    }
    let loaded = state.registry.get(model).map_err(|_| ApiError::NotLoaded)?;
    let mode = mode.map(str::parse::<PredictMode>).transpose()?.unwrap_or_default();
    let request: SamplesRequest = serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))?;
    tracing::Span::current().record("rows", request.features.len() as u64);
    let prediction = state.dispatcher.predict(&loaded, request.features, mode).await?;
    Ok(Json(prediction.into()))
}

async fn fallback(uri: Uri) -> ApiError {
    match uri.path().strip_prefix("/models/") {
        Some(rest) if rest.starts_with('/') => ApiError::MissingModel,
        _ => ApiError::NoRoute(uri.path().to_string()),
    }
}
