use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::models::{RunId, RunInputs, RunRecord};
use super::pipeline::{PipelineEngine, ReviewDecision};
use super::sse;
use crate::errors::OrchestratorError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub engine: PipelineEngine,
    /// Fired when the server starts shutting down; ends open event streams.
    pub shutdown: CancellationToken,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(engine: PipelineEngine) -> Self {
        Self {
            engine,
            shutdown: CancellationToken::new(),
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateRunRequest {
    pub mode: String,
    #[serde(default)]
    pub inputs: Option<RunInputs>,
}

#[derive(Deserialize, Default)]
pub struct ReviewRequest {
    pub notes: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::ClientNotFound { .. } | OrchestratorError::RunNotFound { .. } => {
                ApiError::NotFound(message)
            }
            OrchestratorError::InvalidMode(_) | OrchestratorError::InvalidInputs(_) => {
                ApiError::BadRequest(message)
            }
            OrchestratorError::InvalidTransition { .. } => ApiError::Conflict(message),
            OrchestratorError::Store(_) | OrchestratorError::Other(_) => {
                tracing::error!(error = %message, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/clients", get(list_clients))
        .route("/clients/{client_id}/runs", post(create_run))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/logs", get(stream_run_logs))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/review", get(get_review))
        .route("/runs/{id}/review/approve", post(approve_review))
        .route("/runs/{id}/review/reject", post(reject_review))
        .route("/runs/{id}/artifacts", get(list_artifacts))
        .route("/runs/{id}/export", post(export_run))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// A malformed id cannot name a run, so it is reported like a missing one.
fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("Run {} not found", raw)))
}

fn parse_review_body(body: &Bytes) -> Result<ReviewRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(ReviewRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid review body: {}", e)))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_clients(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let clients = state
        .engine
        .clients()
        .list()
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to list clients: {:#}", e)))?;
    Ok(Json(clients))
}

async fn create_run(
    State(state): State<SharedState>,
    Path(client_id): Path<String>,
    payload: Result<Json<CreateRunRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    let run = state
        .engine
        .create_run(&client_id, &req.mode, req.inputs.unwrap_or_default())
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.list_runs().await?))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    Ok(Json(state.engine.get_run(run_id).await?))
}

async fn stream_run_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state.engine.get_run(run_id).await?;
    let subscription = state.engine.broadcaster().subscribe(run_id, run);
    let stream = sse::event_stream(subscription, state.shutdown.clone());
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    Ok(Json(state.engine.cancel_and_wait(run_id).await?))
}

async fn get_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state.engine.get_run(run_id).await?;
    Ok(Json(run.review_state))
}

async fn decide(
    state: &SharedState,
    id: &str,
    decision: ReviewDecision,
    body: &Bytes,
) -> Result<Json<RunRecord>, ApiError> {
    let run_id = parse_run_id(id)?;
    let req = parse_review_body(body)?;
    let run = state.engine.decide_review(run_id, decision, req.notes).await?;
    Ok(Json(run))
}

async fn approve_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    decide(&state, &id, ReviewDecision::Approve, &body).await
}

async fn reject_review(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    decide(&state, &id, ReviewDecision::Reject, &body).await
}

async fn list_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state.engine.get_run(run_id).await?;
    Ok(Json(run.artifacts))
}

async fn export_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run_id = parse_run_id(&id)?;
    let artifact = state.engine.force_export(run_id).await?;
    Ok((StatusCode::CREATED, Json(artifact)))
}
