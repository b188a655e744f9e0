use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use foreman_core::{Actor, Event, ProjectId, ProjectStatus, Signal, SignalEnvelope, ValidationError};
use foreman_runtime::{OrchestratorError, Outcome, ProjectHandle};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::registry::Registry;

#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
}

pub fn router(registry: Arc<Registry>) -> Router {
    let state = AppState { registry };
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/projects", get(list_projects))
        .route("/v1/projects/{project}/signals", post(submit_signal))
        .route("/v1/projects/{project}/ping", post(ping))
        .route("/v1/projects/{project}/status", get(status))
        .route("/v1/projects/{project}/events", get(events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_projects(State(st): State<AppState>) -> Json<Vec<ProjectId>> {
    Json(st.registry.list().await)
}

/// The first signal for an unknown project creates it.
async fn submit_signal(
    State(st): State<AppState>,
    Path(project): Path<String>,
    Json(envelope): Json<SignalEnvelope>,
) -> Result<Json<Outcome>, ApiError> {
    let handle = st.registry.get_or_open(&ProjectId::from(project)).await?;
    Ok(Json(handle.submit(envelope).await?))
}

#[derive(Debug, Deserialize)]
struct PingQuery {
    actor: Option<Actor>,
}

async fn ping(
    State(st): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<PingQuery>,
) -> Result<Json<Outcome>, ApiError> {
    let handle = known(&st, project).await?;
    let envelope = SignalEnvelope::new(query.actor.unwrap_or(Actor::Auditor), Signal::Ping);
    Ok(Json(handle.submit(envelope).await?))
}

async fn status(State(st): State<AppState>, Path(project): Path<String>) -> Result<Json<ProjectStatus>, ApiError> {
    let handle = known(&st, project).await?;
    Ok(Json(handle.status().await?))
}

async fn events(State(st): State<AppState>, Path(project): Path<String>) -> Result<Json<Vec<Event>>, ApiError> {
    let handle = known(&st, project).await?;
    Ok(Json(handle.events().await?))
}

async fn known(st: &AppState, project: String) -> Result<ProjectHandle, ApiError> {
    let project = ProjectId::from(project);
    match st.registry.get(&project).await {
        Some(handle) => Ok(handle),
        None => Err(ApiError::UnknownProject(project)),
    }
}

#[derive(Debug)]
pub enum ApiError {
    UnknownProject(ProjectId),
    Orchestrator(OrchestratorError),
    Internal(anyhow::Error),
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self::Orchestrator(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        if let Some(v) = e.downcast_ref::<ValidationError>() {
            return Self::Orchestrator(OrchestratorError::Validation(v.clone()));
        }
        Self::Internal(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match &self {
            ApiError::UnknownProject(p) => (StatusCode::NOT_FOUND, format!("unknown project: {p}")),
            ApiError::Orchestrator(OrchestratorError::Validation(e)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
            }
            ApiError::Orchestrator(e @ OrchestratorError::Stopped(_)) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            ApiError::Orchestrator(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            ApiError::Internal(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
        };
        if code.is_server_error() {
            tracing::error!(status = code.as_u16(), error = %message, "request failed");
        }
        (code, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
