//! Run lifecycle routes: trigger, inspect, resume, cancel.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use orbital_core::{Engine, RunRecord, RunSnapshot, StepStateRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct TriggerRequest {
    pub workflow_id: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TriggerResponse {
    pub run_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ResumeRequest {
    pub token: Uuid,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RunSnapshotResponse {
    #[schema(value_type = Object)]
    pub run: RunRecord,
    #[schema(value_type = Vec<Object>)]
    pub steps: Vec<StepStateRecord>,
}

impl From<RunSnapshot> for RunSnapshotResponse {
    fn from(snapshot: RunSnapshot) -> Self {
        Self {
            run: snapshot.run,
            steps: snapshot.steps,
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/runs/trigger", post(trigger))
        .route("/v1/runs/resume", post(resume))
        .route("/v1/runs/{run_id}", get(inspect))
        .route("/v1/runs/{run_id}/cancel", post(cancel))
        .with_state(state)
}

/// POST /v1/runs/trigger - start a run manually
#[utoipa::path(
    post,
    path = "/v1/runs/trigger",
    request_body = TriggerRequest,
    responses(
        (status = 201, description = "Run created", body = TriggerResponse),
        (status = 404, description = "Unknown workflow")
    ),
    tag = "runs"
)]
pub async fn trigger(
    State(state): State<AppState>,
    Json(req): Json<TriggerRequest>,
) -> Result<(StatusCode, Json<TriggerResponse>), crate::error::ApiError> {
    let run_id = state.engine.trigger_manual(&req.workflow_id, req.payload).await?;
    Ok((StatusCode::CREATED, Json(TriggerResponse { run_id })))
}

/// GET /v1/runs/{run_id} - inspect a run and its step states
#[utoipa::path(
    get,
    path = "/v1/runs/{run_id}",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run snapshot", body = RunSnapshotResponse),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn inspect(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunSnapshotResponse>, crate::error::ApiError> {
    let snapshot = state.engine.inspect(run_id).await?;
    Ok(Json(snapshot.into()))
}

/// POST /v1/runs/{run_id}/cancel
#[utoipa::path(
    post,
    path = "/v1/runs/{run_id}/cancel",
    params(("run_id" = Uuid, Path, description = "Run ID")),
    responses(
        (status = 200, description = "Run cancelled"),
        (status = 404, description = "Run not found")
    ),
    tag = "runs"
)]
pub async fn cancel(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<StatusCode, crate::error::ApiError> {
    state.engine.cancel_run(run_id).await?;
    Ok(StatusCode::OK)
}

/// POST /v1/runs/resume - resume a paused run via its pause token
#[utoipa::path(
    post,
    path = "/v1/runs/resume",
    request_body = ResumeRequest,
    responses(
        (status = 200, description = "Run resumed", body = TriggerResponse),
        (status = 404, description = "Pause not found"),
        (status = 410, description = "Pause expired")
    ),
    tag = "runs"
)]
pub async fn resume(
    State(state): State<AppState>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<TriggerResponse>, crate::error::ApiError> {
    let run_id = state.engine.resume(req.token, req.payload).await?;
    Ok(Json(TriggerResponse { run_id }))
}
