//! Event publication route: resumes every run paused on a matching
//! `waitForEvent` step.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use orbital_core::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PublishEventRequest {
    pub name: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: Value,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PublishEventResponse {
    pub resumed_runs: Vec<Uuid>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/events", post(publish))
        .with_state(state)
}

/// POST /v1/events - publish a named event
#[utoipa::path(
    post,
    path = "/v1/events",
    request_body = PublishEventRequest,
    responses((status = 200, description = "Runs resumed by this event", body = PublishEventResponse)),
    tag = "events"
)]
pub async fn publish(
    State(state): State<AppState>,
    Json(req): Json<PublishEventRequest>,
) -> Result<Json<PublishEventResponse>, crate::error::ApiError> {
    let resumed_runs = state.engine.publish_event(&req.name, req.payload).await?;
    Ok(Json(PublishEventResponse { resumed_runs }))
}
