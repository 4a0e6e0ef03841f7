//! Workflow registration routes.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use orbital_core::Engine;
use serde::Serialize;
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub id: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", post(register))
        .with_state(state)
}

/// POST /v1/workflows - register a workflow definition
#[utoipa::path(
    post,
    path = "/v1/workflows",
    responses(
        (status = 201, description = "Workflow registered", body = RegisterResponse),
        (status = 400, description = "Malformed workflow definition")
    ),
    tag = "workflows"
)]
pub async fn register(
    State(state): State<AppState>,
    Json(def_json): Json<Value>,
) -> Result<(axum::http::StatusCode, Json<RegisterResponse>), crate::error::ApiError> {
    let def = state.engine.register(&def_json).await?;
    Ok((
        axum::http::StatusCode::CREATED,
        Json(RegisterResponse { id: def.id.clone() }),
    ))
}
