//! Webhook ingress: any path under `/webhooks/` resolves against a
//! workflow's declared `webhook` trigger, independent of what routes this
//! process itself exposes.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method};
use axum::routing::any;
use axum::{Json, Router};
use orbital_core::Engine;
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub run_id: Uuid,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/{*path}", any(handle))
        .with_state(state)
}

/// Any method against `/webhooks/<path>`, matched against a workflow's
/// registered `webhook` trigger for `(path, method)`. Header names are
/// compared case-insensitively; declare `requiredHeaders` keys lowercase.
pub async fn handle(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, crate::error::ApiError> {
    let header_map: HashMap<String, String> = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect();

    let payload = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };

    let run_id = state
        .engine
        .trigger_webhook(&format!("/webhooks/{path}"), method.as_str(), &header_map, payload)
        .await?;
    Ok(Json(WebhookResponse { run_id }))
}
