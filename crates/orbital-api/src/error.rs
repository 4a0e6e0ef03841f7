//! Maps [`EngineError`]'s stable kind tags onto HTTP status codes, so route
//! handlers stay a thin `Result<Json<T>, ApiError>` layer.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orbital_core::EngineError;
use serde::Serialize;

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) | EngineError::TypeMismatch(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::PauseExpired => StatusCode::GONE,
            EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::BreakerOpen => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::StepTimeout | EngineError::RetryExhausted(_) => StatusCode::BAD_GATEWAY,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "internal engine error");
        }

        let body = ErrorBody {
            kind: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
