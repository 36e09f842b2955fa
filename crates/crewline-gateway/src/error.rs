use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

use crewline_core::error::CrewlineError;

/// An error rendered as `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<CrewlineError> for ApiError {
    fn from(err: CrewlineError) -> Self {
        let status = match &err {
            CrewlineError::StageNotFound(_)
            | CrewlineError::PipelineNotFound(_)
            | CrewlineError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            CrewlineError::InvalidTransition { .. }
            | CrewlineError::PredecessorsIncomplete { .. }
            | CrewlineError::BranchNotChosen { .. }
            | CrewlineError::InvalidBranchDecision { .. }
            | CrewlineError::SkipRequired(_)
            | CrewlineError::PipelineInvalid { .. }
            | CrewlineError::PipelineOwnedElsewhere { .. }
            | CrewlineError::PipelineInUse { .. } => StatusCode::CONFLICT,
            CrewlineError::Json(_) | CrewlineError::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}
