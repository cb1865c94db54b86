use crate::error::SupervisorError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    Supervisor(SupervisorError),
    Internal(anyhow::Error),
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        ApiError::Supervisor(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Supervisor(SupervisorError::Store(err))
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::Supervisor(err) => {
                let status = match &err {
                    SupervisorError::Validation(_) => StatusCode::BAD_REQUEST,
                    SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
                    SupervisorError::AlreadyRunning(_)
                    | SupervisorError::NotRunning(_)
                    | SupervisorError::Busy(_) => StatusCode::CONFLICT,
                    SupervisorError::LaunchFailure { .. }
                    | SupervisorError::TerminationTimeout { .. }
                    | SupervisorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!("Request failed: {}", err);
                }
                (status, err.kind(), err.to_string())
            }
            ApiError::Internal(err) => {
                error!("Request failed: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
            }
        };

        (
            status,
            Json(serde_json::json!({ "error": kind, "message": message })),
        )
            .into_response()
    }
}
