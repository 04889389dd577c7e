pub mod channels;
pub mod health;
pub mod metrics;
pub mod scheduler;
pub mod tasks;
pub mod ws;

// Common response types
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::errors::{ApiError, AuthError, SchedulerError};
use serde::Serialize;

/// Standard API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub trace_id: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.error.as_str() {
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "forbidden" => StatusCode::FORBIDDEN,
            "not_found" => StatusCode::NOT_FOUND,
            "validation_error" => StatusCode::BAD_REQUEST,
            "conflict" => StatusCode::CONFLICT,
            "service_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ApiError> for ErrorResponse {
    fn from(err: ApiError) -> Self {
        Self {
            error: err.code,
            message: err.message,
            details: err.details,
            trace_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl From<SchedulerError> for ErrorResponse {
    fn from(err: SchedulerError) -> Self {
        ApiError::from(err).into()
    }
}

impl From<AuthError> for ErrorResponse {
    fn from(err: AuthError) -> Self {
        ApiError::from(err).into()
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.error, message = %self.message, trace_id = %self.trace_id, "Request failed");
        }
        (status, Json(self)).into_response()
    }
}

/// Standard API success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub data: T,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T: Serialize> IntoResponse for SuccessResponse<T> {
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::errors::DatabaseError;

    #[test]
    fn test_scheduler_errors_map_to_status_codes() {
        let not_found: ErrorResponse = SchedulerError::JobNotFound("t1".to_string()).into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let conflict: ErrorResponse =
            SchedulerError::Store(DatabaseError::DuplicateKey("name".to_string())).into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let invalid: ErrorResponse = SchedulerError::RegistryMiss {
            func_name: "missing".to_string(),
        }
        .into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let failed: ErrorResponse = SchedulerError::ExecutionFailed {
            job_id: "t1".to_string(),
            reason: "boom".to_string(),
        }
        .into();
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_auth_errors_map_to_status_codes() {
        let expired: ErrorResponse = AuthError::TokenExpired.into();
        assert_eq!(expired.status(), StatusCode::UNAUTHORIZED);

        let forbidden: ErrorResponse =
            AuthError::InsufficientPermissions("scheduler:admin".to_string()).into();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
    }
}
