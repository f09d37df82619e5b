use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use crate::error::DeployError;

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_code: &'static str,
    pub details: Value,
}

#[derive(Debug)]
pub struct ApiError(pub DeployError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            DeployError::Validation(_) => StatusCode::BAD_REQUEST,
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployError::Conflict(_) | DeployError::InvalidState(_) => StatusCode::CONFLICT,
            DeployError::Auth(_) => StatusCode::UNAUTHORIZED,
            // 401 is reserved for the platform session; clients drop it on sight
            DeployError::GitHubAuth(_) => StatusCode::BAD_REQUEST,
            DeployError::TransientCluster(_) => StatusCode::SERVICE_UNAVAILABLE,
            DeployError::FatalCluster(_) => StatusCode::BAD_GATEWAY,
            DeployError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl<E: Into<DeployError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        ApiError(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error, details) = match &self.0 {
            DeployError::Validation(violations) => (
                self.0.to_string(),
                serde_json::to_value(violations).unwrap_or(Value::Null),
            ),
            DeployError::Internal(err) => {
                error!("Internal error: {:#}", err);
                ("internal server error".to_string(), Value::Null)
            }
            other => (other.to_string(), Value::Null),
        };
        let body = ErrorBody {
            error,
            error_code: self.0.code(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Unwrap a JSON body, reporting a malformed one as a validation error.
pub fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| DeployError::validation("body", rejection.body_text()).into())
}

pub fn query_params<T>(query: Result<axum::extract::Query<T>, QueryRejection>) -> ApiResult<T> {
    query
        .map(|axum::extract::Query(value)| value)
        .map_err(|rejection| DeployError::validation("query", rejection.body_text()).into())
}
