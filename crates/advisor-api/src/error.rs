//! HTTP error rendering
//!
//! Every failure leaves the gateway as `{"status": "<message>"}` with the
//! status code of its error class.

use advisor_core::{AdvisorError, ErrorKind};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

pub type Result<T> = std::result::Result<T, ApiError>;

pub const FORBIDDEN_RBAC: &str = "Account does not have the required permissions";
pub const FORBIDDEN_INTERNAL_RULE: &str =
    "This organization is not allowed to access this recommendation";

/// Largest request body the proxy buffers before forwarding
pub const MAX_PROXY_BODY: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Advisor(#[from] AdvisorError),

    /// Caller is authenticated but not allowed
    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    /// Path neither served by the gateway nor in the proxy route table
    #[error("Endpoint {0} not found")]
    UnknownEndpoint(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::UnknownEndpoint(_) => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Advisor(err) => match err.kind() {
                ErrorKind::Authentication => StatusCode::FORBIDDEN,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
                ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "status": self.to_string() }))).into_response()
    }
}
