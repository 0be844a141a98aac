//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fulfillment::{ErrorKind, FulfillmentError};

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Malformed path or body.
    BadRequest(String),
    /// Orchestrator failure, classified by its [`ErrorKind`].
    Fulfillment(FulfillmentError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Fulfillment(err) => kind_to_status(err.kind()),
        }
    }
}

fn kind_to_status(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::TransientDependency => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (code, message) = match self {
            ApiError::BadRequest(msg) => (ErrorKind::Validation, msg),
            ApiError::Fulfillment(err) => {
                let kind = err.kind();
                let message = match kind {
                    ErrorKind::Internal => {
                        tracing::error!(error = %err, "internal server error");
                        "Internal server error".to_string()
                    }
                    ErrorKind::TransientDependency => {
                        tracing::warn!(error = %err, "dependency unavailable");
                        "A downstream service is temporarily unavailable, please retry"
                            .to_string()
                    }
                    _ => err.to_string(),
                };
                (kind, message)
            }
        };

        let body = serde_json::json!({ "error": message, "code": code.as_str() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<FulfillmentError> for ApiError {
    fn from(err: FulfillmentError) -> Self {
        ApiError::Fulfillment(err)
    }
}
