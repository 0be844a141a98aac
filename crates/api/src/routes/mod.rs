//! HTTP route handlers.

pub mod ops;
pub mod orders;
pub mod shipments;
pub mod stock;

use uuid::Uuid;

use crate::error::ApiError;

/// Parses a UUID from a path segment or body field.
pub(crate) fn parse_uuid(field: &str, value: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(value).map_err(|e| ApiError::BadRequest(format!("Invalid {field}: {e}")))
}
