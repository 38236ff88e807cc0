//! API request handlers

pub mod campaigns;
pub mod health;
pub mod imports;
pub mod jobs;

pub use health::*;

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Rejection returned by every handler
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: u16, error: &str, message: impl Into<String>) -> ApiError {
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

pub(crate) fn not_found(message: &str) -> ApiError {
    api_error(404, "NOT_FOUND", message)
}
