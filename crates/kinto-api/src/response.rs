//! Response envelope and error mapping shared by every handler.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use kinto_controller::{ControlError, ControlResult, ErrorKind};
use serde::Serialize;

/// Response wrapper for consistent API format.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable error kind (`not_found`, `conflict`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            kind: None,
        })
    }
}

/// HTTP status for a controller error kind.
pub fn status_of(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Aborted => StatusCode::CONFLICT,
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: &ControlError) -> Response {
    let status = status_of(err.kind());
    if status.is_server_error() {
        tracing::error!(kind = err.kind().as_str(), error = %err, "request failed");
    }
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(err.to_string()),
            kind: Some(err.kind().as_str()),
        }),
    )
        .into_response()
}

/// `200 OK` with the value, or the mapped error.
pub fn reply<T: Serialize>(result: ControlResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `201 Created` with the value, or the mapped error.
pub fn created<T: Serialize>(result: ControlResult<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::CREATED, ApiResponse::ok(data)).into_response(),
        Err(e) => error_response(&e),
    }
}
