//! Service-specific error types
//!
//! Every request-level failure the gateway returns to the front end has the
//! same body: `{"error":{"kind","message","status","request_id"}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use classifier::{ClassifiedError, ErrorKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Failure reported by the request pipeline
    #[error(transparent)]
    Pipeline(#[from] ClassifiedError),

    /// The inbound request itself could not be accepted
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Status returned to the client: the backend's own status when there was
    /// one, 502 when the backend could not be reached.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Pipeline(e) => e
                .original_status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(match e.kind {
                    ErrorKind::SessionExpired => StatusCode::UNAUTHORIZED,
                    ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    _ => StatusCode::BAD_GATEWAY,
                }),
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::Pipeline(e) => e.kind.label(),
            Error::InvalidRequest(_) => "invalid_request",
        }
    }

    fn message(&self) -> String {
        match self {
            Error::Pipeline(e) => e.message.clone(),
            Error::InvalidRequest(_) => self.to_string(),
        }
    }

    /// JSON error response tagged with the request id.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status();
        let original_status = match &self {
            Error::Pipeline(e) => e.original_status,
            Error::InvalidRequest(_) => None,
        };
        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.message(),
                "status": original_status,
                "request_id": request_id,
            }
        });
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
