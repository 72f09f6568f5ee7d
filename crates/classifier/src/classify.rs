//! Status and body classification
//!
//! The message shown to the user prefers the server's own explanation: a
//! `message` field at the top level of a JSON body, or nested under `error`.
//! Without one, each kind has a fixed default.

use reqwest::StatusCode;

use crate::{ClassifiedError, ErrorKind, Failure};

/// Classify a failed call into a `ClassifiedError`.
pub fn classify(failure: Failure<'_>) -> ClassifiedError {
    match failure {
        Failure::NoResponse { reason } => {
            let reason = reason.trim();
            let message = if reason.is_empty() {
                "Network error: the server could not be reached".to_string()
            } else {
                format!("Network error: {reason}")
            };
            ClassifiedError::new(ErrorKind::Transport, message, None)
        }
        Failure::Status { status, body } => {
            let kind = classify_status(status);
            let message = extract_message(body).unwrap_or_else(|| match kind {
                ErrorKind::Unclassified(code) => unclassified_message(code),
                other => default_message(other).to_string(),
            });
            ClassifiedError::new(kind, message, Some(status))
        }
    }
}

/// Map an HTTP status to its error kind.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::InvalidInput,
        401 => ErrorKind::SessionExpired,
        403 => ErrorKind::Forbidden,
        404 => ErrorKind::NotFound,
        500 => ErrorKind::ServerError,
        503 => ErrorKind::Unavailable,
        other => ErrorKind::Unclassified(other),
    }
}

/// Pull a human message out of a JSON error body.
///
/// Accepts `{"message": "..."}` and `{"error": {"message": "..."}}`. Blank
/// messages and non-JSON bodies yield `None`.
pub fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| {
            value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
        })?
        .trim();
    if message.is_empty() {
        None
    } else {
        Some(message.to_string())
    }
}

pub(crate) fn default_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Transport => "Network error: the server could not be reached",
        ErrorKind::InvalidInput => "Bad Request: Invalid data provided",
        ErrorKind::SessionExpired => "Unauthorized: Please log in",
        ErrorKind::Forbidden => "Forbidden: You do not have permission to access this resource",
        ErrorKind::NotFound => "Not Found: The requested resource was not found",
        ErrorKind::ServerError => "Server Error: Please try again later",
        ErrorKind::Unavailable => "Service Unavailable: The server is temporarily unavailable",
        ErrorKind::Unclassified(_) => "An unknown error occurred",
    }
}

fn unclassified_message(status: u16) -> String {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Status");
    format!("{status} {reason}")
}
