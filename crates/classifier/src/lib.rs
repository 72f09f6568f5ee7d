//! Failure classification for outbound dashboard requests
//!
//! Normalizes every failed call (no response at all, or a non-success HTTP
//! status) into a `ClassifiedError` with a stable `ErrorKind`, a human message
//! and a notification severity. Classification is a pure function of the
//! failure: no shared state, no I/O, so it is usable from any layer.
//!
//! Kind mapping:
//! - no response → `Transport`
//! - 400 → `InvalidInput`, 401 → `SessionExpired`, 403 → `Forbidden`
//! - 404 → `NotFound`, 500 → `ServerError`, 503 → `Unavailable`
//! - anything else → `Unclassified(status)`

pub mod classify;

pub use classify::{classify, classify_status, extract_message};

use serde::Serialize;
use std::fmt;

/// Stable error taxonomy exposed to callers and notification sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response was received (connection refused, DNS, timeout)
    Transport,
    InvalidInput,
    /// Credential rejected and could not be renewed
    SessionExpired,
    Forbidden,
    NotFound,
    ServerError,
    Unavailable,
    /// Any status without a dedicated kind
    Unclassified(u16),
}

impl ErrorKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Unclassified(_) => "unclassified",
        }
    }

    /// How loudly the failure should be surfaced to the user.
    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::InvalidInput | ErrorKind::SessionExpired | ErrorKind::Forbidden => {
                Severity::Warning
            }
            ErrorKind::NotFound => Severity::Info,
            ErrorKind::Transport
            | ErrorKind::ServerError
            | ErrorKind::Unavailable
            | ErrorKind::Unclassified(_) => Severity::Error,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Unclassified(status) => write!(f, "unclassified({status})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Notification severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A failure normalized to one of the fixed kinds.
///
/// `original_status` is `None` for transport failures and for refresh
/// failures that never produced an HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub original_status: Option<u16>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, original_status: Option<u16>) -> Self {
        Self {
            kind,
            message: message.into(),
            original_status,
        }
    }

    /// Session-expired error with the default message.
    pub fn session_expired(original_status: Option<u16>) -> Self {
        Self::new(
            ErrorKind::SessionExpired,
            classify::default_message(ErrorKind::SessionExpired),
            original_status,
        )
    }

    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// User-facing event for a notification sink.
    pub fn notification(&self) -> Notification {
        Notification {
            message: self.message.clone(),
            severity: self.severity(),
            category: NOTIFICATION_CATEGORY,
        }
    }
}

/// Category attached to every notification produced from request failures.
pub const NOTIFICATION_CATEGORY: &str = "system";

/// Payload delivered to the user-facing notification surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
    pub severity: Severity,
    pub category: &'static str,
}

/// Raw failure as observed by the transport layer.
#[derive(Debug, Clone, Copy)]
pub enum Failure<'a> {
    /// The request never produced a response.
    NoResponse { reason: &'a str },
    /// The server answered with a non-success status.
    Status { status: u16, body: &'a str },
}
