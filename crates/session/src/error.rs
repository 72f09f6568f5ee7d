//! Error types for credential refresh

use std::time::Duration;

use classifier::ClassifiedError;

/// Errors from a refresh operation.
///
/// Every variant classifies as `SessionExpired`: whatever went wrong, the
/// caller no longer holds a usable credential.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh request failed: {0}")]
    Http(String),

    #[error("refresh rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    #[error("refresh timed out after {0:?}")]
    Timeout(Duration),

    #[error("refresh aborted: {0}")]
    Aborted(String),
}

impl RefreshError {
    /// HTTP status returned by the refresh endpoint, if it answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            RefreshError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn classify(&self) -> ClassifiedError {
        let mut error = ClassifiedError::session_expired(self.status());
        if let RefreshError::Timeout(_) | RefreshError::Aborted(_) = self {
            error.message = "Unauthorized: Session could not be renewed, please log in".into();
        }
        error
    }
}

/// Result alias for refresh operations.
pub type Result<T> = std::result::Result<T, RefreshError>;
