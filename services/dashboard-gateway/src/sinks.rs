//! Pipeline collaborators hosted by the gateway
//!
//! The gateway has no UI of its own: notifications go to the log, and a lost
//! session is recorded so `/health` can tell the front end to send the user to
//! the login page.

use std::sync::atomic::{AtomicU64, Ordering};

use classifier::{ClassifiedError, Severity};
use pipeline::NotificationSink;
use session::SessionInvalidation;
use tracing::{error, info, warn};

/// Writes each notification as a structured log event.
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, err: &ClassifiedError) {
        let note = err.notification();
        match note.severity {
            Severity::Info => info!(category = note.category, message = %note.message, "notification"),
            Severity::Warning => warn!(category = note.category, message = %note.message, "notification"),
            Severity::Error => error!(category = note.category, message = %note.message, "notification"),
        }
    }
}

/// Session invalidation effect: log the login redirect and count it.
pub struct LoginRedirect {
    login_path: String,
    invalidations: AtomicU64,
}

impl LoginRedirect {
    pub fn new(login_path: impl Into<String>) -> Self {
        Self {
            login_path: login_path.into(),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    /// Sessions ended because the credential could not be renewed.
    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl SessionInvalidation for LoginRedirect {
    fn invalidate(&self, reason: &ClassifiedError) {
        let total = self.invalidations.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            redirect = %self.login_path,
            reason = %reason.message,
            total,
            "session expired, redirecting to login"
        );
    }
}
