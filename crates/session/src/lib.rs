//! Session credential state for the dashboard request pipeline
//!
//! Owns the two pieces of process-wide mutable state the pipeline needs:
//! the current credential (`CredentialStore`) and the refresh state machine
//! (`RefreshCoordinator`). Both are constructed explicitly and shared via
//! `Arc`, so every test can start from a fresh session.
//!
//! Credential lifecycle:
//! 1. The login surface installs a token via `CredentialStore::set()`
//! 2. The pipeline reads a `CredentialSnapshot` before each call
//! 3. A 401 sends the request through `RefreshCoordinator::refresh_after()`
//! 4. The first caller starts the single refresh; later callers join its queue
//! 5. Success writes the new credential and replays every queued request
//! 6. Failure clears the store and fires `SessionInvalidation` once

pub mod credential;
pub mod error;
pub mod http;
pub mod refresh;

pub use credential::{Credential, CredentialSnapshot, CredentialStore};
pub use error::{RefreshError, Result};
pub use http::HttpRefresh;
pub use refresh::{
    DEFAULT_REFRESH_TIMEOUT, PendingRetry, RefreshCoordinator, RefreshFuture, RefreshOperation,
    Refreshed, SessionInvalidation,
};
