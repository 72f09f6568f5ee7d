//! Single-flight credential refresh
//!
//! State machine:
//! - `Idle` → first 401 starts a refresh task and moves to `InFlight`
//! - `InFlight` → later 401s join the queue instead of starting another refresh
//! - refresh resolves → credential written (or cleared), every queued
//!   `PendingRetry` receives the same outcome, state returns to `Idle`
//!
//! The refresh itself runs on a spawned task so a caller that abandons its
//! request cannot abort the refresh the rest of the queue is waiting on.
//! Abandoned callers drop their `PendingRetry`, which removes them from the
//! queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use classifier::ClassifiedError;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialStore};
use crate::error::RefreshError;

/// Upper bound on a single refresh operation unless configured otherwise.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Boxed future returned by a refresh operation.
pub type RefreshFuture<'a> =
    Pin<Box<dyn Future<Output = crate::Result<Credential>> + Send + 'a>>;

/// External operation that exchanges the current session for a new credential.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn RefreshOperation>`).
pub trait RefreshOperation: Send + Sync {
    fn refresh<'a>(&'a self, current: Option<&'a Credential>) -> RefreshFuture<'a>;
}

/// Effect fired when the session can no longer be renewed.
///
/// Implementations log the user out and route them to the login surface.
/// The credential store has already been cleared when this is called.
pub trait SessionInvalidation: Send + Sync {
    fn invalidate(&self, reason: &ClassifiedError);
}

/// Outcome delivered to every caller that waited on a successful refresh.
#[derive(Debug, Clone)]
pub struct Refreshed {
    pub credential: Credential,
    /// Store generation at which `credential` was installed
    pub generation: u64,
}

type Outcome = std::result::Result<Refreshed, ClassifiedError>;

enum RefreshState {
    Idle,
    InFlight {
        queue: HashMap<u64, oneshot::Sender<Outcome>>,
    },
}

struct Inner {
    store: Arc<CredentialStore>,
    operation: Arc<dyn RefreshOperation>,
    invalidation: Arc<dyn SessionInvalidation>,
    timeout: Duration,
    state: Mutex<RefreshState>,
    next_waiter: AtomicU64,
    started: AtomicU64,
}

/// Coordinates credential refreshes so concurrent 401s share one refresh.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        operation: Arc<dyn RefreshOperation>,
        invalidation: Arc<dyn SessionInvalidation>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                operation,
                invalidation,
                timeout,
                state: Mutex::new(RefreshState::Idle),
                next_waiter: AtomicU64::new(0),
                started: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    /// Refresh the credential, joining an in-flight refresh if there is one.
    pub async fn refresh(&self) -> std::result::Result<Credential, ClassifiedError> {
        self.join(None)?.resolve().await.map(|r| r.credential)
    }

    /// Refresh on behalf of a request that was rejected at `stale_generation`.
    ///
    /// If the store already moved past that generation while idle, no new
    /// refresh is started: the newer credential is returned directly, or
    /// `SessionExpired` if the session was invalidated in the meantime.
    pub async fn refresh_after(
        &self,
        stale_generation: u64,
    ) -> std::result::Result<Refreshed, ClassifiedError> {
        self.join(Some(stale_generation))?.resolve().await
    }

    /// Enter the refresh queue, starting a refresh if none is running.
    ///
    /// Returns `Err` only when a stale caller finds the session already
    /// invalidated.
    pub fn join(
        &self,
        stale_generation: Option<u64>,
    ) -> std::result::Result<PendingRetry, ClassifiedError> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let pending = PendingRetry {
            id,
            rx,
            inner: self.inner.clone(),
        };

        let mut state = self.inner.state.lock();
        if let RefreshState::InFlight { queue } = &mut *state {
            queue.insert(id, tx);
            debug!(waiter = id, queued = queue.len(), "joined in-flight refresh");
            return Ok(pending);
        }

        let snapshot = self.inner.store.snapshot();
        if let Some(stale) = stale_generation
            && snapshot.generation > stale
        {
            drop(state);
            let Some(credential) = snapshot.credential else {
                debug!(stale, "session already invalidated");
                return Err(ClassifiedError::session_expired(Some(401)));
            };
            debug!(
                stale,
                generation = snapshot.generation,
                "credential already refreshed, reusing"
            );
            let _ = tx.send(Ok(Refreshed {
                credential,
                generation: snapshot.generation,
            }));
            return Ok(pending);
        }

        *state = RefreshState::InFlight {
            queue: HashMap::from([(id, tx)]),
        };
        drop(state);
        self.spawn_refresh(snapshot.credential, snapshot.generation);
        Ok(pending)
    }

    /// Invalidate the session if `generation` still holds the current credential.
    ///
    /// Used for a 401 on the single allowed retry. Returns true when this call
    /// cleared the store and fired the invalidation effect.
    pub fn invalidate_if_current(&self, generation: u64, reason: &ClassifiedError) -> bool {
        if !self.inner.store.clear_if_current(generation) {
            debug!(generation, "credential already replaced, skipping invalidation");
            return false;
        }
        self.inner.fire_invalidation(reason);
        true
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.inner.state.lock(), RefreshState::InFlight { .. })
    }

    /// Number of callers waiting on the in-flight refresh.
    pub fn pending(&self) -> usize {
        match &*self.inner.state.lock() {
            RefreshState::InFlight { queue } => queue.len(),
            RefreshState::Idle => 0,
        }
    }

    /// Total refresh operations started since construction.
    pub fn refreshes_started(&self) -> u64 {
        self.inner.started.load(Ordering::Relaxed)
    }

    fn spawn_refresh(&self, current: Option<Credential>, generation: u64) {
        let inner = self.inner.clone();
        let attempt_number = inner.started.fetch_add(1, Ordering::Relaxed) + 1;
        info!(generation, attempt = attempt_number, "starting credential refresh");

        tokio::spawn(async move {
            let operation = inner.operation.clone();
            let mut attempt =
                tokio::spawn(async move { operation.refresh(current.as_ref()).await });

            let result = match tokio::time::timeout(inner.timeout, &mut attempt).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(RefreshError::Aborted(e.to_string())),
                Err(_) => {
                    attempt.abort();
                    Err(RefreshError::Timeout(inner.timeout))
                }
            };
            inner.finish(result, generation);
        });
    }
}

impl Inner {
    /// Publish the refresh outcome to the store and every queued caller.
    fn finish(&self, result: crate::Result<Credential>, started_at: u64) {
        let outcome = match result {
            Ok(credential) => {
                let generation = self.store.set(credential.clone());
                metrics::counter!("pipeline_refresh_total", "result" => "success").increment(1);
                info!(generation, "credential refresh succeeded");
                Ok(Refreshed {
                    credential,
                    generation,
                })
            }
            Err(e) => {
                metrics::counter!("pipeline_refresh_total", "result" => "failure").increment(1);
                warn!(error = %e, "credential refresh failed");
                Err(e.classify())
            }
        };
        // A credential installed while the refresh ran survives its failure.
        let invalidate = outcome.is_err() && self.store.clear_if_current(started_at);

        let queue = match std::mem::replace(&mut *self.state.lock(), RefreshState::Idle) {
            RefreshState::InFlight { queue } => queue,
            RefreshState::Idle => HashMap::new(),
        };

        if let Err(error) = &outcome {
            if invalidate {
                warn!("invalidating session");
                self.fire_invalidation(error);
            } else {
                debug!(started_at, "credential replaced during refresh, session kept");
            }
        }

        debug!(waiters = queue.len(), "resolving queued retries");
        for (_, tx) in queue {
            let _ = tx.send(outcome.clone());
        }
    }

    fn fire_invalidation(&self, reason: &ClassifiedError) {
        metrics::counter!("session_invalidations_total").increment(1);
        self.invalidation.invalidate(reason);
    }
}

/// A request suspended until the in-flight refresh resolves.
///
/// Dropping it before resolution removes it from the queue; other queued
/// requests are unaffected.
pub struct PendingRetry {
    id: u64,
    rx: oneshot::Receiver<Outcome>,
    inner: Arc<Inner>,
}

impl PendingRetry {
    /// Wait for the refresh outcome.
    pub async fn resolve(mut self) -> std::result::Result<Refreshed, ClassifiedError> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RefreshError::Aborted("refresh task dropped".into()).classify()),
        }
    }
}

impl Drop for PendingRetry {
    fn drop(&mut self) {
        if let RefreshState::InFlight { queue } = &mut *self.inner.state.lock()
            && queue.remove(&self.id).is_some()
        {
            debug!(waiter = self.id, "abandoned refresh waiter removed");
        }
    }
}
