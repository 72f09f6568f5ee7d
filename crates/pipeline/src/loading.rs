//! Debounced busy signal across concurrent requests
//!
//! `begin()` on 0→1 publishes busy immediately. `end()` on 1→0 schedules idle
//! after the debounce window; any `begin()` inside the window bumps the epoch
//! so the scheduled idle is discarded. The signal is a `watch` channel, so
//! subscribers only ever see transitions.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Window between the last completion and the idle signal.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

struct Counter {
    active: usize,
    /// Bumped on every 0→1 and 1→0 transition
    epoch: u64,
}

struct Inner {
    counter: Mutex<Counter>,
    busy: watch::Sender<bool>,
    debounce: Duration,
}

impl Inner {
    /// Publish idle if nothing started since `epoch` was taken.
    fn settle(&self, epoch: u64) {
        let counter = self.counter.lock();
        if counter.active != 0 || counter.epoch != epoch {
            return;
        }
        if self.busy.send_if_modified(|busy| std::mem::replace(busy, false)) {
            debug!("loading idle");
        }
    }
}

/// Counts in-flight requests and drives the busy/idle signal.
#[derive(Clone)]
pub struct LoadingAggregator {
    inner: Arc<Inner>,
}

impl LoadingAggregator {
    pub fn new(debounce: Duration) -> Self {
        let (busy, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                counter: Mutex::new(Counter {
                    active: 0,
                    epoch: 0,
                }),
                busy,
                debounce,
            }),
        }
    }

    pub fn begin(&self) {
        let mut counter = self.inner.counter.lock();
        counter.active += 1;
        if counter.active == 1 {
            counter.epoch += 1;
            if self
                .inner
                .busy
                .send_if_modified(|busy| !std::mem::replace(busy, true))
            {
                debug!("loading busy");
            }
        }
    }

    /// Ignored (and logged) when nothing is in flight.
    pub fn end(&self) {
        let mut counter = self.inner.counter.lock();
        if counter.active == 0 {
            warn!("loading end() without matching begin(), ignoring");
            return;
        }
        counter.active -= 1;
        if counter.active > 0 {
            return;
        }
        counter.epoch += 1;
        let epoch = counter.epoch;
        drop(counter);
        self.schedule_idle(epoch);
    }

    /// `begin()` now, `end()` when the guard drops.
    pub fn track(&self) -> LoadingGuard {
        self.begin();
        LoadingGuard {
            aggregator: self.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.busy.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        *self.inner.busy.borrow()
    }

    /// Requests currently counted.
    pub fn active(&self) -> usize {
        self.inner.counter.lock().active
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    fn schedule_idle(&self, epoch: u64) {
        let debounce = self.inner.debounce;
        match Handle::try_current() {
            Ok(handle) if !debounce.is_zero() => {
                let inner = self.inner.clone();
                handle.spawn(async move {
                    tokio::time::sleep(debounce).await;
                    inner.settle(epoch);
                });
            }
            // Outside a runtime there is no timer to wait on.
            _ => self.inner.settle(epoch),
        }
    }
}

impl Default for LoadingAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

/// Ends one tracked request on drop, whatever path the request exits by.
pub struct LoadingGuard {
    aggregator: LoadingAggregator,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.aggregator.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{Instant, sleep};

    /// Record every transition with its offset from `start` in milliseconds.
    fn record(
        loading: &LoadingAggregator,
        start: Instant,
    ) -> Arc<Mutex<Vec<(u128, bool)>>> {
        let history = Arc::new(Mutex::new(Vec::new()));
        let mut rx = loading.subscribe();
        let sink = history.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let value = *rx.borrow_and_update();
                sink.lock().push((start.elapsed().as_millis(), value));
            }
        });
        history
    }

    #[tokio::test(start_paused = true)]
    async fn busy_until_window_after_last_completion() {
        let loading = LoadingAggregator::new(Duration::from_millis(100));
        let start = Instant::now();
        let history = record(&loading, start);

        let first = loading.track();
        let second = loading.track();
        let third = loading.track();
        assert!(loading.is_busy());

        sleep(Duration::from_millis(10)).await;
        drop(first);
        sleep(Duration::from_millis(20)).await;
        drop(second);
        sleep(Duration::from_millis(10)).await;
        drop(third);
        assert_eq!(loading.active(), 0);

        sleep(Duration::from_millis(99)).await;
        assert!(loading.is_busy(), "still busy at 139ms");
        sleep(Duration::from_millis(2)).await;
        assert!(!loading.is_busy(), "idle by 141ms");

        let history = history.lock().clone();
        assert_eq!(history.len(), 2, "one busy and one idle transition: {history:?}");
        assert_eq!(history[0], (0, true));
        assert!(!history[1].1);
        assert_eq!(history[1].0, 140);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_inside_window_never_emits_idle() {
        let loading = LoadingAggregator::new(Duration::from_millis(100));
        let history = record(&loading, Instant::now());

        loading.begin();
        loading.end();
        sleep(Duration::from_millis(50)).await;
        loading.begin();

        sleep(Duration::from_millis(500)).await;
        assert!(loading.is_busy());
        assert_eq!(history.lock().len(), 1, "only the initial busy transition");

        loading.end();
        sleep(Duration::from_millis(101)).await;
        assert!(!loading.is_busy());
    }

    #[tokio::test]
    async fn end_without_begin_is_ignored() {
        let loading = LoadingAggregator::default();
        loading.end();
        assert_eq!(loading.active(), 0);

        loading.begin();
        assert_eq!(loading.active(), 1);
        assert!(loading.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn guard_ends_on_drop_even_when_task_aborts() {
        let loading = LoadingAggregator::new(Duration::from_millis(100));
        let tracked = loading.clone();
        let task = tokio::spawn(async move {
            let _guard = tracked.track();
            std::future::pending::<()>().await;
        });

        while loading.active() == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(loading.active(), 0);

        sleep(Duration::from_millis(150)).await;
        assert!(!loading.is_busy());
    }

    #[test]
    fn without_runtime_idle_is_immediate() {
        let loading = LoadingAggregator::new(Duration::from_millis(100));
        loading.begin();
        loading.end();
        assert!(!loading.is_busy());
    }

    #[tokio::test]
    async fn zero_window_is_immediate() {
        let loading = LoadingAggregator::new(Duration::ZERO);
        drop(loading.track());
        assert!(!loading.is_busy());
    }
}
