//! Request orchestration: credential injection, refresh-and-retry, reporting
//!
//! ```text
//! execute ─┬─ public path ──────────────► transport ─► settle
//!          └─ authenticated ─ inject ───► transport ─┬─ not 401 ─► settle
//!                                                    └─ 401 ─► refresh_after
//!                                    retry once ◄── new credential ─┘
//!                                      └─ 401 again ─► SessionExpired (terminal)
//! ```
//!
//! Every error leaving `execute` has been classified, logged, counted and
//! handed to the notification sink exactly once.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use classifier::{ClassifiedError, ErrorKind, Failure, Severity, classify};
use session::{CredentialStore, RefreshCoordinator};

use crate::loading::LoadingAggregator;
use crate::notify::NotificationSink;
use crate::request::{OutboundRequest, PathPatterns, Response};
use crate::transport::{Transport, TransportError};

/// Path rules for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Never carry a credential and never trigger a refresh
    pub public_paths: PathPatterns,
    /// Never drive the loading indicator
    pub silent_paths: PathPatterns,
    /// Prepended to endpoints passed to `get` / `post`
    pub api_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            public_paths: PathPatterns::default_public(),
            silent_paths: PathPatterns::default_silent(),
            api_prefix: "/api/v1".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Classified(#[from] ClassifiedError),

    /// The caller gave up; nothing was notified.
    #[error("request cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn classified(&self) -> Option<&ClassifiedError> {
        match self {
            PipelineError::Classified(e) => Some(e),
            PipelineError::Cancelled => None,
        }
    }
}

/// Outbound HTTP pipeline shared by every backend call.
#[derive(Clone)]
pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    refresh: RefreshCoordinator,
    loading: LoadingAggregator,
    notifier: Arc<dyn NotificationSink>,
    config: PipelineConfig,
}

impl RequestPipeline {
    pub fn new(
        transport: Arc<dyn Transport>,
        refresh: RefreshCoordinator,
        loading: LoadingAggregator,
        notifier: Arc<dyn NotificationSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            transport,
            refresh,
            loading,
            notifier,
            config,
        }
    }

    /// New request with `requires_auth` derived from the public paths.
    pub fn request(&self, method: Method, path: impl Into<String>) -> OutboundRequest {
        let mut request = OutboundRequest::new(method, path);
        if self.config.public_paths.matches(request.route()) {
            request.set_public();
        }
        request
    }

    /// Run a request through the pipeline.
    ///
    /// Dropping the returned future releases its loading slot and its place in
    /// any refresh queue; the shared refresh itself keeps running.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn execute(&self, request: OutboundRequest) -> Result<Response, ClassifiedError> {
        let _loading = (!self.config.silent_paths.matches(request.route()))
            .then(|| self.loading.track());
        let path = request.path.clone();

        match self.dispatch(request).await {
            Ok(response) => {
                metrics::counter!("pipeline_requests_total", "outcome" => "success")
                    .increment(1);
                debug!(status = response.status.as_u16(), "request succeeded");
                Ok(response)
            }
            Err(e) => {
                self.report(&path, &e);
                Err(e)
            }
        }
    }

    /// `execute`, abandoned as soon as `cancel` fires.
    pub async fn execute_cancellable(
        &self,
        request: OutboundRequest,
        cancel: &CancellationToken,
    ) -> Result<Response, PipelineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                metrics::counter!("pipeline_requests_total", "outcome" => "cancelled")
                    .increment(1);
                debug!("request cancelled by caller");
                Err(PipelineError::Cancelled)
            }
            result = self.execute(request) => result.map_err(PipelineError::from),
        }
    }

    /// GET `{api_prefix}/{endpoint}` and decode the JSON response.
    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ClassifiedError> {
        let mut request = self.request(Method::GET, self.api_path(endpoint));
        for (key, value) in params {
            request = request.with_query(*key, *value);
        }
        let path = request.path.clone();
        let response = self.execute(request).await?;
        self.decode(&path, &response)
    }

    /// POST a JSON body to `{api_prefix}/{endpoint}` and decode the response.
    pub async fn post<B, T>(&self, endpoint: &str, body: &B) -> Result<T, ClassifiedError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let path = self.api_path(endpoint);
        let request = match self.request(Method::POST, path.clone()).with_json(body) {
            Ok(request) => request,
            Err(e) => {
                let err = ClassifiedError::new(
                    ErrorKind::InvalidInput,
                    format!("Bad Request: request body could not be encoded ({e})"),
                    None,
                );
                self.report(&path, &err);
                return Err(err);
            }
        };
        let response = self.execute(request).await?;
        self.decode(&path, &response)
    }

    pub fn api_path(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_prefix.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }

    pub fn loading(&self) -> &LoadingAggregator {
        &self.loading
    }

    pub fn refresh(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        self.refresh.store()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    async fn dispatch(&self, mut request: OutboundRequest) -> Result<Response, ClassifiedError> {
        if !request.requires_auth() || self.config.public_paths.matches(request.route()) {
            return settle(self.transport.send(&request).await);
        }

        let snapshot = self.refresh.store().snapshot();
        match &snapshot.credential {
            Some(credential) => request.authorize(credential)?,
            None => debug!("no active credential, sending without Authorization"),
        }

        match self.transport.send(&request).await {
            Ok(response) if response.status == StatusCode::UNAUTHORIZED => {}
            other => return settle(other),
        }

        debug!(
            generation = snapshot.generation,
            "credential rejected, waiting for refresh"
        );
        let refreshed = self
            .refresh
            .refresh_after(snapshot.generation)
            .await
            .map_err(|e| ClassifiedError {
                original_status: Some(StatusCode::UNAUTHORIZED.as_u16()),
                ..e
            })?;
        request.authorize(&refreshed.credential)?;

        // Exactly one retry. A second 401 is terminal.
        let retry = self.transport.send(&request).await;
        if let Ok(response) = &retry
            && response.status == StatusCode::UNAUTHORIZED
        {
            let err = ClassifiedError::session_expired(Some(StatusCode::UNAUTHORIZED.as_u16()));
            warn!(
                generation = refreshed.generation,
                "refreshed credential rejected, ending session"
            );
            self.refresh.invalidate_if_current(refreshed.generation, &err);
            return Err(err);
        }
        settle(retry)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        path: &str,
        response: &Response,
    ) -> Result<T, ClassifiedError> {
        response.json().map_err(|e| {
            let status = response.status.as_u16();
            let err = ClassifiedError::new(
                ErrorKind::Unclassified(status),
                format!("Invalid response: {e}"),
                Some(status),
            );
            self.report(path, &err);
            err
        })
    }

    /// Log, count and notify a classified failure.
    fn report(&self, path: &str, err: &ClassifiedError) {
        metrics::counter!("pipeline_requests_total", "outcome" => "error").increment(1);
        metrics::counter!("pipeline_errors_total", "kind" => err.kind.label()).increment(1);

        let status = err.original_status;
        match err.severity() {
            Severity::Info => {
                info!(url = path, ?status, kind = %err.kind, message = %err.message, "request failed")
            }
            Severity::Warning => {
                warn!(url = path, ?status, kind = %err.kind, message = %err.message, "request failed")
            }
            Severity::Error => {
                error!(url = path, ?status, kind = %err.kind, message = %err.message, "request failed")
            }
        }
        self.notifier.notify(err);
    }
}

/// Turn a transport result into the pipeline result.
fn settle(result: Result<Response, TransportError>) -> Result<Response, ClassifiedError> {
    match result {
        Ok(response) if response.is_success() => Ok(response),
        Ok(response) => Err(classify(Failure::Status {
            status: response.status.as_u16(),
            body: &response.text(),
        })),
        Err(e) => Err(classify(Failure::NoResponse {
            reason: &e.to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use reqwest::header::{AUTHORIZATION, HeaderValue};
    use session::{Credential, RefreshError, RefreshFuture, RefreshOperation, SessionInvalidation};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    use crate::transport::TransportFuture;

    type Handler =
        Box<dyn Fn(&OutboundRequest) -> Option<Result<Response, TransportError>> + Send + Sync>;

    /// Transport answering from a closure. `None` never answers.
    struct MockTransport {
        handler: Handler,
        seen: Mutex<Vec<OutboundRequest>>,
    }

    impl MockTransport {
        fn new(
            handler: impl Fn(&OutboundRequest) -> Option<Result<Response, TransportError>>
            + Send
            + Sync
            + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                handler: Box::new(handler),
                seen: Mutex::new(Vec::new()),
            })
        }

        /// Backend that only accepts `Bearer {token}`.
        fn accepting(token: &'static str) -> Arc<Self> {
            Self::new(move |request| {
                let auth = request
                    .headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if auth == format!("Bearer {token}") {
                    Some(Ok(Response::new(StatusCode::OK, r#"{"ok":true}"#)))
                } else {
                    Some(Ok(Response::new(
                        StatusCode::UNAUTHORIZED,
                        r#"{"message":"token expired"}"#,
                    )))
                }
            })
        }

        fn seen_auth(&self) -> Vec<Option<String>> {
            self.seen
                .lock()
                .iter()
                .map(|r| {
                    r.headers
                        .get(AUTHORIZATION)
                        .map(|v| v.to_str().unwrap().to_string())
                })
                .collect()
        }
    }

    impl Transport for MockTransport {
        fn send<'a>(&'a self, request: &'a OutboundRequest) -> TransportFuture<'a> {
            Box::pin(async move {
                self.seen.lock().push(request.clone());
                match (self.handler)(request) {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            })
        }
    }

    struct GatedRefresh {
        calls: AtomicUsize,
        gate: Semaphore,
        result: Result<&'static str, u16>,
    }

    impl GatedRefresh {
        fn new(result: Result<&'static str, u16>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                result,
            })
        }

        fn release(&self) {
            self.gate.add_permits(1);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RefreshOperation for GatedRefresh {
        fn refresh<'a>(&'a self, _current: Option<&'a Credential>) -> RefreshFuture<'a> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.gate.acquire().await.unwrap().forget();
                match self.result {
                    Ok(token) => Ok(Credential::new(token)),
                    Err(status) => Err(RefreshError::Rejected {
                        status,
                        body: String::new(),
                    }),
                }
            })
        }
    }

    #[derive(Default)]
    struct CountingInvalidation(AtomicUsize);

    impl SessionInvalidation for CountingInvalidation {
        fn invalidate(&self, _reason: &ClassifiedError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ClassifiedError>>);

    impl NotificationSink for RecordingSink {
        fn notify(&self, error: &ClassifiedError) {
            self.0.lock().push(error.clone());
        }
    }

    struct Harness {
        pipeline: Arc<RequestPipeline>,
        transport: Arc<MockTransport>,
        refresh: Arc<GatedRefresh>,
        invalidations: Arc<CountingInvalidation>,
        notes: Arc<RecordingSink>,
    }

    impl Harness {
        fn new(transport: Arc<MockTransport>, refresh: Arc<GatedRefresh>) -> Self {
            let store = Arc::new(CredentialStore::with_credential(Credential::new("tok1")));
            let invalidations = Arc::new(CountingInvalidation::default());
            let notes = Arc::new(RecordingSink::default());
            let coordinator = RefreshCoordinator::new(
                store,
                refresh.clone(),
                invalidations.clone(),
                Duration::from_secs(5),
            );
            let pipeline = RequestPipeline::new(
                transport.clone(),
                coordinator,
                LoadingAggregator::new(Duration::from_millis(100)),
                notes.clone(),
                PipelineConfig::default(),
            );
            Self {
                pipeline: Arc::new(pipeline),
                transport,
                refresh,
                invalidations,
                notes,
            }
        }

        fn invalidations(&self) -> usize {
            self.invalidations.0.load(Ordering::SeqCst)
        }

        fn notes(&self) -> Vec<ClassifiedError> {
            self.notes.0.lock().clone()
        }

        async fn wait_for_queue(&self, n: usize) {
            while self.pipeline.refresh().pending() < n {
                tokio::task::yield_now().await;
            }
        }
    }

    #[tokio::test]
    async fn public_path_is_sent_untouched() {
        let h = Harness::new(
            MockTransport::new(|_| {
                Some(Ok(Response::new(
                    StatusCode::UNAUTHORIZED,
                    r#"{"message":"Invalid credentials"}"#,
                )))
            }),
            GatedRefresh::new(Ok("tok2")),
        );

        let request = h.pipeline.request(Method::POST, "/api/auth/login");
        assert!(!request.requires_auth());
        let err = h.pipeline.execute(request).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::SessionExpired);
        assert_eq!(err.message, "Invalid credentials");
        assert_eq!(h.transport.seen_auth(), vec![None]);
        assert_eq!(h.refresh.calls(), 0, "public paths never refresh");
        assert_eq!(h.invalidations(), 0);
    }

    #[tokio::test]
    async fn public_path_match_overrides_request_flag() {
        let h = Harness::new(MockTransport::accepting("tok1"), GatedRefresh::new(Ok("tok2")));

        let request = OutboundRequest::new(Method::GET, "/api/public/status");
        let _ = h.pipeline.execute(request).await;
        assert_eq!(h.transport.seen_auth(), vec![None]);
    }

    #[tokio::test]
    async fn exactly_one_authorization_header() {
        let h = Harness::new(MockTransport::accepting("tok1"), GatedRefresh::new(Ok("tok2")));

        let request = h.pipeline.request(Method::GET, "/api/v1/reports").with_header(
            AUTHORIZATION,
            HeaderValue::from_static("Bearer forged"),
        );
        h.pipeline.execute(request).await.unwrap();

        let seen = h.transport.seen.lock();
        let values: Vec<_> = seen[0].headers.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "Bearer tok1");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_and_retried_once() {
        let h = Harness::new(MockTransport::accepting("tok2"), GatedRefresh::new(Ok("tok2")));
        h.refresh.release();

        let request = h.pipeline.request(Method::GET, "/api/v1/reports");
        let response = h.pipeline.execute(request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            h.transport.seen_auth(),
            vec![Some("Bearer tok1".into()), Some("Bearer tok2".into())]
        );
        assert_eq!(h.pipeline.store().get().unwrap().token(), "tok2");
        assert_eq!(h.refresh.calls(), 1);
        assert!(h.notes().is_empty());
    }

    #[tokio::test]
    async fn failed_refresh_expires_session() {
        let h = Harness::new(MockTransport::accepting("tok2"), GatedRefresh::new(Err(401)));
        h.refresh.release();

        let request = h.pipeline.request(Method::GET, "/api/v1/reports");
        let err = h.pipeline.execute(request).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::SessionExpired);
        assert_eq!(err.original_status, Some(401));
        assert_eq!(h.invalidations(), 1);
        assert!(h.pipeline.store().get().is_none());
        assert_eq!(h.transport.seen_auth().len(), 1, "no retry after refresh failure");

        let notes = h.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].severity(), Severity::Warning);
    }

    #[tokio::test]
    async fn not_found_is_classified_without_refresh() {
        let h = Harness::new(
            MockTransport::new(|_| {
                Some(Ok(Response::new(
                    StatusCode::NOT_FOUND,
                    r#"{"error":{"message":"Report 7 does not exist"}}"#,
                )))
            }),
            GatedRefresh::new(Ok("tok2")),
        );

        let request = h.pipeline.request(Method::GET, "/api/v1/reports/7");
        let err = h.pipeline.execute(request).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::NotFound);
        assert_eq!(err.message, "Report 7 does not exist");
        assert_eq!(err.original_status, Some(404));
        assert_eq!(h.refresh.calls(), 0);

        let notes = h.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].notification().severity, Severity::Info);
    }

    #[tokio::test]
    async fn concurrent_401s_share_one_refresh() {
        const N: usize = 5;
        let h = Harness::new(MockTransport::accepting("tok2"), GatedRefresh::new(Ok("tok2")));

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let pipeline = h.pipeline.clone();
                tokio::spawn(async move {
                    let request = pipeline.request(Method::GET, format!("/api/v1/widgets/{i}"));
                    pipeline.execute(request).await
                })
            })
            .collect();

        h.wait_for_queue(N).await;
        assert_eq!(h.pipeline.loading().active(), N);
        h.refresh.release();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().status, StatusCode::OK);
        }
        assert_eq!(h.refresh.calls(), 1);

        let seen = h.transport.seen_auth();
        assert_eq!(seen.len(), 2 * N);
        let retried = seen
            .iter()
            .filter(|a| a.as_deref() == Some("Bearer tok2"))
            .count();
        assert_eq!(retried, N, "every retry carries the refreshed credential");
        assert_eq!(h.pipeline.loading().active(), 0);
    }

    #[tokio::test]
    async fn concurrent_401s_all_expire_when_refresh_fails() {
        const N: usize = 4;
        let h = Harness::new(MockTransport::accepting("tok2"), GatedRefresh::new(Err(400)));

        let handles: Vec<_> = (0..N)
            .map(|_| {
                let pipeline = h.pipeline.clone();
                tokio::spawn(async move {
                    let request = pipeline.request(Method::GET, "/api/v1/reports");
                    pipeline.execute(request).await
                })
            })
            .collect();

        h.wait_for_queue(N).await;
        h.refresh.release();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.kind, ErrorKind::SessionExpired);
            assert_eq!(err.original_status, Some(401));
        }
        assert_eq!(h.refresh.calls(), 1);
        assert_eq!(h.invalidations(), 1, "one invalidation per failed refresh");
        assert_eq!(h.notes().len(), N);
    }

    #[tokio::test]
    async fn second_401_is_terminal() {
        let h = Harness::new(MockTransport::accepting("nobody"), GatedRefresh::new(Ok("tok2")));
        h.refresh.release();

        let request = h.pipeline.request(Method::DELETE, "/api/v1/reports/7");
        let err = h.pipeline.execute(request).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::SessionExpired);
        assert_eq!(h.transport.seen_auth().len(), 2, "retried exactly once");
        assert_eq!(h.refresh.calls(), 1);
        assert_eq!(h.invalidations(), 1);
        assert!(h.pipeline.store().get().is_none());
    }

    #[tokio::test]
    async fn transport_failure_is_classified() {
        let h = Harness::new(
            MockTransport::new(|_| Some(Err(TransportError::Connect("refused".into())))),
            GatedRefresh::new(Ok("tok2")),
        );

        let request = h.pipeline.request(Method::GET, "/api/v1/reports");
        let err = h.pipeline.execute(request).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Transport);
        assert_eq!(err.original_status, None);
        assert_eq!(err.message, "Network error: connection failed: refused");
        assert_eq!(h.notes().len(), 1);
        assert_eq!(h.pipeline.loading().active(), 0);
    }

    #[tokio::test]
    async fn server_error_releases_loading() {
        let h = Harness::new(
            MockTransport::new(|_| Some(Ok(Response::new(StatusCode::INTERNAL_SERVER_ERROR, "")))),
            GatedRefresh::new(Ok("tok2")),
        );

        let request = h.pipeline.request(Method::GET, "/api/v1/reports");
        let err = h.pipeline.execute(request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert_eq!(err.message, "Server Error: Please try again later");
        assert_eq!(h.pipeline.loading().active(), 0);
    }

    #[tokio::test]
    async fn silent_paths_never_touch_loading() {
        let h = Harness::new(MockTransport::new(|_| None), GatedRefresh::new(Ok("tok2")));

        let pipeline = h.pipeline.clone();
        let task = tokio::spawn(async move {
            let request = pipeline.request(Method::GET, "/api/poll/jobs");
            pipeline.execute(request).await
        });
        while h.transport.seen.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.pipeline.loading().active(), 0);
        assert!(!h.pipeline.loading().is_busy());
        task.abort();
    }

    #[tokio::test]
    async fn query_string_never_makes_a_request_public_or_silent() {
        let h = Harness::new(MockTransport::new(|_| None), GatedRefresh::new(Ok("tok2")));

        let pipeline = h.pipeline.clone();
        let task = tokio::spawn(async move {
            let request = pipeline.request(
                Method::GET,
                "/api/v1/reports?return_to=/api/public/home&next=/api/poll",
            );
            assert!(request.requires_auth());
            pipeline.execute(request).await
        });
        while h.transport.seen.lock().is_empty() {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.transport.seen_auth(), vec![Some("Bearer tok1".into())]);
        assert_eq!(h.pipeline.loading().active(), 1);
        assert!(h.pipeline.loading().is_busy());
        task.abort();
    }

    #[tokio::test]
    async fn cancellation_releases_loading_without_notifying() {
        let h = Harness::new(MockTransport::new(|_| None), GatedRefresh::new(Ok("tok2")));
        let cancel = CancellationToken::new();

        let pipeline = h.pipeline.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let request = pipeline.request(Method::GET, "/api/v1/reports");
            pipeline.execute_cancellable(request, &token).await
        });
        while h.pipeline.loading().active() == 0 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        assert!(matches!(task.await.unwrap(), Err(PipelineError::Cancelled)));
        assert_eq!(h.pipeline.loading().active(), 0);
        assert!(h.notes().is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_refresh_queue() {
        let h = Harness::new(MockTransport::accepting("tok2"), GatedRefresh::new(Ok("tok2")));
        let cancel = CancellationToken::new();

        let pipeline = h.pipeline.clone();
        let kept = tokio::spawn(async move {
            let request = pipeline.request(Method::GET, "/api/v1/reports");
            pipeline.execute(request).await
        });
        let pipeline = h.pipeline.clone();
        let token = cancel.clone();
        let dropped = tokio::spawn(async move {
            let request = pipeline.request(Method::GET, "/api/v1/users");
            pipeline.execute_cancellable(request, &token).await
        });

        h.wait_for_queue(2).await;
        cancel.cancel();
        assert!(matches!(dropped.await.unwrap(), Err(PipelineError::Cancelled)));
        assert_eq!(h.pipeline.refresh().pending(), 1);

        h.refresh.release();
        assert_eq!(kept.await.unwrap().unwrap().status, StatusCode::OK);
        assert_eq!(h.refresh.calls(), 1);
        assert_eq!(h.pipeline.loading().active(), 0);
    }

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Report {
        id: u32,
        title: String,
    }

    #[tokio::test]
    async fn get_builds_prefixed_query_request() {
        let h = Harness::new(
            MockTransport::new(|request| {
                assert_eq!(request.method, Method::GET);
                assert_eq!(request.path, "/api/v1/reports");
                assert_eq!(request.query, vec![("page".to_string(), "2".to_string())]);
                Some(Ok(Response::new(
                    StatusCode::OK,
                    r#"[{"id":7,"title":"Q3"}]"#,
                )))
            }),
            GatedRefresh::new(Ok("tok2")),
        );

        let reports: Vec<Report> = h.pipeline.get("reports", &[("page", "2")]).await.unwrap();
        assert_eq!(
            reports,
            vec![Report {
                id: 7,
                title: "Q3".into()
            }]
        );
    }

    #[tokio::test]
    async fn post_sends_json_body() {
        let h = Harness::new(
            MockTransport::new(|request| {
                assert_eq!(request.path, "/api/v1/reports");
                let body = request.body.clone().unwrap_or_default();
                let sent: serde_json::Value = serde_json::from_slice(&body).unwrap();
                assert_eq!(sent["title"], "Q4");
                Some(Ok(Response::new(
                    StatusCode::CREATED,
                    r#"{"id":8,"title":"Q4"}"#,
                )))
            }),
            GatedRefresh::new(Ok("tok2")),
        );

        let created: Report = h
            .pipeline
            .post("/reports", &serde_json::json!({"title": "Q4"}))
            .await
            .unwrap();
        assert_eq!(created.id, 8);
    }

    #[tokio::test]
    async fn undecodable_body_is_reported() {
        let h = Harness::new(
            MockTransport::new(|_| Some(Ok(Response::new(StatusCode::OK, "<html>")))),
            GatedRefresh::new(Ok("tok2")),
        );

        let err = h.pipeline.get::<Report>("reports", &[]).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unclassified(200));
        assert_eq!(h.notes().len(), 1);
    }
}
