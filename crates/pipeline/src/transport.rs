//! Transport abstraction and the reqwest-backed implementation
//!
//! A transport returns `Ok(Response)` for every response it receives,
//! whatever the status; status handling belongs to the pipeline. `Err` means
//! no response arrived at all.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::request::{OutboundRequest, Response};

/// Failure to obtain any response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// Boxed future returned by `Transport::send`.
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Response, TransportError>> + Send + 'a>>;

/// Sends a prepared request to the backend.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a OutboundRequest) -> TransportFuture<'a>;
}

/// reqwest transport rooted at the backend base URL.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Absolute URL for a request path. Absolute paths pass through.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

impl Transport for HttpTransport {
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    fn send<'a>(&'a self, request: &'a OutboundRequest) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut url = self.url_for(&request.path);
            if let Some(raw) = &request.raw_query {
                url.push(if url.contains('?') { '&' } else { '?' });
                url.push_str(raw);
            }
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(request.headers.clone())
                .timeout(self.timeout);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else if e.is_connect() {
                    TransportError::Connect(e.to_string())
                } else {
                    TransportError::Other(e.to_string())
                }
            })?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout)
                } else {
                    TransportError::Other(format!("reading response body: {e}"))
                }
            })?;

            debug!(status = status.as_u16(), bytes = body.len(), "backend responded");
            Ok(Response {
                status,
                headers,
                body,
            })
        })
    }
}
