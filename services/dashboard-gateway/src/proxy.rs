//! Forwarding of front-end requests through the pipeline
//!
//! Receives inbound requests, strips hop-by-hop headers and hands the call to
//! `RequestPipeline`, which injects the session credential and handles the
//! refresh-and-retry. Successful backend responses are returned verbatim;
//! classified failures become the gateway's JSON error body.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use pipeline::RequestPipeline;
use tracing::{debug, error, instrument};

use crate::error::{Error, Result};
use crate::metrics::{self, ServiceMetrics};

/// Largest request body accepted from the front end
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Headers the HTTP client derives from the outbound request itself
const CLIENT_MANAGED_HEADERS: &[&str] = &["host", "content-length"];

/// Decrements the in-flight counter however the request ends.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Forward one inbound request through the pipeline.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn forward(
    pipeline: &RequestPipeline,
    stats: &ServiceMetrics,
    request: Request<Body>,
    request_id: String,
) -> Response {
    stats.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&stats.in_flight);
    let started = Instant::now();
    let method = request.method().to_string();

    let response = match dispatch(pipeline, request).await {
        Ok(response) => response,
        Err(e) => {
            stats.errors_total.fetch_add(1, Ordering::Relaxed);
            e.into_response_with_id(&request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn dispatch(pipeline: &RequestPipeline, request: Request<Body>) -> Result<Response> {
    let (parts, body) = request.into_parts();

    // The query stays encoded as received; only the path decides whether the
    // request is public or silent.
    let mut outbound = pipeline.request(parts.method, parts.uri.path());
    if let Some(query) = parts.uri.query() {
        outbound = outbound.with_raw_query(query);
    }
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str()) && !is_client_managed(name.as_str()) {
            outbound.headers.append(name.clone(), value.clone());
        }
    }

    let body = read_body(body).await?;
    if !body.is_empty() {
        outbound = outbound.with_body(body);
    }

    let upstream = pipeline.execute(outbound).await?;
    debug!(status = upstream.status.as_u16(), "backend responded");

    let mut response = Response::builder().status(upstream.status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    Ok(response.body(Body::from(upstream.body)).unwrap_or_else(|e| {
        error!(error = %e, "failed to build response");
        let mut fallback = Response::new(Body::empty());
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    }))
}

async fn read_body(body: Body) -> Result<Bytes> {
    axum::body::to_bytes(body, MAX_BODY_BYTES).await.map_err(|e| {
        error!(error = %e, "failed to read request body");
        Error::InvalidRequest(format!("request body could not be read: {e}"))
    })
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_client_managed(name: &str) -> bool {
    CLIENT_MANAGED_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
