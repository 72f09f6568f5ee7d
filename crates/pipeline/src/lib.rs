//! Outbound request pipeline for the dashboard backend
//!
//! Every backend call made by the dashboard goes through `RequestPipeline`:
//! - public paths (login, register) are forwarded untouched
//! - everything else gets `Authorization: Bearer <credential>`
//! - a 401 triggers one shared credential refresh and a single retry
//! - failures are classified and forwarded to a `NotificationSink`
//! - non-silent calls feed the debounced busy signal of `LoadingAggregator`
//!
//! The transport is a trait so the pipeline can be driven by reqwest in
//! production (`HttpTransport`) and by scripted transports in tests.

pub mod loading;
pub mod notify;
pub mod pipeline;
pub mod request;
pub mod transport;

pub use loading::{DEFAULT_DEBOUNCE, LoadingAggregator, LoadingGuard};
pub use notify::NotificationSink;
pub use pipeline::{PipelineConfig, PipelineError, RequestPipeline};
pub use request::{OutboundRequest, PathPatterns, Response};
pub use transport::{HttpTransport, Transport, TransportError, TransportFuture};
