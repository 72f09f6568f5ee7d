//! Request and response values passed through the pipeline

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use classifier::{ClassifiedError, ErrorKind};
use session::Credential;

/// Set of path substrings. A path matches when it contains any pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PathPatterns(Vec<String>);

impl PathPatterns {
    /// Build from patterns; blank entries are dropped so they cannot match
    /// every path.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            patterns
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.trim().is_empty())
                .collect(),
        )
    }

    /// Login/registration endpoints that must never carry a credential.
    pub fn default_public() -> Self {
        Self::new(["/api/auth/login", "/api/auth/register", "/api/public"])
    }

    /// Background endpoints that must not drive the loading indicator.
    pub fn default_silent() -> Self {
        Self::new(["/api/health", "/api/ping", "/api/poll"])
    }

    pub fn matches(&self, path: &str) -> bool {
        self.0
            .iter()
            .any(|p| !p.is_empty() && path.contains(p.as_str()))
    }

    pub fn push(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if !pattern.trim().is_empty() && !self.0.contains(&pattern) {
            self.0.push(pattern);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A single outbound call.
///
/// Only the header map changes after construction (credential injection).
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path relative to the backend base URL, e.g. `/api/v1/reports`
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Already-encoded query string forwarded as-is, ahead of `query`
    pub raw_query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    requires_auth: bool,
}

impl OutboundRequest {
    /// New authenticated request. Use `RequestPipeline::request` to have
    /// `requires_auth` derived from the configured public paths.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            raw_query: None,
            headers: HeaderMap::new(),
            body: None,
            requires_auth: true,
        }
    }

    /// Mark the request as exempt from credential injection and refresh.
    pub fn public(mut self) -> Self {
        self.requires_auth = false;
        self
    }

    pub fn requires_auth(&self) -> bool {
        self.requires_auth
    }

    /// The path without any query string; public and silent patterns are
    /// matched against this.
    pub fn route(&self) -> &str {
        route_of(&self.path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Attach an encoded query string (no leading `?`). Empty strings are
    /// ignored.
    pub fn with_raw_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.raw_query = (!query.is_empty()).then_some(query);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> serde_json::Result<Self> {
        let body = serde_json::to_vec(value)?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(Bytes::from(body));
        Ok(self)
    }

    pub(crate) fn set_public(&mut self) {
        self.requires_auth = false;
    }

    /// Replace any Authorization header with the bearer credential.
    pub(crate) fn authorize(&mut self, credential: &Credential) -> Result<(), ClassifiedError> {
        let mut value = HeaderValue::from_str(&credential.bearer()).map_err(|_| {
            ClassifiedError::new(
                ErrorKind::SessionExpired,
                "Unauthorized: stored credential is not a valid header value",
                None,
            )
        })?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }
}

fn route_of(path: &str) -> &str {
    path.split_once('?').map_or(path, |(route, _)| route)
}

/// Response received from the backend (any status).
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}
