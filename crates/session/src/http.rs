//! HTTP refresh operation
//!
//! POSTs to the backend's refresh endpoint with the current bearer token and
//! expects `{"token": "..."}` back (`access_token` is accepted as an alias).
//! Anything else is a refresh failure; the coordinator turns every failure
//! into `SessionExpired`.

use serde::Deserialize;
use tracing::debug;

use crate::credential::Credential;
use crate::error::RefreshError;
use crate::refresh::{RefreshFuture, RefreshOperation};

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(alias = "access_token")]
    token: String,
}

/// Refresh operation backed by a reqwest client.
pub struct HttpRefresh {
    client: reqwest::Client,
    url: String,
}

impl HttpRefresh {
    pub fn new(client: reqwest::Client, base_url: &str, refresh_path: &str) -> Self {
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            refresh_path.trim_start_matches('/')
        );
        Self { client, url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl RefreshOperation for HttpRefresh {
    fn refresh<'a>(&'a self, current: Option<&'a Credential>) -> RefreshFuture<'a> {
        Box::pin(async move {
            let mut request = self.client.post(&self.url);
            if let Some(credential) = current {
                request = request.bearer_auth(credential.token());
            }

            let response = request
                .send()
                .await
                .map_err(|e| RefreshError::Http(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(RefreshError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }

            let parsed = response
                .json::<RefreshResponse>()
                .await
                .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;

            if parsed.token.trim().is_empty() {
                return Err(RefreshError::InvalidResponse(
                    "refresh endpoint returned an empty token".into(),
                ));
            }

            debug!(url = %self.url, "refresh endpoint issued a new credential");
            Ok(Credential::new(parsed.token))
        })
    }
}
