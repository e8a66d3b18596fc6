//! HTTP client for the Registry command endpoints.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClientError;

/// Why a single request failed, before the gateway classifies it.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestFailure {
    /// No usable response: connect error, timeout or undecodable body.
    Transport(String),

    /// The Registry answered with a non-success status.
    Status { code: u16, detail: Option<String> },
}

/// Failure body used by every Registry endpoint.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    detail: Option<String>,
}

/// HTTP client for the Registry's JSON endpoints.
pub struct HttpClient {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    /// Create a new HTTP client whose requests give up after `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get JSON from an endpoint.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestFailure> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "GET request");

        let response = self.inner.get(&url).send().await.map_err(transport)?;
        decode(response).await
    }

    /// Post a JSON body to an endpoint and decode the JSON reply.
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RequestFailure>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "POST request");

        let response = self
            .inner
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(response).await
    }
}

fn transport(e: reqwest::Error) -> RequestFailure {
    if e.is_timeout() {
        RequestFailure::Transport(format!("request timed out: {e}"))
    } else {
        RequestFailure::Transport(e.to_string())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RequestFailure> {
    let status = response.status();
    if !status.is_success() {
        let detail = response
            .json::<ErrorEnvelope>()
            .await
            .ok()
            .and_then(|envelope| envelope.detail);
        return Err(RequestFailure::Status {
            code: status.as_u16(),
            detail,
        });
    }

    response.json().await.map_err(transport)
}
