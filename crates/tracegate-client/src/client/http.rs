//! HTTP layer: status mapping and retry.
//!
//! This is the ONLY place for status code handling. client/mod.rs never
//! interprets status codes.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::auth::Session;
use crate::error::{ClientError, ClientResult};
use crate::types::ClientConfig;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How a request is authorized.
#[derive(Debug, Clone)]
pub(crate) enum Auth {
    /// Session credentials (token or login cookie).
    Session,
    /// Pre-signed storage URL; only the given headers are sent.
    Presigned(Vec<(HeaderName, HeaderValue)>),
}

/// Request payload.
#[derive(Debug, Clone)]
pub(crate) enum Body {
    Empty,
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

/// HTTP backend for making requests (holds reqwest client, session, config).
#[derive(Debug, Clone)]
pub(crate) struct HttpBackend {
    pub(crate) client: reqwest::Client,
    pub(crate) base_url: String,
    pub(crate) session: Arc<Session>,
    pub(crate) config: ClientConfig,
}

impl HttpBackend {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET a server path and decode the JSON body.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let url = self.url(path);
        let response = self
            .request(reqwest::Method::GET, &url, Body::Empty, Auth::Session)
            .await?;
        decode(response, &url).await
    }

    /// POST a JSON body to a server path and decode the JSON response.
    pub(crate) async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> ClientResult<serde_json::Value> {
        let url = self.url(path);
        let response = self
            .request(reqwest::Method::POST, &url, Body::Json(body), Auth::Session)
            .await?;
        decode(response, &url).await
    }

    /// PUT a JSON body to a server path and decode the JSON response.
    pub(crate) async fn put_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> ClientResult<serde_json::Value> {
        let url = self.url(path);
        let response = self
            .request(reqwest::Method::PUT, &url, Body::Json(body), Auth::Session)
            .await?;
        decode(response, &url).await
    }

    /// PUT raw bytes to a storage URL handed out by the server.
    ///
    /// Storage URLs are pre-signed, so no session credentials are attached.
    pub(crate) async fn put_bytes<'a>(
        &self,
        url: &str,
        headers: impl IntoIterator<Item = (&'a String, &'a String)>,
        data: Vec<u8>,
    ) -> ClientResult<()> {
        let mut parsed = Vec::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ClientError::InvalidResponse {
                    message: format!("invalid upload header name '{}': {}", name, e),
                }
            })?;
            let value =
                HeaderValue::from_str(value).map_err(|e| ClientError::InvalidResponse {
                    message: format!("invalid upload header value: {}", e),
                })?;
            parsed.push((name, value));
        }

        self.request(
            reqwest::Method::PUT,
            url,
            Body::Bytes(data),
            Auth::Presigned(parsed),
        )
        .await
        .map(|_| ())
    }

    /// Make a request, retrying transient failures.
    pub(crate) async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Body,
        auth: Auth,
    ) -> ClientResult<reqwest::Response> {
        use rand::Rng;

        let mut retries = 0;
        let max_retries = self.config.max_retries;

        loop {
            let result = self
                .request_once(method.clone(), url, &body, &auth)
                .await;

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && retries < max_retries => {
                    retries += 1;

                    let base_backoff = retry_backoff(self.config.backoff_ms, retries);
                    let jittered_ms =
                        rand::thread_rng().gen_range(0..=base_backoff.as_millis() as u64);
                    let backoff = Duration::from_millis(jittered_ms.max(10));

                    warn!(
                        error = %e,
                        retry = retries,
                        max_retries = max_retries,
                        backoff_ms = backoff.as_millis(),
                        "retrying request"
                    );

                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request_once(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &Body,
        auth: &Auth,
    ) -> ClientResult<reqwest::Response> {
        debug!(method = %method, url = %url, "request");

        let mut request = self.client.request(method, url);
        request = match auth {
            Auth::Session => {
                self.session
                    .authorize(&self.client, &self.base_url, request)
                    .await?
            }
            Auth::Presigned(headers) => headers
                .iter()
                .fold(request, |r, (name, value)| r.header(name, value)),
        };

        request = match body {
            Body::Empty => request,
            Body::Json(value) => request.json(value),
            Body::Bytes(data) => request.body(data.clone()),
        };

        let response = request.send().await?;
        check_status(response, url).await
    }
}

/// Map a response status onto the client's error space.
async fn check_status(response: reqwest::Response, url: &str) -> ClientResult<reqwest::Response> {
    let status = response.status();

    match status.as_u16() {
        // A conflict means the object already exists; its body describes it.
        200..=299 | 409 => Ok(response),

        401 | 403 => Err(ClientError::Unauthorized {
            message: format!("HTTP {} for {}", status.as_u16(), url),
        }),

        404 => Err(ClientError::NotFound {
            url: url.to_string(),
        }),

        500 | 502 | 504 => {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            Err(ClientError::Server {
                status: status.as_u16(),
                url: url.to_string(),
                message,
            })
        }

        _ => {
            let message = response.text().await.unwrap_or_else(|_| status.to_string());
            Err(ClientError::Http {
                status: status.as_u16(),
                url: url.to_string(),
                message,
            })
        }
    }
}

/// Exponential backoff before retry number `retry`, capped at 30 seconds.
fn retry_backoff(backoff_ms: u64, retry: u32) -> Duration {
    let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
    Duration::from_millis(backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response, url: &str) -> ClientResult<T> {
    let text = response.text().await.map_err(|e| ClientError::Network {
        message: format!("failed to read response body from {}: {}", url, e),
    })?;

    serde_json::from_str(&text).map_err(|e| ClientError::InvalidResponse {
        message: format!("failed to parse response from {}: {}", url, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_retry() {
        assert_eq!(retry_backoff(100, 1), Duration::from_millis(200));
        assert_eq!(retry_backoff(100, 3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped_for_large_retry_counts() {
        assert_eq!(retry_backoff(100, 20), MAX_BACKOFF);
        assert_eq!(retry_backoff(100, 63), MAX_BACKOFF);
        assert_eq!(retry_backoff(100, 64), MAX_BACKOFF);
        assert_eq!(retry_backoff(1, 200), MAX_BACKOFF);
        assert_eq!(retry_backoff(0, 200), Duration::ZERO);
    }
}
