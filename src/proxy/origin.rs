use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use http::{HeaderMap, StatusCode};
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::error::{ProxyError, Result};

const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Upstream response with a streaming body.
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// The proxy's only view of the upstream server. Seam for tests.
#[async_trait]
pub trait Origin: Send + Sync {
    /// Fetches a resource, forwarding the given request headers. Any HTTP
    /// status is returned as a response (the caller passes non-2xx through
    /// verbatim); only transport failures surface as errors.
    async fn fetch(&self, url: &Url, headers: &HeaderMap) -> Result<OriginResponse>;

    /// Fetches a small text resource (a playlist) in full.
    async fn fetch_text(&self, url: &Url) -> Result<(StatusCode, String)>;
}

/// reqwest-backed origin client with capped exponential backoff.
pub struct HttpOrigin {
    client: reqwest::Client,
    attempt_timeout: Duration,
    max_retries: u32,
}

impl HttpOrigin {
    pub fn new(attempt_timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(attempt_timeout)
            .build()
            .map_err(ProxyError::from_reqwest)?;
        Ok(Self {
            client,
            attempt_timeout,
            max_retries,
        })
    }

    /// One GET with retries. Transport errors and gateway-ish statuses are
    /// retried with 500ms/1s/2s/... backoff; the final response, whatever
    /// its status, is handed back for pass-through.
    async fn get_with_retry(&self, url: &Url, headers: &HeaderMap) -> Result<reqwest::Response> {
        let mut last_err: Option<ProxyError> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = RETRY_DELAY * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
                debug!(url = %url, attempt, "retrying origin request");
            }

            let request = self
                .client
                .get(url.clone())
                .headers(headers.clone())
                .send();

            let err = match timeout(self.attempt_timeout, request).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    let retryable =
                        status.as_u16() >= 500 || status == StatusCode::TOO_MANY_REQUESTS;
                    if retryable && attempt < self.max_retries {
                        ProxyError::OriginStatus(status.as_u16())
                    } else {
                        return Ok(response);
                    }
                }
                Ok(Err(err)) => ProxyError::from_reqwest(err),
                Err(_) => ProxyError::Timeout,
            };

            if err.is_retryable() && attempt < self.max_retries {
                warn!(url = %url, error = %err, "origin attempt failed");
                last_err = Some(err);
            } else {
                return Err(err);
            }
        }

        Err(last_err.unwrap_or(ProxyError::Timeout))
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn fetch(&self, url: &Url, headers: &HeaderMap) -> Result<OriginResponse> {
        let response = self.get_with_retry(url, headers).await?;
        let status = response.status();
        let response_headers = response.headers().clone();
        let content_type = response_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(ProxyError::from_reqwest)
            .boxed();

        Ok(OriginResponse {
            status,
            headers: response_headers,
            content_type,
            content_length,
            body,
        })
    }

    async fn fetch_text(&self, url: &Url) -> Result<(StatusCode, String)> {
        let response = self.get_with_retry(url, &HeaderMap::new()).await?;
        let status = response.status();
        let text = response.text().await.map_err(ProxyError::from_reqwest)?;
        Ok((status, text))
    }
}
