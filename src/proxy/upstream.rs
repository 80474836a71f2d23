/// HTTP client for calling the Azure services.
/// Uses reqwest-middleware for retries on transient failures.
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::time::Duration;

use crate::errors::AppError;

#[derive(Clone)]
pub struct UpstreamClient {
    client: ClientWithMiddleware,
}

impl UpstreamClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_retries(3)
    }

    pub fn with_retries(max_retries: u32) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .use_rustls_tls()
            .pool_max_idle_per_host(32)
            .timeout(Duration::from_secs(120)) // document uploads and long completions
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        // 5xx, 408, 429 and connection errors are retried with backoff
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { client })
    }

    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, AppError> {
        let resp = self
            .client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                // reqwest-middleware errors are compound, but to_string() gives details
                tracing::warn!("Upstream request failed after retries: {}", e);
                AppError::Upstream(e.to_string())
            })?;

        Ok(resp)
    }

    pub async fn post_json(
        &self,
        url: &str,
        mut headers: HeaderMap,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, AppError> {
        let bytes = serde_json::to_vec(body).map_err(|e| AppError::Internal(e.into()))?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.forward(Method::POST, url, headers, Bytes::from(bytes)).await
    }

    /// `application/x-www-form-urlencoded` POST (OAuth token requests).
    pub async fn post_form(
        &self,
        url: &str,
        fields: &[(&str, &str)],
    ) -> Result<reqwest::Response, AppError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self.forward(Method::POST, url, headers, Bytes::from(body)).await
    }
}
