//! Source adapters.
//!
//! Adapter content is supplied by the embedding application; the two
//! adapters here let sources be declared in configuration.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// One external data feed.
///
/// `fetch` returns an opaque snapshot of the source or an error. The
/// scheduler retries failures forever with backoff.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch(&self) -> Result<Value>;
}

/// Fetches a JSON document over HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpJsonAdapter {
    url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpJsonAdapter {
    /// Create an adapter for `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cadence/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            url: url.into(),
            timeout,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SourceAdapter for HttpJsonAdapter {
    async fn fetch(&self) -> Result<Value> {
        debug!(url = %self.url, "Fetching source");

        let response = self.client.get(&self.url).send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("Request timed out after {}s", self.timeout.as_secs())
            } else if e.is_connect() {
                anyhow::anyhow!("Cannot connect to {}", self.url)
            } else {
                anyhow::anyhow!("Failed to send request: {}", e)
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Source returned {}: {}", status, body));
        }

        response
            .json::<Value>()
            .await
            .with_context(|| format!("Failed to parse JSON from {}", self.url))
    }
}

/// Always returns the same payload. Useful for fixtures and local runs.
#[derive(Debug, Clone)]
pub struct StaticAdapter {
    payload: Value,
}

impl StaticAdapter {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

#[async_trait]
impl SourceAdapter for StaticAdapter {
    async fn fetch(&self) -> Result<Value> {
        Ok(self.payload.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_static_adapter_returns_payload() {
        let adapter = StaticAdapter::new(json!({"games": 16}));
        let payload = tokio_test::block_on(adapter.fetch()).unwrap();
        assert_eq!(payload, json!({"games": 16}));
    }

    #[tokio::test]
    async fn test_http_adapter_reports_connect_failure() {
        // Port 9 (discard) on localhost is closed in test environments.
        let adapter =
            HttpJsonAdapter::new("http://127.0.0.1:9/feed.json", Duration::from_secs(2)).unwrap();
        assert_eq!(adapter.url(), "http://127.0.0.1:9/feed.json");
        assert!(adapter.fetch().await.is_err());
    }
}
