//! Subscription feed retrieval.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use super::model::FetchedContent;

/// Connect timeout for subscription fetch.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Retrieves one subscription URL. Non-2xx responses are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedContent>;
}

/// reqwest-backed fetcher.
///
/// Uses a direct (no-proxy) client: feeds must stay reachable even while the
/// live tunnel is down or being replaced.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, tls_verify: bool, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .danger_accept_invalid_certs(!tls_verify)
            .user_agent(user_agent)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build subscription HTTP client: {e}"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedContent> {
        let resp = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                anyhow::anyhow!("subscription fetch timed out: {url}")
            } else if e.is_connect() {
                anyhow::anyhow!("failed to connect to subscription URL: {url}: {e}")
            } else {
                anyhow::anyhow!("subscription fetch failed: {url}: {e}")
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("subscription returned HTTP {status}: {url}");
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = resp
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("failed to read subscription response body: {e}"))?;

        Ok(FetchedContent::new(url, text, content_type))
    }
}
