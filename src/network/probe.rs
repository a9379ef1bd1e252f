//! Connectivity probe implementations.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use url::Url;

/// One way of deciding whether the host can reach the outside world.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Short label recorded as `NetworkCheckResult::method`.
    fn name(&self) -> &'static str;

    /// Succeeds when the outside world is reachable. Callers bound the time.
    async fn probe(&self) -> anyhow::Result<()>;
}

/// Resolves a `host:port` through the system resolver.
#[derive(Debug, Clone)]
pub struct DnsProbe {
    host: String,
}

impl DnsProbe {
    /// Probe resolving `host` (must include a port).
    pub fn new(host: String) -> Self {
        Self { host }
    }
}

#[async_trait]
impl ConnectivityProbe for DnsProbe {
    fn name(&self) -> &'static str {
        "dns"
    }

    async fn probe(&self) -> anyhow::Result<()> {
        let mut addrs = tokio::net::lookup_host(self.host.as_str())
            .await
            .with_context(|| format!("failed to resolve {}", self.host))?;
        addrs
            .next()
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("{} resolved to no addresses", self.host))
    }
}

/// Issues a HEAD request; any HTTP response counts as reachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    /// Probe requesting `url`, with the client-level timeout set to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is invalid or the client cannot be built.
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let url = Url::parse(url).with_context(|| format!("invalid probe URL {url}"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("failed to build probe HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn probe(&self) -> anyhow::Result<()> {
        let response = self
            .client
            .head(self.url.clone())
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", self.url))?;
        tracing::debug!(status = %response.status(), url = %self.url, "http probe answered");
        Ok(())
    }
}
