//! Subscription sync pipeline: fetch → parse → dedup → probe.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::dedup::dedupe_forwards;
use super::fetcher::Fetcher;
use super::model::{ForwardNode, SyncResult, SyncStats};
use super::parser::SubscriptionFormat;
use super::probe::{probe_all, ForwardProbe, GliderProbe};

/// Narrows a candidate list down to the forwards that actually work.
#[async_trait]
pub trait ForwardTester: Send + Sync {
    async fn filter_usable(&self, nodes: Vec<ForwardNode>) -> Vec<ForwardNode>;
}

/// Keeps every candidate. Used when per-forward testing is switched off.
pub struct PassThroughTester;

#[async_trait]
impl ForwardTester for PassThroughTester {
    async fn filter_usable(&self, nodes: Vec<ForwardNode>) -> Vec<ForwardNode> {
        nodes
    }
}

/// Tests candidates through ephemeral glider instances.
pub struct GliderForwardTester {
    probe: Arc<dyn ForwardProbe>,
    width: usize,
}

impl GliderForwardTester {
    pub fn new(probe: GliderProbe) -> Self {
        let width = probe.width();
        Self {
            probe: Arc::new(probe),
            width,
        }
    }

    /// Tester over any probe implementation.
    pub fn with_probe(probe: Arc<dyn ForwardProbe>, width: usize) -> Self {
        Self { probe, width }
    }
}

#[async_trait]
impl ForwardTester for GliderForwardTester {
    async fn filter_usable(&self, nodes: Vec<ForwardNode>) -> Vec<ForwardNode> {
        if nodes.is_empty() {
            return nodes;
        }
        let total = nodes.len();
        let usable: Vec<ForwardNode> = probe_all(Arc::clone(&self.probe), nodes, self.width)
            .await
            .into_iter()
            .filter(|(_, outcome)| outcome.ok)
            .map(|(node, _)| node)
            .collect();
        info!("forward test: {}/{total} usable", usable.len());
        usable
    }
}

/// Runs the sync pipeline over a list of subscription URLs.
pub struct SubscriptionSync {
    fetcher: Arc<dyn Fetcher>,
    tester: Arc<dyn ForwardTester>,
}

impl SubscriptionSync {
    pub fn new(fetcher: Arc<dyn Fetcher>, tester: Arc<dyn ForwardTester>) -> Self {
        Self { fetcher, tester }
    }

    /// Fetch, parse and dedup every URL, then keep only usable forwards.
    ///
    /// Per-URL failures are recorded in the stats and never abort the run.
    pub async fn sync(&self, urls: &[String]) -> SyncResult {
        let SyncResult {
            mut stats,
            forwards,
        } = self.collect(urls).await;
        let forwards = self.tester.filter_usable(forwards).await;
        stats.entries = forwards.len();
        SyncResult { stats, forwards }
    }

    /// Fetch, parse and dedup without testing.
    pub async fn collect(&self, urls: &[String]) -> SyncResult {
        let mut stats = SyncStats::for_urls(urls);
        let mut collected = Vec::new();

        for (idx, url) in urls.iter().enumerate() {
            match self.fetch_one(url).await {
                Ok((nodes, format)) if nodes.is_empty() => {
                    debug!("{url}: {format} produced no nodes");
                    stats.record_failure(idx, "no usable nodes");
                }
                Ok((nodes, format)) => {
                    info!("{url}: {} nodes ({format})", nodes.len());
                    stats.record_success(idx, nodes.len(), format.name());
                    collected.extend(nodes);
                }
                Err(e) => {
                    warn!("{url}: {e:#}");
                    stats.record_failure(idx, format!("{e:#}"));
                }
            }
        }

        let forwards = dedupe_forwards(collected);
        stats.entries = forwards.len();
        debug!(
            "fetched subscriptions: ok={}, failed={}, candidates={}",
            stats.ok_urls, stats.failed_urls, stats.entries
        );
        SyncResult { stats, forwards }
    }

    async fn fetch_one(&self, url: &str) -> Result<(Vec<ForwardNode>, SubscriptionFormat)> {
        let content = self.fetcher.fetch(url).await?;
        let Some(format) = SubscriptionFormat::detect(&content) else {
            anyhow::bail!("no parser available");
        };
        let nodes = format.parse(&content)?;
        Ok((nodes, format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::fetcher::HttpFetcher;
    use crate::pool::probe::ProbeOutcome;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_sync(tester: Arc<dyn ForwardTester>) -> SubscriptionSync {
        let fetcher = HttpFetcher::new(Duration::from_secs(5), false, "proxypool-test").unwrap();
        SubscriptionSync::new(Arc::new(fetcher), tester)
    }

    async fn mount(server: &MockServer, route: &str, status: u16, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn failing_url_does_not_abort_the_run() {
        let server = MockServer::start().await;
        mount(&server, "/one", 200, "ss://aes-256-gcm:a@h1:1\n").await;
        mount(&server, "/two", 500, "boom").await;
        mount(&server, "/three", 200, "vmess://none:u@h3:3?alterID=0\n").await;
        let urls: Vec<String> = ["/one", "/two", "/three"]
            .iter()
            .map(|p| format!("{}{p}", server.uri()))
            .collect();

        let result = http_sync(Arc::new(PassThroughTester)).sync(&urls).await;
        assert_eq!(result.stats.total_urls, 3);
        assert_eq!(result.stats.ok_urls, 2);
        assert_eq!(result.stats.failed_urls, 1);
        assert_eq!(result.stats.entries, 2);
        assert!(result.stats.get(&urls[1]).unwrap().error.as_deref().unwrap().contains("500"));
        assert_eq!(
            result.stats.get(&urls[2]).unwrap().format.as_deref(),
            Some("plain-text")
        );
        assert_eq!(result.forwards.len(), 2);
    }

    #[tokio::test]
    async fn empty_parse_is_recorded_as_failure() {
        let server = MockServer::start().await;
        mount(&server, "/empty", 200, "nothing to see here\n").await;
        let urls = vec![format!("{}/empty", server.uri())];

        let result = http_sync(Arc::new(PassThroughTester)).sync(&urls).await;
        assert_eq!(result.stats.failed_urls, 1);
        assert_eq!(
            result.stats.get(&urls[0]).unwrap().error.as_deref(),
            Some("no usable nodes")
        );
        assert!(result.forwards.is_empty());
    }

    #[tokio::test]
    async fn duplicates_across_feeds_are_collapsed() {
        let server = MockServer::start().await;
        mount(&server, "/a", 200, "ss://m:p@h:1\nss://m:p@h:2\n").await;
        mount(&server, "/b", 200, "ss://m:p@h:2\nss://m:p@h:3\n").await;
        let urls = vec![format!("{}/a", server.uri()), format!("{}/b", server.uri())];

        let result = http_sync(Arc::new(PassThroughTester)).collect(&urls).await;
        let raws: Vec<_> = result.forwards.iter().map(ForwardNode::raw).collect();
        assert_eq!(
            raws,
            vec!["forward=ss://m:p@h:1", "forward=ss://m:p@h:2", "forward=ss://m:p@h:3"]
        );
        assert_eq!(result.stats.entries, 3);
    }

    #[tokio::test]
    async fn yaml_content_type_selects_clash_parser() {
        let server = MockServer::start().await;
        // First line is not `proxies:`, so only the declared type identifies it.
        let body = "port: 7890\nmode: rule\nproxies:\n  - {name: s1, type: ss, server: s1.example, port: 8388, cipher: aes-256-gcm, password: pw1}\n";
        Mock::given(method("GET"))
            .and(path("/clash"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/yaml"))
            .mount(&server)
            .await;
        let urls = vec![format!("{}/clash", server.uri())];

        let result = http_sync(Arc::new(PassThroughTester)).collect(&urls).await;
        assert_eq!(
            result.stats.get(&urls[0]).unwrap().format.as_deref(),
            Some("clash-yaml")
        );
        let raws: Vec<_> = result.forwards.iter().map(ForwardNode::raw).collect();
        assert_eq!(raws, vec!["forward=ss://aes-256-gcm:pw1@s1.example:8388#s1"]);
    }

    #[tokio::test]
    async fn repeated_url_gets_its_own_stat_entry() {
        let server = MockServer::start().await;
        mount(&server, "/a", 200, "ss://m:p@h:1\n").await;
        let url = format!("{}/a", server.uri());
        let urls = vec![url.clone(), url];

        let result = http_sync(Arc::new(PassThroughTester)).collect(&urls).await;
        assert_eq!(result.stats.ok_urls, 2);
        assert_eq!(result.stats.by_url.len(), 2);
        assert!(result.stats.by_url.iter().all(|s| s.count == 1));
        assert!(result
            .stats
            .by_url
            .iter()
            .all(|s| s.format.as_deref() == Some("plain-text")));
        assert_eq!(result.forwards.len(), 1);
    }

    struct RejectPort2;

    #[async_trait]
    impl ForwardProbe for RejectPort2 {
        async fn probe(&self, forward: &ForwardNode) -> ProbeOutcome {
            if forward.raw().ends_with(":2") {
                ProbeOutcome::failed()
            } else {
                ProbeOutcome::passed(Duration::from_millis(1))
            }
        }
    }

    #[tokio::test]
    async fn tester_filters_unusable_and_entries_reflect_it() {
        let server = MockServer::start().await;
        mount(&server, "/a", 200, "ss://m:p@h:1\nss://m:p@h:2\nss://m:p@h:3\n").await;
        let urls = vec![format!("{}/a", server.uri())];
        let tester = GliderForwardTester::with_probe(Arc::new(RejectPort2), 2);

        let result = http_sync(Arc::new(tester)).sync(&urls).await;
        let raws: Vec<_> = result.forwards.iter().map(ForwardNode::raw).collect();
        assert_eq!(raws, vec!["forward=ss://m:p@h:1", "forward=ss://m:p@h:3"]);
        assert_eq!(result.stats.entries, 2);
        assert_eq!(result.stats.get(&urls[0]).unwrap().count, 3);
    }
}
