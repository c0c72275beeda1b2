//! Pool data model: stored proxies, forward lines, sync results and the
//! rendered glider configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix every glider forward directive starts with.
pub const FORWARD_PREFIX: &str = "forward=";

/// Health status of a stored proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    #[default]
    Unknown,
    Up,
    Down,
}

impl ProxyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProxyStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => anyhow::bail!("unknown proxy status '{other}'"),
        }
    }
}

/// Score assigned to a proxy that has never been checked.
pub const DEFAULT_SCORE: f64 = 50.0;

/// Latency sentinel meaning "no successful measurement yet".
pub const NO_LATENCY: f64 = -1.0;

/// A pool entry. `uri` is the identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: Option<i64>,
    pub uri: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub label: Option<String>,
    pub status: ProxyStatus,
    pub score: f64,
    pub success_count: u64,
    pub fail_count: u64,
    pub avg_latency_ms: f64,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_ok: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Proxy {
    /// A fresh, never-checked entry.
    pub fn new(
        uri: impl Into<String>,
        scheme: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        label: Option<String>,
    ) -> Self {
        Self {
            id: None,
            uri: uri.into(),
            scheme: scheme.into(),
            host: host.into(),
            port,
            label,
            status: ProxyStatus::Unknown,
            score: DEFAULT_SCORE,
            success_count: 0,
            fail_count: 0,
            avg_latency_ms: NO_LATENCY,
            last_checked: None,
            last_ok: None,
            created_at: None,
            updated_at: None,
        }
    }
}

/// A raw `forward=<uri>[#label]` line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardNode {
    raw: String,
}

impl ForwardNode {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Wrap a link as `forward=<link>`.
    pub fn from_link(link: &str) -> Self {
        Self::new(format!("{FORWARD_PREFIX}{link}"))
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The part after `forward=`, if the marker is present.
    pub fn link(&self) -> Option<&str> {
        self.raw.strip_prefix(FORWARD_PREFIX)
    }

    /// The line terminated by exactly one newline.
    pub fn as_line(&self) -> String {
        if self.raw.ends_with('\n') {
            self.raw.clone()
        } else {
            format!("{}\n", self.raw)
        }
    }
}

impl fmt::Display for ForwardNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Body of one retrieved subscription URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    pub url: String,
    pub text: String,
    pub content_type: Option<String>,
}

impl FetchedContent {
    pub fn new(url: impl Into<String>, text: impl Into<String>, content_type: Option<String>) -> Self {
        Self {
            url: url.into(),
            text: text.into(),
            content_type,
        }
    }
}

/// Per-URL outcome inside [`SyncStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UrlStat {
    pub url: String,
    pub count: usize,
    pub format: Option<String>,
    pub error: Option<String>,
}

/// Aggregate of one sync run. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub total_urls: usize,
    pub ok_urls: usize,
    pub failed_urls: usize,
    pub entries: usize,
    pub by_url: Vec<UrlStat>,
}

impl SyncStats {
    pub fn for_urls(urls: &[String]) -> Self {
        Self {
            total_urls: urls.len(),
            by_url: urls
                .iter()
                .map(|url| UrlStat {
                    url: url.clone(),
                    ..UrlStat::default()
                })
                .collect(),
            ..Self::default()
        }
    }

    /// Record the outcome of the URL at position `idx` in the input list.
    ///
    /// Positions rather than URLs key the entries, so a URL listed twice keeps
    /// two separate outcomes.
    pub fn record_success(&mut self, idx: usize, count: usize, format: &str) {
        self.ok_urls += 1;
        if let Some(stat) = self.by_url.get_mut(idx) {
            stat.count = count;
            stat.format = Some(format.to_string());
        }
    }

    pub fn record_failure(&mut self, idx: usize, error: impl Into<String>) {
        self.failed_urls += 1;
        if let Some(stat) = self.by_url.get_mut(idx) {
            stat.error = Some(error.into());
        }
    }

    /// First entry for `url`.
    pub fn get(&self, url: &str) -> Option<&UrlStat> {
        self.by_url.iter().find(|s| s.url == url)
    }
}

/// Output of the subscription sync pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub stats: SyncStats,
    pub forwards: Vec<ForwardNode>,
}

/// Rendered tunnel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GliderConfig {
    pub listen: String,
    pub healthcheck_url: String,
    pub healthcheck_enabled: bool,
    pub forwards: Vec<ForwardNode>,
}

/// Interval glider uses for its own forwarder checks when enabled.
const GLIDER_CHECK_INTERVAL_SECS: u32 = 300;

impl GliderConfig {
    /// Render the glider config text: header block then one forward per line.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(256 + self.forwards.len() * 96);
        out.push_str("# Verbose mode, print logs\nverbose=true\n\n");
        out.push_str(&format!("# listen address\nlisten={}\n\n", self.listen));
        out.push_str("# strategy: rr (round-robin) or ha (high-availability)\nstrategy=rr\n\n");
        if self.healthcheck_enabled && !self.healthcheck_url.is_empty() {
            out.push_str(&format!(
                "# forwarder health check\ncheck={}\n\n# check interval(seconds)\ncheckinterval={GLIDER_CHECK_INTERVAL_SECS}\n\n",
                self.healthcheck_url
            ));
        } else {
            out.push_str("# forwarder health check disabled\ncheckinterval=0\n\n");
        }
        for node in &self.forwards {
            out.push_str(&node.as_line());
        }
        out
    }
}

/// Settings for one scheduler run. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub subscriptions_file: PathBuf,
    pub listen: String,
    pub interval: Duration,
    pub healthcheck_url: String,
    pub config_output: PathBuf,
    pub run_once: bool,
    pub dry_run: bool,
    pub tls_verify: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_defaults() {
        let p = Proxy::new("ss://m:p@h:1", "ss", "h", 1, None);
        assert_eq!(p.status, ProxyStatus::Unknown);
        assert_eq!(p.score, DEFAULT_SCORE);
        assert_eq!(p.avg_latency_ms, NO_LATENCY);
        assert_eq!(p.success_count, 0);
    }

    #[test]
    fn status_roundtrips_through_str() {
        for s in [ProxyStatus::Unknown, ProxyStatus::Up, ProxyStatus::Down] {
            assert_eq!(s.as_str().parse::<ProxyStatus>().unwrap(), s);
        }
        assert!("sideways".parse::<ProxyStatus>().is_err());
    }

    #[test]
    fn forward_node_line_handling() {
        let node = ForwardNode::from_link("ss://m:p@h:1#x");
        assert_eq!(node.raw(), "forward=ss://m:p@h:1#x");
        assert_eq!(node.link(), Some("ss://m:p@h:1#x"));
        assert_eq!(node.as_line(), "forward=ss://m:p@h:1#x\n");
        assert_eq!(ForwardNode::new("already\n").as_line(), "already\n");
        assert_eq!(ForwardNode::new("ss://x").link(), None);
    }

    #[test]
    fn render_with_healthcheck() {
        let cfg = GliderConfig {
            listen: ":10710".into(),
            healthcheck_url: "http://check/#expect=200".into(),
            healthcheck_enabled: true,
            forwards: vec![
                ForwardNode::from_link("ss://a:b@h:1"),
                ForwardNode::from_link("vmess://none:id@h:2?alterID=0"),
            ],
        };
        let text = cfg.render();
        assert!(text.contains("verbose=true\n"));
        assert!(text.contains("listen=:10710\n"));
        assert!(text.contains("strategy=rr\n"));
        assert!(text.contains("check=http://check/#expect=200\n"));
        assert!(text.contains("checkinterval=300\n"));
        assert!(text.ends_with(
            "forward=ss://a:b@h:1\nforward=vmess://none:id@h:2?alterID=0\n"
        ));
    }

    #[test]
    fn render_without_healthcheck() {
        let cfg = GliderConfig {
            listen: "127.0.0.1:18081".into(),
            healthcheck_url: "http://check".into(),
            healthcheck_enabled: false,
            forwards: vec![ForwardNode::from_link("ss://a:b@h:1")],
        };
        let text = cfg.render();
        assert!(text.contains("checkinterval=0\n"));
        assert!(!text.contains("check=http"));
        // Header comes before any forward line.
        let header_end = text.find("checkinterval=0").unwrap();
        assert!(text.find("forward=").unwrap() > header_end);
    }

    #[test]
    fn sync_stats_records_by_url() {
        let urls = vec!["a".to_string(), "b".to_string()];
        let mut stats = SyncStats::for_urls(&urls);
        stats.record_success(0, 3, "plain-text");
        stats.record_failure(1, "HTTP 500");
        assert_eq!(stats.total_urls, 2);
        assert_eq!(stats.ok_urls, 1);
        assert_eq!(stats.failed_urls, 1);
        assert_eq!(stats.get("a").unwrap().count, 3);
        assert_eq!(stats.get("a").unwrap().format.as_deref(), Some("plain-text"));
        assert_eq!(stats.get("b").unwrap().error.as_deref(), Some("HTTP 500"));
    }

    #[test]
    fn sync_stats_keeps_repeated_urls_apart() {
        let urls = vec!["a".to_string(), "a".to_string()];
        let mut stats = SyncStats::for_urls(&urls);
        stats.record_success(0, 2, "plain-text");
        stats.record_failure(1, "timed out");
        assert_eq!(stats.by_url.len(), 2);
        assert_eq!(stats.by_url[0].count, 2);
        assert!(stats.by_url[0].error.is_none());
        assert_eq!(stats.by_url[1].count, 0);
        assert_eq!(stats.by_url[1].error.as_deref(), Some("timed out"));
    }
}
