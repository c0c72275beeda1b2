//! Publishing the healthy part of the pool as a glider config.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use super::model::{ForwardNode, GliderConfig, Proxy, ProxyStatus};
use super::parser::format_forward_line;
use super::writer::ConfigWriter;

/// Minimum score for a proxy to be published.
pub const DEFAULT_SCORE_THRESHOLD: f64 = 20.0;

/// Upper bound on published forwards; 0 disables the cap.
pub const DEFAULT_MAX_PUBLISH: usize = 200;

const PUBLISHABLE_SCHEMES: [&str; 2] = ["ss", "vmess"];

/// Filters ranked proxies and writes them as the published glider config.
pub struct GliderConfigPublisher {
    writer: Arc<dyn ConfigWriter>,
    listen: String,
    threshold: f64,
    max_publish: usize,
    healthcheck_enabled: bool,
    healthcheck_url: String,
}

impl GliderConfigPublisher {
    pub fn new(writer: Arc<dyn ConfigWriter>, listen: impl Into<String>) -> Self {
        Self {
            writer,
            listen: listen.into(),
            threshold: DEFAULT_SCORE_THRESHOLD,
            max_publish: DEFAULT_MAX_PUBLISH,
            healthcheck_enabled: false,
            healthcheck_url: String::new(),
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_max_publish(mut self, max_publish: usize) -> Self {
        self.max_publish = max_publish;
        self
    }

    pub fn with_healthcheck(mut self, enabled: bool, url: impl Into<String>) -> Self {
        self.healthcheck_enabled = enabled;
        self.healthcheck_url = url.into();
        self
    }

    /// Proxies that qualify, in input (ranking) order, capped at `max_publish`.
    pub fn select<'a>(&self, proxies: &'a [Proxy]) -> Vec<&'a Proxy> {
        let mut seen = HashSet::new();
        let selected = proxies.iter().filter(|p| {
            p.status == ProxyStatus::Up
                && p.score >= self.threshold
                && !p.host.is_empty()
                && PUBLISHABLE_SCHEMES.contains(&p.scheme.as_str())
                && seen.insert(p.uri.as_str())
        });
        if self.max_publish > 0 {
            selected.take(self.max_publish).collect()
        } else {
            selected.collect()
        }
    }

    /// Write the published config. Returns the number of forward lines written.
    pub fn publish(&self, proxies: &[Proxy]) -> Result<usize> {
        let forwards: Vec<ForwardNode> = self
            .select(proxies)
            .into_iter()
            .map(|p| ForwardNode::new(format_forward_line(p)))
            .collect();
        let count = forwards.len();
        let config = GliderConfig {
            listen: self.listen.clone(),
            healthcheck_url: self.healthcheck_url.clone(),
            healthcheck_enabled: self.healthcheck_enabled,
            forwards,
        };
        self.writer.write(&config)?;
        info!(
            "published {count}/{} proxies to {}",
            proxies.len(),
            self.writer.path().display()
        );
        Ok(count)
    }
}
