//! End-to-end pool lifecycle: collect, persist, evaluate, publish.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::health::HealthEngine;
use super::link::extract_host_port;
use super::model::Proxy;
use super::parser::{load_proxies_from_config, parse_forwards};
use super::publisher::GliderConfigPublisher;
use super::source::SubscriptionSource;
use super::store::StoreFactory;
use super::sync::SubscriptionSync;

/// Counts from one refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshResult {
    /// Pool entries parsed from the subscriptions.
    pub collected: usize,
    /// Entries written to the store.
    pub stored: usize,
    /// Forward lines in the published config.
    pub published: usize,
}

pub struct PoolOrchestrator {
    source: Arc<dyn SubscriptionSource>,
    sync: SubscriptionSync,
    stores: StoreFactory,
    health: HealthEngine,
    publisher: GliderConfigPublisher,
}

impl PoolOrchestrator {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        sync: SubscriptionSync,
        stores: StoreFactory,
        health: HealthEngine,
        publisher: GliderConfigPublisher,
    ) -> Self {
        Self {
            source,
            sync,
            stores,
            health,
            publisher,
        }
    }

    pub fn stores(&self) -> &StoreFactory {
        &self.stores
    }

    /// Collect, persist, evaluate and publish in a single pass.
    ///
    /// When the subscription list cannot be read or is empty the pass
    /// degrades to [`perform_maintenance`](Self::perform_maintenance).
    pub async fn refresh_pool(&self) -> Result<RefreshResult> {
        let urls = match self.source.load() {
            Ok(urls) if !urls.is_empty() => urls,
            Ok(_) => {
                warn!("{}: no subscriptions; refreshing existing pool only", self.source.describe());
                return self.maintenance_only().await;
            }
            Err(e) => {
                warn!("collection failed, refreshing existing pool only: {e:#}");
                return self.maintenance_only().await;
            }
        };

        let result = self.sync.collect(&urls).await;
        let collected = parse_forwards(result.forwards.iter().map(|f| f.raw()));
        let count = collected.len();
        let stored = self
            .stores
            .with_store(move |store| store.upsert_many(&collected))
            .await?;
        info!("refresh: collected {count}, stored {stored}");

        let evaluated = self.health.evaluate().await?;
        let published = self.publisher.publish(&evaluated)?;
        Ok(RefreshResult {
            collected: count,
            stored,
            published,
        })
    }

    /// Re-evaluate the stored pool and republish. Returns the evaluated count.
    pub async fn perform_maintenance(&self) -> Result<usize> {
        let evaluated = self.health.evaluate().await?;
        self.publisher.publish(&evaluated)?;
        Ok(evaluated.len())
    }

    async fn maintenance_only(&self) -> Result<RefreshResult> {
        let evaluated = self.health.evaluate().await?;
        let published = self.publisher.publish(&evaluated)?;
        Ok(RefreshResult {
            collected: 0,
            stored: 0,
            published,
        })
    }
}

/// Stored proxies with `score >= min_score`, best first.
///
/// Entries whose stored host is empty or whose port is unusable get both
/// re-derived from the uri.
pub async fn list_proxies(stores: &StoreFactory, min_score: f64, limit: usize) -> Result<Vec<Proxy>> {
    let proxies = stores
        .with_store(move |store| store.list(min_score, limit))
        .await?;
    Ok(proxies.into_iter().map(repair_endpoint).collect())
}

fn repair_endpoint(mut proxy: Proxy) -> Proxy {
    if proxy.host.is_empty() || proxy.port == 0 {
        let (host, port) = extract_host_port(&proxy.uri);
        proxy.host = host;
        proxy.port = port;
    }
    proxy
}

/// Upsert the forward lines of an existing glider config. Returns the stored count.
pub async fn import_config(stores: &StoreFactory, path: &Path) -> Result<usize> {
    let proxies = load_proxies_from_config(path)?;
    if proxies.is_empty() {
        warn!("{}: no forward lines to import", path.display());
        return Ok(0);
    }
    let stored = stores
        .with_store(move |store| store.upsert_many(&proxies))
        .await?;
    info!("imported {stored} proxies from {}", path.display());
    Ok(stored)
}
