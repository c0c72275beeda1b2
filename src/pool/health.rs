//! Health engine: re-tests every stored proxy and records the outcome.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use super::model::{ForwardNode, Proxy};
use super::parser::format_forward_line;
use super::probe::{probe_all, ForwardProbe};
use super::store::StoreFactory;

pub use super::probe::ProbeOutcome;

/// Default number of stored proxies evaluated and returned per pass.
pub const DEFAULT_PUBLISH_LIMIT: usize = 10_000;

/// Periodic re-evaluation of the persisted pool.
pub struct HealthEngine {
    stores: StoreFactory,
    probe: Option<Arc<dyn ForwardProbe>>,
    width: usize,
    limit: usize,
}

impl HealthEngine {
    /// `probe` is `None` when no glider binary could be resolved; evaluation
    /// is then a no-op.
    pub fn new(
        stores: StoreFactory,
        probe: Option<Arc<dyn ForwardProbe>>,
        width: usize,
        limit: usize,
    ) -> Self {
        Self {
            stores,
            probe,
            width: width.max(1),
            limit,
        }
    }

    /// Probe up to `limit` stored proxies (best first), persist each outcome
    /// and return the refreshed top of the pool.
    pub async fn evaluate(&self) -> Result<Vec<Proxy>> {
        let Some(probe) = self.probe.as_ref() else {
            warn!("glider binary not found; skipping health evaluation");
            return Ok(Vec::new());
        };

        let limit = self.limit;
        let candidates = self
            .stores
            .with_store(move |store| store.list(0.0, limit))
            .await?;
        if candidates.is_empty() {
            debug!("health pass: pool is empty");
            return Ok(Vec::new());
        }

        let nodes: Vec<ForwardNode> = candidates
            .iter()
            .map(|p| ForwardNode::new(format_forward_line(p)))
            .collect();
        let results = probe_all(Arc::clone(probe), nodes, self.width).await;

        let updates: Vec<(String, ProbeOutcome)> = candidates
            .into_iter()
            .zip(results)
            .map(|(proxy, (_, outcome))| (proxy.uri, outcome))
            .collect();
        let total = updates.len();
        let passed = updates.iter().filter(|(_, o)| o.ok).count();

        self.stores
            .with_store(move |store| {
                for (uri, outcome) in &updates {
                    let latency = if outcome.ok { outcome.latency_ms } else { None };
                    store.update_health(uri, outcome.ok, latency)?;
                }
                Ok(())
            })
            .await?;
        info!("health pass: {passed}/{total} proxies reachable");

        self.stores
            .with_store(move |store| store.list(0.0, limit))
            .await
    }
}
