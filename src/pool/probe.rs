//! Connectivity probing through ephemeral glider instances.
//!
//! # Flow per candidate
//! ```text
//! PortPool::acquire()            → exclusive port for this probe
//! ProbeWorkspace::prepare()      → glider.probe.<port>.<uuid>.conf
//! ProbeWorkspace::launch()       → glider -config <file>
//! settle delay                   → let glider bind the listener
//! GET test_url via http://host:port
//! ProbeWorkspace::release()      → terminate glider, delete the file
//! ```
//!
//! Every failure along the way becomes [`ProbeOutcome::failed`]; nothing
//! here returns an error to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use proxypool_supervisor::{ensure_executable, ManagedProcess, OutputMode};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

use super::model::{ForwardNode, GliderConfig};

/// Connectivity test endpoint, answers 200 with a short body.
pub const DEFAULT_TEST_URL: &str = "http://www.msftconnecttest.com/connecttest.txt";

/// Status codes counted as a working forward.
pub const DEFAULT_EXPECTED_STATUSES: [u16; 2] = [200, 204];

/// First port handed to probe instances.
pub const DEFAULT_BASE_PORT: u16 = 18081;

/// Request timeout through a probe instance.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Time given to a fresh glider to bind its listener.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(800);

/// Grace period before a probe instance is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Result of probing one forward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub ok: bool,
    /// Round-trip time of the test request, present only when `ok`.
    pub latency_ms: Option<f64>,
}

impl ProbeOutcome {
    pub fn passed(latency: Duration) -> Self {
        Self {
            ok: true,
            latency_ms: Some(latency.as_secs_f64() * 1000.0),
        }
    }

    pub fn failed() -> Self {
        Self {
            ok: false,
            latency_ms: None,
        }
    }
}

/// Tests whether one forward line actually carries traffic.
#[async_trait]
pub trait ForwardProbe: Send + Sync {
    async fn probe(&self, forward: &ForwardNode) -> ProbeOutcome;
}

/// Probe every node with at most `width` probes in flight.
///
/// Results come back in input order regardless of completion order. A probe
/// task that panics counts as a failure.
pub async fn probe_all(
    probe: Arc<dyn ForwardProbe>,
    nodes: Vec<ForwardNode>,
    width: usize,
) -> Vec<(ForwardNode, ProbeOutcome)> {
    let gate = Arc::new(Semaphore::new(width.max(1)));
    let mut outcomes: Vec<Option<ProbeOutcome>> = vec![None; nodes.len()];
    let mut tasks = JoinSet::new();

    for (idx, node) in nodes.iter().enumerate() {
        let probe = Arc::clone(&probe);
        let gate = Arc::clone(&gate);
        let node = node.clone();
        tasks.spawn(async move {
            let Ok(_permit) = gate.acquire_owned().await else {
                return (idx, ProbeOutcome::failed());
            };
            (idx, probe.probe(&node).await)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
            Err(e) => tracing::warn!("probe task failed: {e}"),
        }
    }

    nodes
        .into_iter()
        .zip(outcomes)
        .map(|(node, outcome)| (node, outcome.unwrap_or_else(ProbeOutcome::failed)))
        .collect()
}

// ── Ports ───────────────────────────────────────────────────────

/// Fixed table of probe ports.
///
/// Slot *i* owns port `base + i`; there are `min(workers, span)` slots. A
/// lease holds one slot until dropped, so two in-flight probes can never
/// share a port.
#[derive(Debug, Clone)]
pub struct PortPool {
    slots: Arc<Semaphore>,
    free: Arc<Mutex<Vec<u16>>>,
    capacity: usize,
}

impl PortPool {
    pub fn new(base: u16, span: u16, workers: usize) -> Self {
        let capacity = workers.max(1).min(usize::from(span.max(1)));
        let last = usize::from(base) + capacity;
        // Ports past u16::MAX are silently unavailable; config validation rejects that case.
        let ports: Vec<u16> = (usize::from(base)..last)
            .filter_map(|p| u16::try_from(p).ok())
            .rev()
            .collect();
        let capacity = ports.len();
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            free: Arc::new(Mutex::new(ports)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<PortLease> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .context("probe port pool closed")?;
        let Some(port) = self.free.lock().pop() else {
            bail!("probe port pool exhausted");
        };
        Ok(PortLease {
            port,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }
}

/// Exclusive use of one probe port. The port returns to the pool on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    free: Arc<Mutex<Vec<u16>>>,
    _permit: OwnedSemaphorePermit,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        // Push before the permit is released so the next holder finds it.
        self.free.lock().push(self.port);
    }
}

// ── Workspace ───────────────────────────────────────────────────

/// Port, temp config and glider process of one probe.
///
/// [`release`](Self::release) is the normal teardown. Dropping without it
/// still kills the process and removes the file, just without a grace period.
#[derive(Debug)]
pub struct ProbeWorkspace {
    lease: PortLease,
    config_path: PathBuf,
    process: Option<ManagedProcess>,
    grace: Duration,
}

impl ProbeWorkspace {
    /// Write a single-forward config listening on the leased port.
    pub fn prepare(
        lease: PortLease,
        config_dir: &Path,
        listen_host: &str,
        forward: &ForwardNode,
        grace: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(config_dir)
            .with_context(|| format!("failed to create {}", config_dir.display()))?;
        let port = lease.port();
        let config_path =
            config_dir.join(format!("glider.probe.{port}.{}.conf", uuid::Uuid::new_v4()));
        let config = GliderConfig {
            listen: format!("{listen_host}:{port}"),
            healthcheck_url: String::new(),
            healthcheck_enabled: false,
            forwards: vec![forward.clone()],
        };
        std::fs::write(&config_path, config.render())
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        Ok(Self {
            lease,
            config_path,
            process: None,
            grace,
        })
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn launch(&mut self, binary: &Path) -> Result<()> {
        let process = ManagedProcess::spawn(
            binary,
            [Path::new("-config"), self.config_path.as_path()],
            OutputMode::Discard,
        )?;
        self.process = Some(process);
        Ok(())
    }

    /// Whether the launched glider is still alive.
    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(ManagedProcess::is_running)
    }

    /// OS pid of the launched glider.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ManagedProcess::id)
    }

    /// Stop the process (graceful, then forced) and delete the config file.
    pub async fn release(mut self) {
        if let Some(mut process) = self.process.take() {
            process.terminate(self.grace).await;
        }
        remove_quietly(&self.config_path);
    }
}

impl Drop for ProbeWorkspace {
    fn drop(&mut self) {
        // `ManagedProcess` kills on drop; only the file needs handling here.
        remove_quietly(&self.config_path);
    }
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("failed to remove {}: {e}", path.display()),
    }
}

// ── Glider probe ────────────────────────────────────────────────

/// Settings for [`GliderProbe`].
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub binary: PathBuf,
    pub listen_host: String,
    pub base_port: u16,
    pub port_span: u16,
    pub workers: usize,
    pub settle_delay: Duration,
    pub timeout: Duration,
    pub test_url: String,
    pub expected_statuses: Vec<u16>,
    pub config_dir: PathBuf,
    pub stop_grace: Duration,
}

impl ProbeSettings {
    /// Settings with the stock defaults for everything but the binary and scratch dir.
    pub fn new(binary: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            listen_host: "127.0.0.1".to_string(),
            base_port: DEFAULT_BASE_PORT,
            port_span: 2000,
            workers: 20,
            settle_delay: DEFAULT_SETTLE_DELAY,
            timeout: DEFAULT_PROBE_TIMEOUT,
            test_url: DEFAULT_TEST_URL.to_string(),
            expected_statuses: DEFAULT_EXPECTED_STATUSES.to_vec(),
            config_dir: config_dir.into(),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Probes a forward by routing one HTTP request through a throwaway glider.
pub struct GliderProbe {
    settings: ProbeSettings,
    ports: PortPool,
}

impl GliderProbe {
    /// Fails if the glider binary does not exist.
    pub fn new(settings: ProbeSettings) -> Result<Self> {
        if !settings.binary.is_file() {
            bail!("glider executable not found at {}", settings.binary.display());
        }
        ensure_executable(&settings.binary);
        let ports = PortPool::new(settings.base_port, settings.port_span, settings.workers);
        Ok(Self { settings, ports })
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Number of probes that can be in flight at once.
    pub fn width(&self) -> usize {
        self.ports.capacity()
    }

    async fn try_probe(&self, forward: &ForwardNode) -> Result<Duration> {
        let lease = self.ports.acquire().await?;
        let mut workspace = ProbeWorkspace::prepare(
            lease,
            &self.settings.config_dir,
            &self.settings.listen_host,
            forward,
            self.settings.stop_grace,
        )?;

        let result = async {
            workspace.launch(&self.settings.binary)?;
            tokio::time::sleep(self.settings.settle_delay).await;
            if !workspace.is_running() {
                bail!("glider exited before the test request");
            }
            self.request_through(workspace.port()).await
        }
        .await;

        workspace.release().await;
        result
    }

    async fn request_through(&self, port: u16) -> Result<Duration> {
        let proxy_url = format!("http://{}:{port}", self.settings.listen_host);
        let proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| anyhow::anyhow!("invalid proxy URL '{proxy_url}': {e}"))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.settings.timeout)
            .connect_timeout(self.settings.timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build probe client: {e}"))?;

        let start = Instant::now();
        let resp = client
            .get(&self.settings.test_url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("probe failed through {proxy_url}: {e}"))?;
        let status = resp.status().as_u16();
        if self.settings.expected_statuses.contains(&status) {
            Ok(start.elapsed())
        } else {
            bail!("unexpected probe status {status} through {proxy_url}");
        }
    }
}

#[async_trait]
impl ForwardProbe for GliderProbe {
    async fn probe(&self, forward: &ForwardNode) -> ProbeOutcome {
        match self.try_probe(forward).await {
            Ok(latency) => ProbeOutcome::passed(latency),
            Err(e) => {
                debug!("probe failed for {forward}: {e:#}");
                ProbeOutcome::failed()
            }
        }
    }
}
