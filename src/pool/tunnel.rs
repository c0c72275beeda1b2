//! Live glider tunnel lifecycle.
//!
//! The tunnel owns at most one glider process. Deciding *when* to start or
//! restart is the scheduler's job; this module only does it safely:
//! restart is always stop-then-start and never overlaps itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use proxypool_supervisor::{ManagedProcess, OutputMode};
use tracing::{debug, info};

use super::model::GliderConfig;

/// Grace period before the live glider is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Brief delay to let glider bind its listener before checking it survived.
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_millis(500);

/// Supervises the long-running tunnel process.
#[async_trait]
pub trait TunnelProcess: Send {
    /// Launch against the already-written config. No-op if a process is tracked.
    async fn start(&mut self, config: &GliderConfig) -> Result<()>;

    /// Stop the tracked process, then launch again.
    async fn restart(&mut self, config: &GliderConfig) -> Result<()>;

    /// Graceful stop with forced-kill fallback. Safe when nothing runs.
    async fn stop(&mut self);
}

/// [`TunnelProcess`] backed by the glider binary.
pub struct GliderTunnel {
    binary: PathBuf,
    config_path: PathBuf,
    process: Option<ManagedProcess>,
    output: OutputMode,
    stop_grace: Duration,
    startup_delay: Duration,
}

impl GliderTunnel {
    pub fn new(binary: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            config_path: config_path.into(),
            process: None,
            output: OutputMode::Inherit,
            stop_grace: DEFAULT_STOP_GRACE,
            startup_delay: DEFAULT_STARTUP_DELAY,
        }
    }

    pub fn with_output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }

    pub fn with_timings(mut self, startup_delay: Duration, stop_grace: Duration) -> Self {
        self.startup_delay = startup_delay;
        self.stop_grace = stop_grace;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Whether a tracked glider is still alive.
    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(ManagedProcess::is_running)
    }

    /// OS pid of the tracked glider.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ManagedProcess::id)
    }

    async fn launch(&mut self) -> Result<()> {
        if self.process.is_some() {
            debug!("glider already running; start ignored");
            return Ok(());
        }
        if !self.config_path.exists() {
            bail!("glider config not found at {}", self.config_path.display());
        }

        let mut process = ManagedProcess::spawn(
            &self.binary,
            [Path::new("-config"), self.config_path.as_path()],
            self.output,
        )?;
        tokio::time::sleep(self.startup_delay).await;
        if !process.is_running() {
            process.terminate(Duration::ZERO).await;
            bail!(
                "glider exited during startup (config {})",
                self.config_path.display()
            );
        }
        info!(
            "glider started (pid {:?}) with {}",
            process.id(),
            self.config_path.display()
        );
        self.process = Some(process);
        Ok(())
    }
}

#[async_trait]
impl TunnelProcess for GliderTunnel {
    async fn start(&mut self, _config: &GliderConfig) -> Result<()> {
        self.launch().await
    }

    async fn restart(&mut self, _config: &GliderConfig) -> Result<()> {
        self.stop().await;
        self.launch().await
    }

    async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            let pid = process.id();
            process.terminate(self.stop_grace).await;
            info!("glider stopped (pid {pid:?})");
        }
    }
}
