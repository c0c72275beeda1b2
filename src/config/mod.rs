//! Configuration loading.
//!
//! Search order: explicit `--config` path → `~/.proxypool/config.toml` →
//! built-in defaults. Environment overrides are applied once, after the file
//! is read; nothing below this module reads the environment.

mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::UserDirs;
use proxypool_supervisor::resolve_binary;
use tracing::{debug, warn};

use crate::pool::model::SchedulerConfig;
use crate::pool::probe::ProbeSettings;

pub use schema::{
    Config, FetchSection, GliderSection, HealthSection, ProbeSection, PublisherSection,
    RotationSection, SchedulerSection, StorageSection, DEFAULT_ALT_PORT, DEFAULT_HEALTHCHECK_URL,
    DEFAULT_HTTP_PORT,
};

const CONFIG_DIR: &str = ".proxypool";
const CONFIG_FILE: &str = "config.toml";

/// `~/.proxypool/config.toml`, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    UserDirs::new().map(|u| u.home_dir().join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Normalise a glider listen value: bare ports gain a leading `:`, anything
/// with a `:` is kept, blank falls back to `fallback_port`.
pub fn normalise_listen(value: &str, fallback_port: &str) -> String {
    let candidate = match value.trim() {
        "" => fallback_port.trim(),
        v => v,
    };
    if candidate.contains(':') {
        candidate.to_string()
    } else {
        format!(":{candidate}")
    }
}

/// Expand `~` and `$VAR` in a configured path. Unknown variables leave the
/// value untouched.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            debug!("path {raw} not expanded: {e}");
            PathBuf::from(raw)
        }
    }
}

impl Config {
    /// Load, apply environment overrides, validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => {
                    debug!("no config file found; using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing config '{}'", path.display()))?;
        debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in production)
    /// and normalise the listen addresses.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(bin) = var("GLIDER_BIN") {
            self.glider.binary = Some(bin);
        }
        if let Some(db) = var("PROXYPOOL_DB") {
            self.storage.db_path = db;
        }
        if let Some(raw) = var("HEALTHCHECK_WORKERS") {
            match raw.parse() {
                Ok(n) => self.health.workers = n,
                Err(e) => warn!("ignoring HEALTHCHECK_WORKERS={raw}: {e}"),
            }
        }
        if let Some(raw) = var("GLIDER_SCORE_THRESHOLD") {
            match raw.parse() {
                Ok(n) => self.publisher.score_threshold = n,
                Err(e) => warn!("ignoring GLIDER_SCORE_THRESHOLD={raw}: {e}"),
            }
        }
        if let Some(raw) = var("GLIDER_MAX_PUBLISH") {
            match raw.parse() {
                Ok(n) => self.publisher.max_publish = n,
                Err(e) => warn!("ignoring GLIDER_MAX_PUBLISH={raw}: {e}"),
            }
        }
        if let Some(port) = lookup("GLIDER_HTTP_PORT") {
            self.publisher.listen = port;
        }
        if let Some(port) = lookup("GLIDER_ALT_PORT") {
            self.scheduler.listen = port;
        }

        self.publisher.listen = normalise_listen(&self.publisher.listen, DEFAULT_HTTP_PORT);
        self.scheduler.listen = normalise_listen(&self.scheduler.listen, DEFAULT_ALT_PORT);
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.interval_secs == 0 {
            bail!("scheduler.interval_secs must be greater than 0");
        }
        if self.probe.workers == 0 {
            bail!("probe.workers must be greater than 0");
        }
        if self.health.workers == 0 {
            bail!("health.workers must be greater than 0");
        }
        if self.probe.expected_statuses.is_empty() {
            bail!("probe.expected_statuses must not be empty");
        }
        check_port_range("probe", self.probe.start_port, self.probe.port_span)?;
        check_port_range("health", self.health.start_port, self.health.port_span)?;
        Ok(())
    }

    // ── Derived values ──────────────────────────────────────────

    /// Locate glider: the configured path, else the usual install locations,
    /// else `PATH`.
    pub fn glider_binary(&self) -> Option<PathBuf> {
        let candidates = match self.glider.binary.as_deref() {
            Some(explicit) => vec![expand_path(explicit)],
            None => {
                let name = if cfg!(windows) { "glider.exe" } else { "glider" };
                vec![
                    PathBuf::from("/usr/local/bin/glider"),
                    self.work_dir().join(name),
                ]
            }
        };
        resolve_binary(&candidates, "glider")
    }

    pub fn work_dir(&self) -> PathBuf {
        expand_path(&self.glider.work_dir)
    }

    pub fn db_path(&self) -> PathBuf {
        expand_path(&self.storage.db_path)
    }

    pub fn subscriptions_file(&self) -> PathBuf {
        expand_path(&self.scheduler.subscriptions_file)
    }

    pub fn live_config_path(&self) -> PathBuf {
        expand_path(&self.scheduler.config_output)
    }

    pub fn published_config_path(&self) -> PathBuf {
        expand_path(&self.publisher.output)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_secs)
    }

    pub fn counter_ttl(&self) -> Duration {
        Duration::from_secs(self.rotation.counter_ttl_secs)
    }

    pub fn scheduler_config(&self, run_once: bool, dry_run: bool) -> SchedulerConfig {
        SchedulerConfig {
            subscriptions_file: self.subscriptions_file(),
            listen: self.scheduler.listen.clone(),
            interval: Duration::from_secs(self.scheduler.interval_secs),
            healthcheck_url: self.scheduler.healthcheck_url.clone(),
            config_output: self.live_config_path(),
            run_once,
            dry_run,
            tls_verify: self.fetch.tls_verify,
        }
    }

    /// Probe settings for candidate testing during subscription sync.
    pub fn sync_probe_settings(&self, binary: PathBuf) -> ProbeSettings {
        let p = &self.probe;
        ProbeSettings {
            listen_host: p.listen_host.clone(),
            base_port: p.start_port,
            port_span: p.port_span,
            workers: p.workers,
            settle_delay: Duration::from_millis(p.settle_delay_ms),
            timeout: Duration::from_secs(p.timeout_secs),
            test_url: p.test_url.clone(),
            expected_statuses: p.expected_statuses.clone(),
            stop_grace: Duration::from_millis(p.stop_grace_ms),
            ..ProbeSettings::new(binary, self.work_dir())
        }
    }

    /// Probe settings for the health engine: shares the request side of
    /// `[probe]` but uses its own ports, width and settle delay.
    pub fn health_probe_settings(&self, binary: PathBuf) -> ProbeSettings {
        let h = &self.health;
        ProbeSettings {
            base_port: h.start_port,
            port_span: h.port_span,
            workers: h.workers,
            settle_delay: Duration::from_millis(h.settle_delay_ms),
            ..self.sync_probe_settings(binary)
        }
    }
}

fn check_port_range(section: &str, start: u16, span: u16) -> Result<()> {
    if span == 0 {
        bail!("{section}.port_span must be greater than 0");
    }
    if u32::from(start) + u32::from(span) - 1 > u32::from(u16::MAX) {
        bail!("{section}.start_port + port_span exceeds 65535 ({start} + {span})");
    }
    if start == 0 {
        bail!("{section}.start_port must be greater than 0");
    }
    Ok(())
}
