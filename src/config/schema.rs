//! Configuration schema.
//!
//! Every field carries a serde default, so an empty or partial TOML file is a
//! valid configuration.

use serde::{Deserialize, Serialize};

use crate::pool::probe::{DEFAULT_BASE_PORT, DEFAULT_EXPECTED_STATUSES, DEFAULT_TEST_URL};

/// Port the published pool config listens on.
pub const DEFAULT_HTTP_PORT: &str = "10707";

/// Port the live tunnel listens on.
pub const DEFAULT_ALT_PORT: &str = "10710";

/// Health check URL handed to glider when forwarder checks are enabled.
pub const DEFAULT_HEALTHCHECK_URL: &str =
    "http://www.msftconnecttest.com/connecttest.txt#expect=200";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub glider: GliderSection,
    pub scheduler: SchedulerSection,
    pub probe: ProbeSection,
    pub health: HealthSection,
    pub publisher: PublisherSection,
    pub rotation: RotationSection,
    pub storage: StorageSection,
    pub fetch: FetchSection,
}

/// `[glider]`: where the binary and its scratch files live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GliderSection {
    /// Explicit binary path. Unset means the usual install locations, then `PATH`.
    pub binary: Option<String>,
    /// Directory for per-probe temporary configs.
    pub work_dir: String,
}

impl Default for GliderSection {
    fn default() -> Self {
        Self {
            binary: None,
            work_dir: "glider".into(),
        }
    }
}

/// `[scheduler]`: the live tunnel refresh loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub subscriptions_file: String,
    pub listen: String,
    pub interval_secs: u64,
    pub healthcheck_url: String,
    pub config_output: String,
    /// Probe every candidate before it reaches the live config.
    pub test_each_forward: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            subscriptions_file: "subscriptions.txt".into(),
            listen: format!(":{DEFAULT_ALT_PORT}"),
            interval_secs: 6000,
            healthcheck_url: DEFAULT_HEALTHCHECK_URL.into(),
            config_output: "glider/glider.conf".into(),
            test_each_forward: true,
        }
    }
}

/// `[probe]`: candidate testing during subscription sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub listen_host: String,
    pub start_port: u16,
    pub port_span: u16,
    pub workers: usize,
    pub timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub stop_grace_ms: u64,
    pub test_url: String,
    pub expected_statuses: Vec<u16>,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".into(),
            start_port: DEFAULT_BASE_PORT,
            port_span: 2000,
            workers: 20,
            timeout_secs: 8,
            settle_delay_ms: 800,
            stop_grace_ms: 3000,
            test_url: DEFAULT_TEST_URL.into(),
            expected_statuses: DEFAULT_EXPECTED_STATUSES.to_vec(),
        }
    }
}

/// `[health]`: periodic re-evaluation of the stored pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub workers: usize,
    pub start_port: u16,
    pub port_span: u16,
    pub settle_delay_ms: u64,
    /// Stored proxies evaluated per pass.
    pub limit: usize,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            workers: 10,
            // Directly above the sync probe range.
            start_port: DEFAULT_BASE_PORT + 2000,
            port_span: 2000,
            settle_delay_ms: 500,
            limit: crate::pool::health::DEFAULT_PUBLISH_LIMIT,
        }
    }
}

/// `[publisher]`: the config rendered from the scored pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherSection {
    pub listen: String,
    pub output: String,
    pub score_threshold: f64,
    /// 0 publishes everything that qualifies.
    pub max_publish: usize,
    pub healthcheck_enabled: bool,
    pub healthcheck_url: String,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            listen: format!(":{DEFAULT_HTTP_PORT}"),
            output: "glider/glider.pool.conf".into(),
            score_threshold: crate::pool::publisher::DEFAULT_SCORE_THRESHOLD,
            max_publish: crate::pool::publisher::DEFAULT_MAX_PUBLISH,
            healthcheck_enabled: false,
            healthcheck_url: DEFAULT_HEALTHCHECK_URL.into(),
        }
    }
}

/// `[rotation]`: per-token proxy rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationSection {
    pub counter_ttl_secs: u64,
    pub candidate_limit: usize,
    pub rotate_every: i64,
    pub min_score: f64,
}

impl Default for RotationSection {
    fn default() -> Self {
        Self {
            counter_ttl_secs: crate::pool::rotation::DEFAULT_COUNTER_TTL.as_secs(),
            candidate_limit: crate::pool::rotation::DEFAULT_CANDIDATE_LIMIT,
            rotate_every: 5,
            min_score: crate::pool::rotation::DEFAULT_MIN_SCORE,
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: "data.db".into(),
        }
    }
}

/// `[fetch]`: subscription downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub timeout_secs: u64,
    pub tls_verify: bool,
    pub user_agent: String,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            tls_verify: false,
            user_agent: concat!("proxypool/", env!("CARGO_PKG_VERSION")).into(),
        }
    }
}
