//! Proxy pool engine.
//!
//! Leaves first: `link` and `parser` turn subscription content into
//! forward lines, `dedup` drops repeats, `probe` tests candidates through
//! ephemeral glider processes, `sync` composes them. `scoring`, `store` and
//! `health` keep the persisted pool honest; `tunnel` and `scheduler` keep the
//! live glider process in step with the newest usable set.

pub mod dedup;
pub mod fetcher;
pub mod health;
pub mod link;
pub mod model;
pub mod orchestrator;
pub mod parser;
pub mod probe;
pub mod publisher;
pub mod rotation;
pub mod scheduler;
pub mod scoring;
pub mod source;
pub mod store;
pub mod sync;
#[cfg(all(test, unix))]
pub(crate) mod test_support;
pub mod tunnel;
pub mod writer;

pub use dedup::dedupe_forwards;
pub use fetcher::{Fetcher, HttpFetcher};
pub use health::{HealthEngine, ProbeOutcome};
pub use model::{
    FetchedContent, ForwardNode, GliderConfig, Proxy, ProxyStatus, SchedulerConfig, SyncResult,
    SyncStats, UrlStat,
};
pub use orchestrator::{import_config, list_proxies, PoolOrchestrator, RefreshResult};
pub use parser::{format_forward_line, load_proxies_from_config, parse_forwards, SubscriptionFormat};
pub use probe::{ForwardProbe, GliderProbe, PortPool, ProbeSettings};
pub use publisher::GliderConfigPublisher;
pub use rotation::{MemoryTokenCounter, RotationSelector, SqliteTokenCounter, TokenCounter};
pub use scheduler::{forward_hash, Scheduler, SchedulerError, SchedulerState, Sleeper, TokioSleeper};
pub use store::{ProxyStore, StoreFactory};
pub use sync::{ForwardTester, GliderForwardTester, PassThroughTester, SubscriptionSync};
pub use tunnel::{GliderTunnel, TunnelProcess};
pub use writer::{ConfigWriter, FileConfigWriter};
pub use source::{FileSubscriptionSource, StaticSubscriptionSource, SubscriptionSource};
