//! Polling scheduler that keeps the live tunnel in step with subscriptions.
//!
//! # States
//! ```text
//! Init ──► FirstSync ──► Idle ⇄ Syncing ──► Stopped
//!              │                    ▲
//!              └── dry_run/run_once ┘
//! ```
//! Only two conditions are fatal: no subscription URLs at startup, and a
//! first sync that yields nothing usable. Every later failure keeps the
//! tunnel on its last applied config.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::HttpFetcher;
use super::model::{ForwardNode, GliderConfig, SchedulerConfig, SyncResult};
use super::source::{FileSubscriptionSource, SubscriptionSource};
use super::sync::{ForwardTester, SubscriptionSync};
use super::tunnel::{GliderTunnel, TunnelProcess};
use super::writer::{ConfigWriter, FileConfigWriter};

/// Fatal scheduler conditions.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no subscriptions found in {path}")]
    NoSubscriptions { path: String },
    #[error("no usable forwards on initial sync")]
    NoUsableForwards,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Init,
    FirstSync,
    Idle,
    Syncing,
    Stopped,
}

/// Sleep primitive, swappable so tests can run many cycles instantly.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Content hash of an ordered forward set: SHA-256 over each raw line plus `\n`.
pub fn forward_hash(forwards: &[ForwardNode]) -> String {
    let mut hasher = Sha256::new();
    for node in forwards {
        hasher.update(node.raw().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub struct Scheduler<T: TunnelProcess> {
    source: Arc<dyn SubscriptionSource>,
    sync: SubscriptionSync,
    tunnel: T,
    writer: Arc<dyn ConfigWriter>,
    sleeper: Arc<dyn Sleeper>,
    state: SchedulerState,
    started: bool,
    last_hash: Option<String>,
    last_result: Option<SyncResult>,
}

impl Scheduler<GliderTunnel> {
    /// Scheduler over the subscriptions file, live config path and TLS policy
    /// named in `settings`.
    pub fn for_settings(
        settings: &SchedulerConfig,
        binary: impl Into<PathBuf>,
        fetch_timeout: Duration,
        user_agent: &str,
        tester: Arc<dyn ForwardTester>,
    ) -> Result<Self> {
        let fetcher = HttpFetcher::new(fetch_timeout, settings.tls_verify, user_agent)?;
        Ok(Self::new(
            Arc::new(FileSubscriptionSource::new(&settings.subscriptions_file)),
            SubscriptionSync::new(Arc::new(fetcher), tester),
            GliderTunnel::new(binary, &settings.config_output),
            Arc::new(FileConfigWriter::new(&settings.config_output)),
        ))
    }
}

impl<T: TunnelProcess> Scheduler<T> {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        sync: SubscriptionSync,
        tunnel: T,
        writer: Arc<dyn ConfigWriter>,
    ) -> Self {
        Self {
            source,
            sync,
            tunnel,
            writer,
            sleeper: Arc::new(TokioSleeper),
            state: SchedulerState::Init,
            started: false,
            last_hash: None,
            last_result: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn tunnel(&self) -> &T {
        &self.tunnel
    }

    /// Hash of the forward set currently applied to the tunnel.
    pub fn last_hash(&self) -> Option<&str> {
        self.last_hash.as_deref()
    }

    /// Outcome of the most recent sync pass.
    pub fn last_result(&self) -> Option<&SyncResult> {
        self.last_result.as_ref()
    }

    /// Drive the state machine until `cancel` fires (or after the first pass
    /// for dry-run/run-once). The tunnel is stopped on every exit path.
    ///
    /// Cancellation also interrupts an in-flight sync pass; the dropped pass
    /// kills its probe instances and removes their configs.
    pub async fn run(&mut self, config: &SchedulerConfig, cancel: CancellationToken) -> Result<()> {
        self.state = SchedulerState::Init;
        let urls = self.source.load()?;
        if urls.is_empty() {
            self.state = SchedulerState::Stopped;
            return Err(SchedulerError::NoSubscriptions {
                path: self.source.describe(),
            }
            .into());
        }
        debug!("{} subscription URLs configured", urls.len());

        self.state = SchedulerState::FirstSync;
        let Some(first) = self.sync_unless_cancelled(config, &cancel).await else {
            info!("scheduler cancelled during initial sync");
            self.shutdown().await;
            return Ok(());
        };
        let first = match first {
            Ok(result) => result,
            Err(e) => {
                self.shutdown().await;
                return Err(e);
            }
        };
        if config.dry_run || config.run_once {
            info!("single pass finished (dry_run={}, run_once={})", config.dry_run, config.run_once);
            self.shutdown().await;
            return Ok(());
        }
        if first.unwrap_or(0) == 0 {
            self.shutdown().await;
            return Err(SchedulerError::NoUsableForwards.into());
        }

        loop {
            self.state = SchedulerState::Idle;
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.sleeper.sleep(config.interval) => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            self.state = SchedulerState::Syncing;
            match self.sync_unless_cancelled(config, &cancel).await {
                None => break,
                Some(Ok(Some(count))) if count > 0 => {}
                Some(Ok(_)) => {
                    info!("no usable entries; keeping current glider process and config")
                }
                Some(Err(e)) => warn!("refresh failed, keeping current glider: {e:#}"),
            }
        }

        info!("scheduler cancelled");
        self.shutdown().await;
        Ok(())
    }

    /// [`sync_and_apply`](Self::sync_and_apply) raced against `cancel`.
    /// `None` means the token fired first and the pass was dropped.
    async fn sync_unless_cancelled(
        &mut self,
        config: &SchedulerConfig,
        cancel: &CancellationToken,
    ) -> Option<Result<Option<usize>>> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = self.sync_and_apply(config) => Some(result),
        }
    }

    /// One sync pass plus, when the forward set changed, config write and
    /// start-or-restart. Returns `None` when there were no URLs to sync.
    async fn sync_and_apply(&mut self, config: &SchedulerConfig) -> Result<Option<usize>> {
        let urls = match self.source.load() {
            Ok(urls) => urls,
            Err(e) => {
                warn!("failed to load subscriptions: {e:#}");
                Vec::new()
            }
        };
        if urls.is_empty() {
            info!("no subscriptions found; skipping update");
            return Ok(None);
        }

        let result = self.sync.sync(&urls).await;
        info!(
            "fetched subscriptions: ok={}, failed={}, entries={}",
            result.stats.ok_urls, result.stats.failed_urls, result.stats.entries
        );
        let count = result.forwards.len();
        let forwards = result.forwards.clone();
        self.last_result = Some(result);
        if forwards.is_empty() {
            return Ok(Some(0));
        }

        let hash = forward_hash(&forwards);
        if config.dry_run {
            info!("dry run: {count} entries, config not written");
            return Ok(Some(count));
        }
        if self.last_hash.as_deref() == Some(hash.as_str()) {
            info!("entries unchanged; no restart needed");
            return Ok(Some(count));
        }

        let glider = GliderConfig {
            listen: config.listen.clone(),
            healthcheck_url: config.healthcheck_url.clone(),
            healthcheck_enabled: false,
            forwards,
        };
        self.writer.write(&glider)?;
        if self.started {
            self.tunnel.restart(&glider).await?;
            info!("glider restarted with {count} entries");
        } else {
            self.tunnel.start(&glider).await?;
            self.started = true;
            info!("glider started with {count} entries");
        }
        self.last_hash = Some(hash);
        Ok(Some(count))
    }

    async fn shutdown(&mut self) {
        self.tunnel.stop().await;
        self.state = SchedulerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::fetcher::Fetcher;
    use crate::pool::model::FetchedContent;
    use crate::pool::source::StaticSubscriptionSource;
    use crate::pool::sync::PassThroughTester;
    use crate::pool::writer::FileConfigWriter;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves one scripted body per sync pass; the last body repeats.
    struct ScriptedFetcher {
        bodies: Mutex<VecDeque<&'static str>>,
        last: Mutex<&'static str>,
    }

    impl ScriptedFetcher {
        fn new(bodies: &[&'static str]) -> Self {
            Self {
                bodies: Mutex::new(bodies.iter().copied().collect()),
                last: Mutex::new(""),
            }
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedContent> {
            let body = match self.bodies.lock().pop_front() {
                Some(b) => {
                    *self.last.lock() = b;
                    b
                }
                None => *self.last.lock(),
            };
            if body == "ERROR" {
                anyhow::bail!("subscription returned HTTP 503");
            }
            Ok(FetchedContent::new(url, body, None))
        }
    }

    #[derive(Default)]
    struct Calls {
        start: AtomicUsize,
        restart: AtomicUsize,
        stop: AtomicUsize,
    }

    struct FakeTunnel {
        calls: Arc<Calls>,
        fail_restart: bool,
    }

    #[async_trait]
    impl TunnelProcess for FakeTunnel {
        async fn start(&mut self, _config: &GliderConfig) -> Result<()> {
            self.calls.start.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn restart(&mut self, _config: &GliderConfig) -> Result<()> {
            self.calls.restart.fetch_add(1, Ordering::SeqCst);
            if self.fail_restart {
                anyhow::bail!("glider exited during startup");
            }
            Ok(())
        }

        async fn stop(&mut self) {
            self.calls.stop.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Returns instantly and cancels the run after `limit` sleeps.
    struct CancelAfter {
        limit: usize,
        sleeps: AtomicUsize,
        token: CancellationToken,
    }

    #[async_trait]
    impl Sleeper for CancelAfter {
        async fn sleep(&self, _duration: Duration) {
            if self.sleeps.fetch_add(1, Ordering::SeqCst) + 1 > self.limit {
                self.token.cancel();
            }
        }
    }

    struct Harness {
        scheduler: Scheduler<FakeTunnel>,
        calls: Arc<Calls>,
        token: CancellationToken,
        config: SchedulerConfig,
        _dir: tempfile::TempDir,
    }

    /// `cycles` refresh passes run after the first sync before cancellation.
    fn harness(urls: &[&str], bodies: &[&'static str], cycles: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("glider.subscription.conf");
        let calls = Arc::new(Calls::default());
        let token = CancellationToken::new();
        let sync = SubscriptionSync::new(
            Arc::new(ScriptedFetcher::new(bodies)),
            Arc::new(PassThroughTester),
        );
        let scheduler = Scheduler::new(
            Arc::new(StaticSubscriptionSource::new(urls.iter().copied())),
            sync,
            FakeTunnel {
                calls: Arc::clone(&calls),
                fail_restart: false,
            },
            Arc::new(FileConfigWriter::new(&output)),
        )
        .with_sleeper(Arc::new(CancelAfter {
            limit: cycles,
            sleeps: AtomicUsize::new(0),
            token: token.clone(),
        }));
        let config = SchedulerConfig {
            subscriptions_file: PathBuf::from("subscriptions.txt"),
            listen: ":10710".into(),
            interval: Duration::from_secs(6000),
            healthcheck_url: "http://check#expect=200".into(),
            config_output: output,
            run_once: false,
            dry_run: false,
            tls_verify: false,
        };
        Harness {
            scheduler,
            calls,
            token,
            config,
            _dir: dir,
        }
    }

    fn count(c: &AtomicUsize) -> usize {
        c.load(Ordering::SeqCst)
    }

    const SET_A: &str = "ss://m:p@a:1\nss://m:p@b:2\n";
    const SET_B: &str = "ss://m:p@a:1\nss://m:p@c:3\n";

    #[tokio::test]
    async fn no_subscriptions_is_fatal() {
        let mut h = harness(&[], &[SET_A], 0);
        let err = h.scheduler.run(&h.config, h.token.clone()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchedulerError>(),
            Some(SchedulerError::NoSubscriptions { .. })
        ));
        assert_eq!(count(&h.calls.start), 0);
    }

    #[tokio::test]
    async fn empty_first_sync_is_fatal() {
        let mut h = harness(&["u1"], &["nothing here"], 0);
        let err = h.scheduler.run(&h.config, h.token.clone()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SchedulerError>(),
            Some(SchedulerError::NoUsableForwards)
        ));
        assert_eq!(count(&h.calls.start), 0);
        assert_eq!(count(&h.calls.stop), 1);
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn unchanged_set_never_restarts() {
        let mut h = harness(&["u1"], &[SET_A, SET_A, SET_A], 3);
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();
        assert_eq!(count(&h.calls.start), 1);
        assert_eq!(count(&h.calls.restart), 0);
        assert_eq!(count(&h.calls.stop), 1);
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
        let written = std::fs::read_to_string(&h.config.config_output).unwrap();
        assert!(written.contains("checkinterval=0\n"));
        assert!(written.ends_with("forward=ss://m:p@a:1\nforward=ss://m:p@b:2\n"));
    }

    #[tokio::test]
    async fn changed_set_restarts_exactly_once() {
        let mut h = harness(&["u1"], &[SET_A, SET_B, SET_B], 2);
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();
        assert_eq!(count(&h.calls.start), 1);
        assert_eq!(count(&h.calls.restart), 1);
        let written = std::fs::read_to_string(&h.config.config_output).unwrap();
        assert!(written.contains("forward=ss://m:p@c:3\n"));
        assert_eq!(
            h.scheduler.last_hash(),
            Some(forward_hash(&[
                ForwardNode::from_link("ss://m:p@a:1"),
                ForwardNode::from_link("ss://m:p@c:3"),
            ]).as_str())
        );
    }

    #[tokio::test]
    async fn empty_or_failed_refresh_keeps_tunnel() {
        let mut h = harness(&["u1"], &[SET_A, "ERROR", "junk", SET_A], 3);
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();
        assert_eq!(count(&h.calls.start), 1);
        assert_eq!(count(&h.calls.restart), 0);
        let written = std::fs::read_to_string(&h.config.config_output).unwrap();
        assert!(written.contains("forward=ss://m:p@b:2\n"));
    }

    #[tokio::test]
    async fn failed_restart_does_not_stop_the_loop() {
        let mut h = harness(&["u1"], &[SET_A, SET_B, SET_A], 2);
        h.scheduler.tunnel.fail_restart = true;
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();
        // A failed restart keeps the old hash, so going back to the first set is a no-op.
        assert_eq!(count(&h.calls.restart), 1);
        assert_eq!(count(&h.calls.stop), 1);
    }

    #[tokio::test]
    async fn dry_run_never_touches_tunnel_or_disk() {
        let mut h = harness(&["u1"], &[SET_A], 5);
        h.config.dry_run = true;
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();
        assert_eq!(count(&h.calls.start), 0);
        assert!(!h.config.config_output.exists());
        assert_eq!(h.scheduler.last_result().unwrap().forwards.len(), 2);
    }

    #[tokio::test]
    async fn dry_run_with_nothing_usable_still_succeeds() {
        let mut h = harness(&["u1"], &["junk"], 0);
        h.config.dry_run = true;
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn run_once_applies_then_stops() {
        let mut h = harness(&["u1"], &[SET_A], 5);
        h.config.run_once = true;
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();
        assert_eq!(count(&h.calls.start), 1);
        assert_eq!(count(&h.calls.stop), 1);
        assert!(h.config.config_output.exists());
    }

    #[tokio::test]
    async fn pre_cancelled_token_skips_first_sync() {
        let mut h = harness(&["u1"], &[SET_A], 5);
        h.token.cancel();
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();
        assert_eq!(count(&h.calls.start), 0);
        assert_eq!(count(&h.calls.stop), 1);
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    }

    /// Answers the first fetch at once and stalls every later one.
    struct StallAfterFirst {
        fetches: AtomicUsize,
        stall: Duration,
    }

    #[async_trait]
    impl Fetcher for StallAfterFirst {
        async fn fetch(&self, url: &str) -> Result<FetchedContent> {
            if self.fetches.fetch_add(1, Ordering::SeqCst) > 0 {
                tokio::time::sleep(self.stall).await;
            }
            Ok(FetchedContent::new(url, SET_A, None))
        }
    }

    /// Returns at once every time.
    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _duration: Duration) {}
    }

    #[tokio::test]
    async fn cancel_interrupts_in_flight_refresh() {
        let mut h = harness(&["u1"], &[], 0);
        let fetcher = Arc::new(StallAfterFirst {
            fetches: AtomicUsize::new(0),
            stall: Duration::from_secs(30),
        });
        h.scheduler.sync = SubscriptionSync::new(fetcher.clone(), Arc::new(PassThroughTester));
        h.scheduler.sleeper = Arc::new(NoSleep);

        let token = h.token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            token.cancel();
        });
        let started = std::time::Instant::now();
        h.scheduler.run(&h.config, h.token.clone()).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(count(&h.calls.start), 1);
        assert_eq!(count(&h.calls.stop), 1);
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn for_settings_reads_configured_paths() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(SET_A))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let subscriptions = dir.path().join("subs.txt");
        std::fs::write(&subscriptions, format!("# feeds\n{}/feed\n", server.uri())).unwrap();
        let settings = SchedulerConfig {
            subscriptions_file: subscriptions,
            listen: ":10710".into(),
            interval: Duration::from_secs(6000),
            healthcheck_url: String::new(),
            config_output: dir.path().join("live").join("glider.conf"),
            run_once: false,
            dry_run: true,
            tls_verify: true,
        };

        let mut scheduler = Scheduler::for_settings(
            &settings,
            "glider",
            Duration::from_secs(5),
            "proxypool-test",
            Arc::new(PassThroughTester),
        )
        .unwrap();
        assert_eq!(scheduler.tunnel().config_path(), settings.config_output.as_path());

        scheduler.run(&settings, CancellationToken::new()).await.unwrap();
        assert_eq!(scheduler.last_result().unwrap().forwards.len(), 2);
        assert!(!settings.config_output.exists());
    }

    #[test]
    fn hash_is_order_sensitive_and_stable() {
        let a = ForwardNode::from_link("ss://m:p@a:1");
        let b = ForwardNode::from_link("ss://m:p@b:2");
        let ab = forward_hash(&[a.clone(), b.clone()]);
        assert_eq!(ab, forward_hash(&[a.clone(), b.clone()]));
        assert_ne!(ab, forward_hash(&[b, a]));
        assert_eq!(ab.len(), 64);
    }
}
