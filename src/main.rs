//! `proxypool` command-line entry point.
//!
//! ```bash
//! proxypool run                 # keep the live glider in step with the subscriptions
//! proxypool refresh             # collect, store, evaluate, publish once
//! proxypool list --min-score 40 --json
//! proxypool rotate --token client-a
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use proxypool::config::Config;
use proxypool::pool::{
    import_config, list_proxies, FileConfigWriter, FileSubscriptionSource, ForwardProbe,
    ForwardTester, GliderConfigPublisher, GliderForwardTester, GliderProbe,
    HealthEngine, HttpFetcher, PassThroughTester, PoolOrchestrator, Proxy, RotationSelector, Scheduler,
    SqliteTokenCounter, StoreFactory, SubscriptionSync,
};

const GLIDER_MISSING: &str =
    "glider binary not found; set GLIDER_BIN or [glider].binary in the config";

#[derive(Parser, Debug)]
#[command(name = "proxypool", version, about = "Subscription-fed ss/vmess proxy pool")]
struct Cli {
    /// Config file (default: ~/.proxypool/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the subscription scheduler and supervise the live glider
    Run {
        /// Apply the first sync, then exit
        #[arg(long)]
        once: bool,
        /// Sync and report without writing a config or starting glider
        #[arg(long)]
        dry_run: bool,
    },
    /// Collect subscriptions into the pool, evaluate and publish
    Refresh,
    /// Re-evaluate the stored pool and republish
    Maintain,
    /// Show stored proxies, best first
    List {
        #[arg(long, default_value_t = 0.0)]
        min_score: f64,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Pick the current proxy for a caller token
    Rotate {
        #[arg(long)]
        token: String,
        #[arg(long)]
        rotate_every: Option<i64>,
        #[arg(long)]
        min_score: Option<f64>,
    },
    /// Upsert the forward lines of an existing glider config into the pool
    Import {
        /// Path to a glider.conf
        path: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { once, dry_run } => run(&config, once, dry_run).await,
        Command::Refresh => {
            let result = orchestrator(&config)?.refresh_pool().await?;
            println!(
                "collected={} stored={} published={}",
                result.collected, result.stored, result.published
            );
            Ok(())
        }
        Command::Maintain => {
            let evaluated = orchestrator(&config)?.perform_maintenance().await?;
            println!("evaluated={evaluated}");
            Ok(())
        }
        Command::List {
            min_score,
            limit,
            json,
        } => {
            let proxies = list_proxies(&stores(&config), min_score, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&proxies)?);
            } else {
                print_table(&proxies);
            }
            Ok(())
        }
        Command::Rotate {
            token,
            rotate_every,
            min_score,
        } => {
            let rotate_every = rotate_every.unwrap_or(config.rotation.rotate_every);
            let min_score = min_score.unwrap_or(config.rotation.min_score);
            let stores = stores(&config);
            let counter = SqliteTokenCounter::new(stores.clone(), config.counter_ttl());
            let selector =
                RotationSelector::new(stores, Arc::new(counter), config.rotation.candidate_limit);
            let picked = tokio::task::spawn_blocking(move || {
                selector.rotated_proxy(&token, rotate_every, min_score)
            })
            .await
            .context("rotation task panicked")??;
            match picked {
                Some(proxy) => {
                    println!("{}", serde_json::to_string_pretty(&proxy)?);
                    Ok(())
                }
                None => bail!("no proxies available"),
            }
        }
        Command::Import { path } => {
            let stored = import_config(&stores(&config), &path).await?;
            println!("imported={stored}");
            Ok(())
        }
    }
}

// ── Wiring ──────────────────────────────────────────────────────

fn stores(config: &Config) -> StoreFactory {
    StoreFactory::new(config.db_path())
}

fn subscription_sync(config: &Config, tester: Arc<dyn ForwardTester>) -> Result<SubscriptionSync> {
    let fetcher = HttpFetcher::new(
        config.fetch_timeout(),
        config.fetch.tls_verify,
        &config.fetch.user_agent,
    )?;
    Ok(SubscriptionSync::new(Arc::new(fetcher), tester))
}

fn orchestrator(config: &Config) -> Result<PoolOrchestrator> {
    let stores = stores(config);
    let probe: Option<Arc<dyn ForwardProbe>> = match config.glider_binary() {
        Some(binary) => Some(Arc::new(GliderProbe::new(config.health_probe_settings(binary))?)),
        None => None,
    };
    let health = HealthEngine::new(
        stores.clone(),
        probe,
        config.health.workers,
        config.health.limit,
    );
    let writer = FileConfigWriter::new(config.published_config_path());
    let publisher = GliderConfigPublisher::new(Arc::new(writer), config.publisher.listen.clone())
        .with_threshold(config.publisher.score_threshold)
        .with_max_publish(config.publisher.max_publish)
        .with_healthcheck(
            config.publisher.healthcheck_enabled,
            config.publisher.healthcheck_url.clone(),
        );
    // Collection only parses; probing happens in the health pass.
    let sync = subscription_sync(config, Arc::new(PassThroughTester))?;
    let source = FileSubscriptionSource::new(config.subscriptions_file());
    Ok(PoolOrchestrator::new(
        Arc::new(source),
        sync,
        stores,
        health,
        publisher,
    ))
}

async fn run(config: &Config, once: bool, dry_run: bool) -> Result<()> {
    let binary = config.glider_binary();
    let tester: Arc<dyn ForwardTester> = if config.scheduler.test_each_forward {
        let binary = binary.clone().context(GLIDER_MISSING)?;
        Arc::new(GliderForwardTester::new(GliderProbe::new(
            config.sync_probe_settings(binary),
        )?))
    } else {
        Arc::new(PassThroughTester)
    };
    let binary = match binary {
        Some(binary) => binary,
        None if dry_run => PathBuf::from("glider"),
        None => bail!(GLIDER_MISSING),
    };

    let settings = config.scheduler_config(once, dry_run);
    let mut scheduler = Scheduler::for_settings(
        &settings,
        binary,
        config.fetch_timeout(),
        &config.fetch.user_agent,
        tester,
    )?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    info!(
        "scheduler starting: subscriptions={}, listen={}, interval={}s",
        settings.subscriptions_file.display(),
        settings.listen,
        settings.interval.as_secs()
    );
    scheduler.run(&settings, cancel).await
}

/// Cancel on SIGINT, or SIGTERM on Unix.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    cancel.cancel();
}

fn print_table(proxies: &[Proxy]) {
    if proxies.is_empty() {
        println!("no proxies stored");
        return;
    }
    println!(
        "{:>5}  {:<7}  {:>6}  {:>9}  {:>5}  {:>5}  {:<6}  {}",
        "id", "status", "score", "latency", "ok", "fail", "scheme", "endpoint"
    );
    for p in proxies {
        let latency = if p.avg_latency_ms < 0.0 {
            "-".to_string()
        } else {
            format!("{:.0}ms", p.avg_latency_ms)
        };
        println!(
            "{:>5}  {:<7}  {:>6.1}  {:>9}  {:>5}  {:>5}  {:<6}  {}:{}{}",
            p.id.map_or_else(|| "-".to_string(), |id| id.to_string()),
            p.status.as_str(),
            p.score,
            latency,
            p.success_count,
            p.fail_count,
            p.scheme,
            p.host,
            p.port,
            p.label
                .as_deref()
                .map(|l| format!("  #{l}"))
                .unwrap_or_default()
        );
    }
}
