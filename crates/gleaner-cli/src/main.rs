//! gleaner - ingestion worker の起動口
//!
//! - `run`: worker / reaper / freshness scheduler を常駐させる
//! - `demo`: 同じ募集を 2 経路から取り込み、1 件の posting に畳まれる様子を見せる
//! - `check-policy`: trust policy ファイルの検証

mod executors;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use gleaner_core::app::{FreshnessLoop, ReaperLoop, StatusReport, WorkerLoop};
use gleaner_core::config::{CONFIG_FILE_NAME, ENV_CONFIG_PATH};
use gleaner_core::domain::{Actor, TrustPolicy};
use gleaner_core::ports::SystemClock;
use gleaner_core::{DiscoveryIntake, GleanerConfig, Pipeline};

#[derive(Parser)]
#[command(name = "gleaner", about = "Volunteer-opportunity ingestion worker")]
struct Cli {
    /// Path to gleaner.toml.
    #[arg(long, env = ENV_CONFIG_PATH)]
    config: Option<PathBuf>,

    /// -v for debug, -vv for trace. RUST_LOG wins when set.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers, the lease reaper and the freshness scheduler.
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Ingest a couple of sample discoveries on startup.
        #[arg(long)]
        seed: bool,
    },
    /// Ingest one opportunity from two sources and print the merged posting.
    Demo,
    /// Validate a trust policy file (.json or .toml).
    CheckPolicy { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Run {
            duration_secs,
            seed,
        } => run(config, duration_secs.map(Duration::from_secs), seed).await,
        Command::Demo => demo(config).await,
        Command::CheckPolicy { file } => check_policy(&file),
    }
}

fn init_tracing(verbose: u8, format: LogFormat) {
    let default_level = match verbose {
        0 => "gleaner=info,gleaner_core=info",
        1 => "gleaner=debug,gleaner_core=debug",
        _ => "gleaner=trace,gleaner_core=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// `--config` (or `GLEANER_CONFIG`) must exist; the implicit `gleaner.toml`
/// may be missing.
fn load_config(path: Option<&Path>) -> anyhow::Result<GleanerConfig> {
    let config = match path {
        Some(path) => {
            if !path.exists() {
                bail!("config file {} does not exist", path.display());
            }
            GleanerConfig::load(path)
        }
        None => GleanerConfig::load(Path::new(CONFIG_FILE_NAME)),
    };
    config.context("failed to load configuration")
}

async fn run(config: GleanerConfig, duration: Option<Duration>, seed: bool) -> anyhow::Result<()> {
    let pipeline = Pipeline::in_memory(&config, Arc::new(SystemClock));
    let workers = executors::offline_workers()?;

    if seed {
        for intake in sample_intakes() {
            let (discovery, job) = pipeline.ingest_discovery(&Actor::System, intake)?;
            tracing::info!(discovery_id = %discovery.id, job_id = %job.id, "seeded discovery");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let group = workers.spawn(pipeline.clone(), &config.worker);
    let reaper = ReaperLoop::new(
        pipeline.clone(),
        Duration::from_secs(config.scheduler.reap_interval_secs),
    )
    .spawn(shutdown_rx.clone());
    let freshness = FreshnessLoop::new(
        pipeline.clone(),
        Duration::from_secs(config.scheduler.freshness_interval_secs),
        Duration::from_secs(config.scheduler.freshness_max_age_secs),
    )?
    .spawn(shutdown_rx);

    tracing::info!(workers = config.worker.workers, "gleaner running");
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
        }
    }

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    group.shutdown_and_join().await;
    for handle in [reaper, freshness] {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "scheduler task panicked");
        }
    }

    let report = StatusReport::collect(&pipeline, workers.registry())?;
    println!("{report}");
    if report.needs_attention() {
        tracing::warn!(dead_letter = report.counts.dead_letter, "dead-lettered jobs need a human");
    }
    Ok(())
}

async fn demo(config: GleanerConfig) -> anyhow::Result<()> {
    let pipeline = Pipeline::in_memory(&config, Arc::new(SystemClock));
    let workers = executors::offline_workers()?;
    let admin = Actor::admin("demo");

    pipeline.put_trust_policy(&admin, &TrustPolicy::trusted("rss:city-volunteers"))?;

    let mut discoveries = Vec::new();
    for intake in sample_intakes() {
        let (discovery, _) = pipeline.ingest_discovery(&Actor::System, intake)?;
        discoveries.push(discovery.id);
    }

    let worker = WorkerLoop::new(
        "demo",
        pipeline.clone(),
        Arc::clone(workers.registry()),
        &config.worker,
    );
    loop {
        let settled = worker.run_once().await?;
        tracing::debug!(settled, "demo poll");
        if settled == 0 {
            break;
        }
    }

    let first = discoveries
        .first()
        .copied()
        .context("demo ingested no discoveries")?;
    let candidate = pipeline
        .candidate_for_discovery(first)?
        .context("first discovery was never extracted")?;
    let posting = pipeline
        .posting_for_candidate(candidate)?
        .context("demo candidate was not published")?;
    let linked = pipeline.discoveries_for_posting(posting.id)?;

    println!("{}", serde_json::to_string_pretty(&posting)?);
    println!("linked discoveries: {}", linked.len());
    for discovery in &linked {
        println!("  {} {} {}", discovery.id, discovery.source_key, discovery.normalized_url);
    }
    println!("{}", StatusReport::collect(&pipeline, workers.registry())?);
    Ok(())
}

fn check_policy(file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let is_json = file.extension().is_some_and(|ext| ext == "json");
    let policy = if is_json {
        TrustPolicy::from_json(&raw)
    } else {
        TrustPolicy::from_toml(&raw)
    }
    .with_context(|| format!("{} is not a valid trust policy", file.display()))?;
    tracing::info!(source_key = %policy.source_key, "trust policy is valid");
    println!("{}", serde_json::to_string_pretty(&policy)?);
    Ok(())
}

/// One opportunity seen twice by the city feed under different URLs.
fn sample_intakes() -> Vec<DiscoveryIntake> {
    vec![
        DiscoveryIntake::new(
            "rss:city-volunteers",
            "https://www.foodshelf.org/volunteer/meal-delivery-driver",
            "sha256:meal-delivery-driver",
        ),
        DiscoveryIntake::new(
            "rss:city-volunteers",
            "http://foodshelf.org/opportunities/meal-delivery?utm_source=newsletter",
            "sha256:meal-delivery-driver",
        ),
    ]
}
