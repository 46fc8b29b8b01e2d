#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use taskweave::cache::{SqliteResultStore, TieredCache, TieredCacheConfig};
use taskweave::gateway::{ChatGateway, ProviderGateway, StderrUsageSink};
use taskweave::orchestrator::{Orchestrator, OrchestratorConfig};
use taskweave::quota::NoopQuotaGate;
use taskweave::ratelimit::{RateLimitConfig, RateLimiter, SqliteCoordinationStore};
use taskweave::verify::SyntaxValidator;

#[derive(Parser)]
#[command(name = "taskweave", version, about = "Taskweave orchestration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one request through the full pipeline
    Run {
        /// The request text
        request: String,
        /// Directory to write merged artifacts into
        #[arg(long, default_value = "out")]
        out: PathBuf,
        /// Decomposition model
        #[arg(long)]
        model: Option<String>,
        /// Worker model
        #[arg(long)]
        worker_model: Option<String>,
        /// Skip the cache lookup
        #[arg(long)]
        no_cache: bool,
    },
    /// Prune the durable result cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long, default_value_t = 30)]
        max_age_days: i64,
        #[arg(long, default_value_t = 10_000)]
        max_rows: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            request,
            out,
            model,
            worker_model,
            no_cache,
        } => run(request, out, model, worker_model, no_cache).await,
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => cache_prune(db, max_age_days, max_rows).await,
    }
}

async fn run(
    request: String,
    out: PathBuf,
    model: Option<String>,
    worker_model: Option<String>,
    no_cache: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let gateway: Arc<dyn ChatGateway> =
        Arc::new(ProviderGateway::from_env(Arc::new(StderrUsageSink))?);

    let store = Arc::new(SqliteCoordinationStore::new(
        SqliteCoordinationStore::default_path(),
    )?);
    let limiter = Arc::new(RateLimiter::new(store, RateLimitConfig::default()));

    let durable = Arc::new(SqliteResultStore::new(SqliteResultStore::default_path())?);
    let embed_gateway = if no_cache { None } else { Some(gateway.clone()) };
    let mut cache_config = TieredCacheConfig::default();
    if no_cache {
        // Thresholds above 1.0 make every tier miss while writes still land.
        cache_config.durable_threshold = 2.0;
        cache_config.fast_threshold = 2.0;
        cache_config.semantic_threshold = 2.0;
    }
    let cache = Arc::new(TieredCache::new(durable, embed_gateway, cache_config));

    let mut config = OrchestratorConfig::default();
    if let Some(model) = model {
        config.decompose_model = model;
    }
    if let Some(worker) = worker_model {
        config.executor.model = worker.clone();
        config.verify.model = worker.clone();
        config.merge.model = worker;
    }

    let orchestrator = Orchestrator::new(
        gateway,
        limiter,
        cache,
        Arc::new(NoopQuotaGate),
        Arc::new(SyntaxValidator),
        config,
    );

    let progress = |percent: u8, message: &str| {
        eprintln!("[run] {percent:>3}% {message}");
    };
    let outcome = orchestrator.run(&request, None, Some(&progress)).await?;

    std::fs::create_dir_all(&out)?;
    for (path, content) in &outcome.artifacts {
        // Keep writes inside the output directory.
        if path.split('/').any(|c| c == ".." || c.is_empty()) || path.starts_with('/') {
            tracing::warn!(path = %path, "skipping artifact with unsafe path");
            continue;
        }
        let target = out.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&target, content)?;
    }

    eprintln!(
        "[run] {} artifact(s), {} conflict(s), verified={}, from_cache={}, cost=${:.4}",
        outcome.artifacts.len(),
        outcome.conflicts.len(),
        outcome.verified,
        outcome.from_cache,
        outcome.cost_nanodollars as f64 / 1e9,
    );
    println!("{}", outcome.summary);
    Ok(())
}

async fn cache_prune(
    db: Option<PathBuf>,
    max_age_days: i64,
    max_rows: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = db.unwrap_or_else(SqliteResultStore::default_path);
    let store = SqliteResultStore::new(&path)?;
    let _lock = store.lock_exclusive()?;
    let stats = store.prune(max_age_days, max_rows).await?;
    println!(
        "pruned {} entries, {} remaining ({})",
        stats.deleted,
        stats.remaining,
        path.display()
    );
    Ok(())
}
