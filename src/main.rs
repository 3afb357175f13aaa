use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use pricecast::api::CoinGeckoClient;
use pricecast::cache::{FileMirror, PredictionCache, PredictionMirror, RedisMirror};
use pricecast::collector::{run_collection_loop, Collector};
use pricecast::config::Settings;
use pricecast::db::{MemoryStore, ModelStore, PostgresStore, RangeStore};
use pricecast::serving::ServingFacade;
use pricecast::training::{LinearForecaster, Orchestrator};
use pricecast::{CollectionMode, CollectionStatus, StopSignal, TrainingMode};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

const STATUS_INTERVAL_MINUTES: u64 = 15;

#[derive(Parser)]
#[command(name = "pricecast")]
#[command(about = "Hourly crypto price collection, model training and prediction serving")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (defaults to $PRICECAST_CONFIG or pricecast.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run collection and training schedules until Ctrl+C
    Run,
    /// Collect missing observations once
    Collect {
        #[arg(long, value_enum, default_value = "gap-fill")]
        mode: ModeArg,
        /// Range start (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_time)]
        start: Option<DateTime<Utc>>,
        /// Range end, exclusive (RFC 3339 or YYYY-MM-DD)
        #[arg(long, value_parser = parse_time)]
        end: Option<DateTime<Utc>>,
        /// Comma-separated symbols (defaults to configured symbols)
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
    },
    /// Run one training cycle
    Train {
        #[arg(long, value_enum, default_value = "incremental")]
        mode: TrainArg,
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
    },
    /// Show predictions
    Predict {
        /// Single symbol to look up
        #[arg(long)]
        symbol: Option<String>,
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Regenerate instead of reading the cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Show system status
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Backward,
    Forward,
    GapFill,
}

impl From<ModeArg> for CollectionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Backward => CollectionMode::Backward,
            ModeArg::Forward => CollectionMode::Forward,
            ModeArg::GapFill => CollectionMode::GapFill,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TrainArg {
    Incremental,
    Full,
}

impl From<TrainArg> for TrainingMode {
    fn from(mode: TrainArg) -> Self {
        match mode {
            TrainArg::Incremental => TrainingMode::Incremental,
            TrainArg::Full => TrainingMode::Full,
        }
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("invalid time '{}', expected RFC 3339 or YYYY-MM-DD", value))
}

/// Everything a command needs, wired from settings
struct Pipeline {
    settings: Settings,
    observations: Arc<dyn RangeStore>,
    collector: Collector,
    orchestrator: Arc<Orchestrator>,
    cache: Arc<PredictionCache>,
    facade: ServingFacade,
    stop: StopSignal,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();

    let settings = match cli.config {
        Some(path) => Settings::load_from(Some(path)),
        None => Settings::load(),
    }
    .context("Failed to load configuration")?;

    let pipeline = build_pipeline(settings).await?;

    match cli.command {
        Commands::Run => run(pipeline).await,
        Commands::Collect {
            mode,
            start,
            end,
            symbols,
        } => collect(pipeline, mode.into(), start, end, symbols).await,
        Commands::Train { mode, symbols } => train(pipeline, mode.into(), symbols).await,
        Commands::Predict {
            symbol,
            limit,
            no_cache,
        } => predict(pipeline, symbol, limit, no_cache).await,
        Commands::Status => status(pipeline).await,
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pricecast=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn build_pipeline(settings: Settings) -> anyhow::Result<Pipeline> {
    let (observations, models) = connect_stores(settings.database_url.as_deref()).await;

    let mirror = connect_mirror(&settings).await;
    let cache = Arc::new(PredictionCache::new(Some(mirror)));
    match cache.warm_from_mirror().await {
        Ok(count) if count > 0 => tracing::info!("Restored {} cached predictions", count),
        Ok(_) => {}
        Err(e) => tracing::warn!("Could not warm prediction cache: {}", e),
    }

    let exchange = Arc::new(
        CoinGeckoClient::new(&settings.coingecko).context("Failed to build CoinGecko client")?,
    );
    let collector = Collector::new(observations.clone(), exchange, settings.collector.clone());

    let orchestrator = Arc::new(Orchestrator::new(
        observations.clone(),
        models.clone(),
        cache.clone(),
        Arc::new(LinearForecaster::from_settings(&settings.training)),
        settings.training.clone(),
        settings.cache.ttl(),
        settings.cache.extended_ttl(),
    ));

    let stop = StopSignal::new();
    let facade = ServingFacade::new(
        settings.symbols.clone(),
        collector.clone(),
        orchestrator.clone(),
        cache.clone(),
        observations.clone(),
        models,
        &settings.cache,
        stop.clone(),
    );

    Ok(Pipeline {
        settings,
        observations,
        collector,
        orchestrator,
        cache,
        facade,
        stop,
    })
}

async fn connect_stores(database_url: Option<&str>) -> (Arc<dyn RangeStore>, Arc<dyn ModelStore>) {
    if let Some(url) = database_url {
        match PostgresStore::new(url).await {
            Ok(store) => {
                tracing::info!("Postgres persistence enabled");
                let store = Arc::new(store);
                return (store.clone(), store);
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to connect to Postgres ({}), continuing with in-memory storage",
                    e
                );
            }
        }
    } else {
        tracing::warn!("No database_url configured, using in-memory storage");
    }

    let store = Arc::new(MemoryStore::new());
    (store.clone(), store)
}

async fn connect_mirror(settings: &Settings) -> Arc<dyn PredictionMirror> {
    if let Some(url) = &settings.redis_url {
        match RedisMirror::new(url).await {
            Ok(mirror) => return Arc::new(mirror),
            Err(e) => tracing::warn!(
                "Failed to connect to Redis ({}), mirroring predictions to {}",
                e,
                settings.cache.mirror_path.display()
            ),
        }
    }

    Arc::new(FileMirror::new(settings.cache.mirror_path.clone()))
}

fn resolve_symbols(requested: Vec<String>, configured: &[String]) -> Vec<String> {
    let requested: Vec<String> = requested
        .into_iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    if requested.is_empty() {
        configured.to_vec()
    } else {
        requested
    }
}

/// Raise `stop` on the first Ctrl+C
fn stop_on_ctrl_c(stop: StopSignal) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("⚠️  Received Ctrl+C, finishing current work...");
            stop.stop();
        }
    });
}

// ============================================================================
// Commands
// ============================================================================

async fn run(pipeline: Pipeline) -> anyhow::Result<()> {
    let Pipeline {
        settings,
        observations: _,
        collector,
        orchestrator,
        cache,
        facade,
        stop,
    } = pipeline;

    tracing::info!("🚀 pricecast starting");
    tracing::info!("  Symbols: {}", settings.symbols.join(", "));
    tracing::info!("  Collection: every {}h", settings.collector.interval_hours);
    tracing::info!(
        "  Training: incremental every {}m, full every {}h",
        settings.training.incremental_interval_minutes,
        settings.training.full_interval_hours
    );

    let collection_task = tokio::spawn(run_collection_loop(
        collector,
        facade.run_state(),
        settings.symbols.clone(),
        settings.collector.interval(),
        stop.clone(),
    ));

    let training_task = tokio::spawn(orchestrator.run_schedule(settings.symbols.clone(), stop.clone()));

    let status_task = {
        let facade = facade.clone();
        let stop = stop.clone();
        tokio::spawn(async move { status_loop(facade, cache, stop).await })
    };

    tracing::info!("Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        }
        _ = stop.stopped() => {}
    }

    facade.stop();
    for (name, task) in [
        ("collection", collection_task),
        ("training", training_task),
        ("status", status_task),
    ] {
        if let Err(e) = task.await {
            tracing::error!("{} loop exited abnormally: {}", name, e);
        }
    }

    tracing::info!("👋 pricecast stopped");
    Ok(())
}

/// Periodic status line and cache housekeeping
async fn status_loop(facade: ServingFacade, cache: Arc<PredictionCache>, stop: StopSignal) {
    let period = Duration::from_secs(STATUS_INTERVAL_MINUTES * 60);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = ticker.tick() => {}
        }

        cache.purge_expired();

        match facade.system_info().await {
            Ok(info) => tracing::info!(
                "📊 {} symbols, {} observations (latest {}), {} models, {} cached predictions",
                info.symbols_tracked,
                info.total_observations,
                info.last_observation_timestamp
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "none".to_string()),
                info.models_current,
                info.cache_entry_count
            ),
            Err(e) => tracing::warn!("Status check failed: {}", e),
        }
    }
}

async fn collect(
    pipeline: Pipeline,
    mode: CollectionMode,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    symbols: Vec<String>,
) -> anyhow::Result<()> {
    let symbols = resolve_symbols(symbols, &pipeline.settings.symbols);
    stop_on_ctrl_c(pipeline.stop.clone());

    let summary = pipeline
        .collector
        .collect(&symbols, mode, start, end, &pipeline.stop)
        .await
        .context("Collection aborted")?;

    println!("Collection {} ({})", summary.run_id, summary.mode);
    for result in &summary.results {
        println!(
            "  {:<8} {:<9} {:>7} records  {:>3} retries  {:>6.1}s",
            result.symbol,
            format!("{:?}", result.status).to_lowercase(),
            result.records_collected,
            result.retry_count,
            result.duration.as_secs_f64()
        );
        for range in &result.failed_ranges {
            println!("           failed {} -> {}", range.start, range.end);
        }
    }
    println!(
        "Total: {} records, {} complete, {} partial, {} failed, {} skipped{}",
        summary.total_records(),
        summary.count_status(CollectionStatus::Complete),
        summary.count_status(CollectionStatus::Partial),
        summary.count_status(CollectionStatus::Failed),
        summary.count_status(CollectionStatus::Skipped),
        if summary.cancelled { " (stopped early)" } else { "" }
    );

    Ok(())
}

async fn train(pipeline: Pipeline, mode: TrainingMode, symbols: Vec<String>) -> anyhow::Result<()> {
    let symbols = resolve_symbols(symbols, &pipeline.settings.symbols);
    stop_on_ctrl_c(pipeline.stop.clone());

    let summary = pipeline
        .orchestrator
        .run_cycle(&symbols, mode, &pipeline.stop)
        .await
        .context("Training cycle aborted")?;

    println!(
        "{} training: {} trained, {} skipped, {} failed in {:.1}s{}",
        summary.mode.as_str(),
        summary.trained,
        summary.skipped,
        summary.failed,
        summary.duration.as_secs_f64(),
        if summary.cancelled { " (stopped early)" } else { "" }
    );

    Ok(())
}

async fn predict(
    pipeline: Pipeline,
    symbol: Option<String>,
    limit: usize,
    no_cache: bool,
) -> anyhow::Result<()> {
    let views = match symbol {
        Some(symbol) => match pipeline.facade.get_prediction(&symbol).await {
            Some(view) => vec![view],
            None => {
                println!("No prediction available for {}", symbol.to_uppercase());
                return Ok(());
            }
        },
        None => pipeline.facade.get_predictions(limit, !no_cache).await,
    };

    if views.is_empty() {
        println!("No predictions available. Train models first.");
        return Ok(());
    }

    println!("{:<8} {:>14} {:>10}  {}", "SYMBOL", "PREDICTED", "CONF", "GENERATED");
    for view in views {
        println!(
            "{:<8} {:>14.4} {:>9.1}%  {}",
            view.symbol,
            view.predicted_value,
            view.confidence * 100.0,
            view.generated_at.to_rfc3339()
        );
    }

    Ok(())
}

async fn status(pipeline: Pipeline) -> anyhow::Result<()> {
    let info = pipeline.facade.system_info().await?;
    let collection = pipeline.facade.collection_status();

    println!("Symbols tracked:     {}", info.symbols_tracked);
    println!("Observations:        {}", info.total_observations);
    println!(
        "Latest observation:  {}",
        info.last_observation_timestamp
            .map(|ts| ts.to_rfc3339())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("Current models:      {}", info.models_current);
    println!("Cached predictions:  {}", info.cache_entry_count);
    println!("Collection running:  {}", collection.is_running);

    for symbol in &pipeline.settings.symbols {
        let latest = pipeline.observations.last_timestamp(symbol).await?;
        println!(
            "  {:<8} last observation {}",
            symbol,
            latest
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "none".to_string())
        );
    }

    Ok(())
}
