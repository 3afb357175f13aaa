pub mod features;
pub mod model;

pub use model::{Forecaster, LinearForecaster, LinearWeights};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::{interval_at, MissedTickBehavior};
use uuid::Uuid;

use crate::cache::PredictionCache;
use crate::config::TrainingSettings;
use crate::db::{ModelStore, RangeStore};
use crate::models::{floor_hour, Forecast, ModelArtifact, Observation, TrainingMode};
use crate::stop::StopSignal;
use crate::{Error, Result};

/// Outcome of one training cycle
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    pub mode: TrainingMode,
    pub trained: usize,
    pub skipped: usize,
    pub failed: usize,
    pub duration: Duration,
    pub cancelled: bool,
}

/// Claim on a symbol for the duration of one training pass
///
/// Released on drop, including when the pass errors out.
pub struct InFlight {
    symbols: Arc<Mutex<HashSet<String>>>,
    symbol: String,
}

impl InFlight {
    /// Claim `symbol`, or `None` when a pass for it is already running
    pub fn claim(symbols: &Arc<Mutex<HashSet<String>>>, symbol: &str) -> Option<Self> {
        if !symbols.lock().insert(symbol.to_string()) {
            return None;
        }
        Some(Self {
            symbols: Arc::clone(symbols),
            symbol: symbol.to_string(),
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.symbols.lock().remove(&self.symbol);
    }
}

/// Marks a full retrain as active while held
struct FullRetrain<'a>(&'a AtomicUsize);

impl<'a> FullRetrain<'a> {
    fn begin(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for FullRetrain<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Data and starting point for one symbol's fit
struct TrainingJob {
    symbol: String,
    mode: TrainingMode,
    prior: Option<Arc<ModelArtifact>>,
    observations: Vec<Observation>,
    /// Leading observations that only supply feature history
    history: usize,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    epochs: usize,
    _claim: InFlight,
}

enum Prepared {
    Job(TrainingJob),
    Skip(&'static str),
}

/// Two-tier training scheduler
///
/// Incremental passes run on a short period and full retrains on a long one.
/// Symbols go through in batches; fits run on the blocking pool so serving
/// is never starved.
pub struct Orchestrator {
    observations: Arc<dyn RangeStore>,
    models: Arc<dyn ModelStore>,
    cache: Arc<PredictionCache>,
    forecaster: Arc<dyn Forecaster>,
    settings: TrainingSettings,
    ttl: Duration,
    extended_ttl: Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
    full_active: AtomicUsize,
    last_summary: Mutex<Option<TrainingSummary>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        observations: Arc<dyn RangeStore>,
        models: Arc<dyn ModelStore>,
        cache: Arc<PredictionCache>,
        forecaster: Arc<dyn Forecaster>,
        settings: TrainingSettings,
        ttl: Duration,
        extended_ttl: Duration,
    ) -> Self {
        Self {
            observations,
            models,
            cache,
            forecaster,
            settings,
            ttl,
            extended_ttl,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            full_active: AtomicUsize::new(0),
            last_summary: Mutex::new(None),
        }
    }

    /// TTL for predictions pushed right now
    ///
    /// Extended while a full retrain is running, since the next refresh is
    /// further away.
    pub fn current_ttl(&self) -> Duration {
        if self.full_retrain_active() {
            self.extended_ttl
        } else {
            self.ttl
        }
    }

    pub fn full_retrain_active(&self) -> bool {
        self.full_active.load(Ordering::Acquire) > 0
    }

    pub fn is_training(&self, symbol: &str) -> bool {
        self.in_flight.lock().contains(symbol)
    }

    pub fn last_summary(&self) -> Option<TrainingSummary> {
        self.last_summary.lock().clone()
    }

    /// Run one training cycle over `symbols`
    ///
    /// Training errors are logged and counted per symbol; the previous
    /// artifact stays current. Store errors abort the cycle.
    pub async fn run_cycle(
        &self,
        symbols: &[String],
        mode: TrainingMode,
        stop: &StopSignal,
    ) -> Result<TrainingSummary> {
        let timer = Instant::now();
        let _full = (mode == TrainingMode::Full).then(|| FullRetrain::begin(&self.full_active));

        tracing::info!(
            "🧠 Starting {} training cycle for {} symbols (batch size {})",
            mode.as_str(),
            symbols.len(),
            self.settings.batch_size
        );

        let mut summary = TrainingSummary {
            mode,
            trained: 0,
            skipped: 0,
            failed: 0,
            duration: Duration::ZERO,
            cancelled: false,
        };

        for batch in symbols.chunks(self.settings.batch_size.max(1)) {
            if stop.is_stopped() {
                tracing::info!("Stop requested, ending training cycle early");
                summary.cancelled = true;
                break;
            }

            self.run_batch(batch, mode, &mut summary).await?;
            self.refresh_predictions(batch).await?;
        }

        summary.duration = timer.elapsed();
        tracing::info!(
            "✓ {} training cycle done in {:.1}s: {} trained, {} skipped, {} failed{}",
            mode.as_str(),
            summary.duration.as_secs_f64(),
            summary.trained,
            summary.skipped,
            summary.failed,
            if summary.cancelled { " (stopped early)" } else { "" }
        );

        *self.last_summary.lock() = Some(summary.clone());
        Ok(summary)
    }

    async fn run_batch(
        &self,
        batch: &[String],
        mode: TrainingMode,
        summary: &mut TrainingSummary,
    ) -> Result<()> {
        let mut jobs = Vec::with_capacity(batch.len());

        for symbol in batch {
            let Some(claim) = InFlight::claim(&self.in_flight, symbol) else {
                tracing::info!(symbol = %symbol, "Already training, dropping {} trigger", mode.as_str());
                summary.skipped += 1;
                continue;
            };

            match self.prepare(symbol, mode, claim).await? {
                Prepared::Job(job) => jobs.push(job),
                Prepared::Skip(reason) => {
                    tracing::debug!(symbol = %symbol, "Skipping training: {}", reason);
                    summary.skipped += 1;
                }
            }
        }

        let mut tasks = JoinSet::new();
        for job in jobs {
            let forecaster = Arc::clone(&self.forecaster);
            tasks.spawn_blocking(move || {
                let prior = job.prior.as_ref().map(|a| a.weights.as_slice());
                let fitted = forecaster.fit(prior, &job.observations, job.history, job.epochs);
                (job, fitted)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (job, fitted) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!("Training task failed: {}", e);
                    summary.failed += 1;
                    continue;
                }
            };

            let weights = match fitted {
                Ok(weights) => weights,
                Err(e) => {
                    tracing::warn!(
                        symbol = %job.symbol,
                        "✗ {} training failed, keeping previous model: {}",
                        job.mode.as_str(),
                        e
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            let artifact = self
                .models
                .put(ModelArtifact {
                    id: Uuid::new_v4(),
                    symbol: job.symbol.clone(),
                    version_timestamp: Utc::now(),
                    weights,
                    training_window_start: job.window_start,
                    training_window_end: job.window_end,
                    training_mode: job.mode,
                })
                .await?;

            tracing::info!(
                symbol = %job.symbol,
                "✓ {} model v{} on {} observations ({} -> {})",
                job.mode.as_str(),
                artifact.id,
                job.observations.len() - job.history,
                artifact.training_window_start,
                artifact.training_window_end
            );
            summary.trained += 1;
        }

        Ok(())
    }

    /// Load what one symbol's pass needs
    async fn prepare(&self, symbol: &str, mode: TrainingMode, claim: InFlight) -> Result<Prepared> {
        let prior = self.models.current(symbol).await?;
        let horizon = floor_hour(Utc::now()) + ChronoDuration::hours(1);

        let incremental_prior = match (mode, prior) {
            (TrainingMode::Incremental, Some(prior)) => Some(prior),
            (TrainingMode::Incremental, None) => {
                tracing::info!(symbol = %symbol, "No model yet, running full training instead");
                None
            }
            (TrainingMode::Full, _) => None,
        };

        let job = match incremental_prior {
            Some(prior) => {
                let since = prior.training_window_end;
                let observations = self
                    .observations
                    .load_observations(symbol, since - self.settings.context(), horizon)
                    .await?;

                let Some(last) = observations.last().filter(|o| o.timestamp >= since) else {
                    return Ok(Prepared::Skip("no new observations"));
                };
                let window_end = last.timestamp + ChronoDuration::hours(1);
                let history = observations.partition_point(|o| o.timestamp < since);

                TrainingJob {
                    symbol: symbol.to_string(),
                    mode: TrainingMode::Incremental,
                    window_start: prior.training_window_start,
                    window_end,
                    prior: Some(prior),
                    observations,
                    history,
                    epochs: self.settings.incremental_epochs,
                    _claim: claim,
                }
            }
            None => {
                let observations = self
                    .observations
                    .load_observations(symbol, horizon - self.settings.full_lookback(), horizon)
                    .await?;

                let (Some(first), Some(last)) = (observations.first(), observations.last()) else {
                    return Ok(Prepared::Skip("no observations"));
                };
                let (window_start, window_end) =
                    (first.timestamp, last.timestamp + ChronoDuration::hours(1));

                TrainingJob {
                    symbol: symbol.to_string(),
                    mode: TrainingMode::Full,
                    prior: None,
                    observations,
                    history: 0,
                    window_start,
                    window_end,
                    epochs: self.settings.full_epochs,
                    _claim: claim,
                }
            }
        };

        Ok(Prepared::Job(job))
    }

    /// Forecast the next hour for `symbol` from its current model
    ///
    /// `Ok(None)` when the symbol has no model yet.
    pub async fn predict_symbol(&self, symbol: &str) -> Result<Option<Forecast>> {
        let Some(artifact) = self.models.current(symbol).await? else {
            return Ok(None);
        };

        let recent = self
            .observations
            .latest_observations(symbol, self.forecaster.context_len())
            .await?;

        let forecaster = Arc::clone(&self.forecaster);
        let forecast = tokio::task::spawn_blocking(move || forecaster.predict(&artifact.weights, &recent))
            .await
            .map_err(|e| Error::Task(e.to_string()))??;

        Ok(Some(forecast))
    }

    /// Push fresh predictions for `symbols` into the cache
    pub async fn refresh_predictions(&self, symbols: &[String]) -> Result<usize> {
        let ttl = self.current_ttl();
        let mut refreshed = 0;

        for symbol in symbols {
            match self.predict_symbol(symbol).await {
                Ok(Some(forecast)) => {
                    self.cache.set(symbol, &forecast, ttl).await;
                    refreshed += 1;
                }
                Ok(None) => {}
                Err(e) if e.is_store() => return Err(e),
                Err(e) => tracing::warn!(symbol = %symbol, "Prediction refresh failed: {}", e),
            }
        }

        tracing::debug!("Refreshed {} predictions (ttl {:?})", refreshed, ttl);
        Ok(refreshed)
    }

    /// Drive incremental and full cycles until `stop` is raised
    ///
    /// The first incremental cycle runs right away. When both timers are due
    /// on the same tick the full retrain wins and the incremental timer
    /// restarts from then.
    pub async fn run_schedule(self: Arc<Self>, symbols: Vec<String>, stop: StopSignal) {
        let incremental_period = self.settings.incremental_interval();
        let full_period = self.settings.full_interval();

        tracing::info!(
            "🔄 Training schedule starting (incremental every {:?}, full every {:?})",
            incremental_period,
            full_period
        );

        let start = tokio::time::Instant::now();
        let mut incremental = interval_at(start, incremental_period);
        let mut full = interval_at(start + full_period, full_period);
        incremental.set_missed_tick_behavior(MissedTickBehavior::Skip);
        full.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let symbols = Arc::new(symbols);
        let mut cycles = JoinSet::new();

        loop {
            let mode = tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = full.tick() => {
                    incremental.reset();
                    TrainingMode::Full
                }
                _ = incremental.tick() => TrainingMode::Incremental,
            };

            while cycles.try_join_next().is_some() {}

            let orchestrator = Arc::clone(&self);
            let symbols = Arc::clone(&symbols);
            let stop = stop.clone();
            cycles.spawn(async move {
                if let Err(e) = orchestrator.run_cycle(&symbols, mode, &stop).await {
                    tracing::error!("{} training cycle aborted: {}", mode.as_str(), e);
                }
            });
        }

        tracing::info!("Training schedule stopping, waiting for running cycles");
        while cycles.join_next().await.is_some() {}
        tracing::info!("Training schedule stopped");
    }
}
