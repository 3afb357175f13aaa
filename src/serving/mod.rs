use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::cache::{rank_order, PredictionCache};
use crate::collector::{CollectionRunState, Collector};
use crate::config::CacheSettings;
use crate::db::{ModelStore, RangeStore};
use crate::models::{
    CachedPrediction, CollectionMode, CollectionStatusReport, PredictionView, SystemInfo,
    TriggerOutcome,
};
use crate::stop::StopSignal;
use crate::training::Orchestrator;
use crate::Result;

/// Single entry point for dashboards, chat and alerting
///
/// Reads come from the prediction cache. A miss goes through one bounded,
/// non-retrying generation attempt; a symbol without a model is not found.
#[derive(Clone)]
pub struct ServingFacade {
    symbols: Arc<Vec<String>>,
    collector: Collector,
    run_state: Arc<CollectionRunState>,
    orchestrator: Arc<Orchestrator>,
    cache: Arc<PredictionCache>,
    observations: Arc<dyn RangeStore>,
    models: Arc<dyn ModelStore>,
    fallback_permits: Arc<Semaphore>,
    fallback_timeout: Duration,
    stop: StopSignal,
}

impl ServingFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbols: Vec<String>,
        collector: Collector,
        orchestrator: Arc<Orchestrator>,
        cache: Arc<PredictionCache>,
        observations: Arc<dyn RangeStore>,
        models: Arc<dyn ModelStore>,
        settings: &CacheSettings,
        stop: StopSignal,
    ) -> Self {
        Self {
            symbols: Arc::new(symbols),
            collector,
            run_state: Arc::new(CollectionRunState::new()),
            orchestrator,
            cache,
            observations,
            models,
            fallback_permits: Arc::new(Semaphore::new(settings.fallback_concurrency.max(1))),
            fallback_timeout: settings.fallback_timeout(),
            stop,
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Run state shared with the scheduled collection loop
    pub fn run_state(&self) -> Arc<CollectionRunState> {
        Arc::clone(&self.run_state)
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Start a collection pass in the background
    ///
    /// Returns immediately; progress is visible through `collection_status`.
    pub fn trigger_collection(
        &self,
        mode: CollectionMode,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> TriggerOutcome {
        let Some(guard) = self.run_state.try_begin(mode) else {
            tracing::info!("Collection trigger rejected, a pass is already running");
            return TriggerOutcome::AlreadyRunning;
        };

        let collector = self.collector.clone();
        let run_state = Arc::clone(&self.run_state);
        let symbols = Arc::clone(&self.symbols);
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let _guard = guard;
            match collector.collect(&symbols, mode, start, end, &stop).await {
                Ok(summary) => run_state.record_summary(summary),
                Err(e) => tracing::error!("Triggered {} collection aborted: {}", mode, e),
            }
        });

        tracing::info!("Collection triggered ({})", mode);
        TriggerOutcome::Accepted
    }

    pub fn collection_status(&self) -> CollectionStatusReport {
        self.run_state.report()
    }

    /// Predictions ranked by expected change, at most `limit` of them
    ///
    /// With `use_cache` the Top-N view answers directly while it is fresh and
    /// covers every tracked symbol. Otherwise misses, or every symbol without
    /// `use_cache`, go through the bounded path concurrently.
    pub async fn get_predictions(&self, limit: usize, use_cache: bool) -> Vec<PredictionView> {
        if use_cache {
            if let Some(top) = self.cache.get_top_n_covering(limit, &self.symbols) {
                return top.into_iter().map(PredictionView::from).collect();
            }
        }

        let mut tasks = JoinSet::new();
        for symbol in self.symbols.iter().cloned() {
            let facade = self.clone();
            tasks.spawn(async move {
                if use_cache {
                    if let Some(entry) = facade.cache.get(&symbol).await {
                        return Some(entry);
                    }
                }
                facade.generate(&symbol, use_cache).await
            });
        }

        let mut entries: Vec<CachedPrediction> = Vec::with_capacity(self.symbols.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => entries.extend(entry),
                Err(e) => tracing::error!("Prediction task failed: {}", e),
            }
        }

        entries.sort_by(rank_order);
        entries
            .into_iter()
            .take(limit)
            .map(PredictionView::from)
            .collect()
    }

    /// Prediction for one symbol, or `None` when it has no model
    pub async fn get_prediction(&self, symbol: &str) -> Option<PredictionView> {
        let symbol = symbol.trim().to_uppercase();

        if let Some(entry) = self.cache.get(&symbol).await {
            return Some(entry.into());
        }

        self.generate(&symbol, true).await.map(PredictionView::from)
    }

    pub async fn system_info(&self) -> Result<SystemInfo> {
        Ok(SystemInfo {
            symbols_tracked: self.symbols.len(),
            total_observations: self.observations.count_observations().await?,
            last_observation_timestamp: self.observations.latest_timestamp().await?,
            models_current: self.models.count_current().await?,
            cache_entry_count: self.cache.len(),
        })
    }

    /// Ask running collection and training passes to stop
    pub fn stop(&self) {
        tracing::info!("Stop requested");
        self.stop.stop();
    }

    /// One bounded attempt to produce and cache a prediction
    async fn generate(&self, symbol: &str, recheck_cache: bool) -> Option<CachedPrediction> {
        let attempt = async {
            let _permit = self.fallback_permits.acquire().await.ok()?;

            // Another caller may have filled it while we waited
            if recheck_cache {
                if let Some(entry) = self.cache.get(symbol).await {
                    return Some(entry);
                }
            }

            match self.orchestrator.predict_symbol(symbol).await {
                Ok(Some(forecast)) => {
                    let ttl = self.orchestrator.current_ttl();
                    Some(self.cache.set(symbol, &forecast, ttl).await)
                }
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(symbol = %symbol, "Fallback prediction failed: {}", e);
                    None
                }
            }
        };

        match timeout(self.fallback_timeout, attempt).await {
            Ok(entry) => entry,
            Err(_) => {
                tracing::warn!(
                    symbol = %symbol,
                    "Fallback prediction timed out after {:?}",
                    self.fallback_timeout
                );
                None
            }
        }
    }
}
