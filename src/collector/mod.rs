pub mod gaps;
pub mod run_state;
pub mod validator;

pub use gaps::{missing_ranges, split_windows, target_range};
pub use run_state::{CollectionRunState, RunGuard};
pub use validator::ObservationValidator;

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Duration};
use uuid::Uuid;

use crate::api::{ExchangeClient, FetchError};
use crate::config::CollectorSettings;
use crate::db::RangeStore;
use crate::models::{
    CollectionMode, CollectionResult, CollectionStatus, CollectionSummary, MissingRange,
    Observation,
};
use crate::stop::StopSignal;
use crate::{Error, Result};

/// Gap-aware collector
///
/// Computes what each symbol is missing, fetches only that, and persists
/// every window as soon as it arrives. Cloneable so symbol workers can share
/// it across tasks.
#[derive(Clone)]
pub struct Collector {
    store: Arc<dyn RangeStore>,
    exchange: Arc<dyn ExchangeClient>,
    settings: Arc<CollectorSettings>,
    validator: Arc<ObservationValidator>,
}

impl Collector {
    pub fn new(
        store: Arc<dyn RangeStore>,
        exchange: Arc<dyn ExchangeClient>,
        settings: CollectorSettings,
    ) -> Self {
        Self {
            store,
            exchange,
            settings: Arc::new(settings),
            validator: Arc::new(ObservationValidator::new()),
        }
    }

    /// Run one collection pass over `symbols`
    ///
    /// Symbols run on a bounded worker pool. Per-symbol failures land in the
    /// results; only a store failure aborts the pass.
    pub async fn collect(
        &self,
        symbols: &[String],
        mode: CollectionMode,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        stop: &StopSignal,
    ) -> Result<CollectionSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        tracing::info!(
            run_id = %run_id,
            mode = %mode,
            "Starting collection for {} symbols via {}",
            symbols.len(),
            self.exchange.name()
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let aborted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let mut cancelled = false;

        for (index, symbol) in symbols.iter().enumerate() {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Task(e.to_string()))?;

            if aborted.load(Ordering::Acquire) {
                break;
            }
            if stop.is_stopped() {
                tracing::info!(run_id = %run_id, "Stop requested, not starting {}", symbol);
                cancelled = true;
                break;
            }

            let collector = self.clone();
            let symbol = symbol.clone();
            let stop = stop.clone();
            let aborted = aborted.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let outcome = collector
                    .collect_symbol(&symbol, mode, start, end, started_at, &stop)
                    .await;
                if outcome.is_err() {
                    aborted.store(true, Ordering::Release);
                }
                (index, outcome)
            });
        }

        let mut results = Vec::with_capacity(symbols.len());
        while let Some(joined) = tasks.join_next().await {
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tasks.abort_all();
                    return Err(Error::Task(e.to_string()));
                }
            };

            match outcome {
                Ok(Some(result)) => results.push((index, result)),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        run_id = %run_id,
                        "Aborting collection, store unavailable: {}",
                        e
                    );
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        results.sort_by_key(|(index, _)| *index);
        let results: Vec<CollectionResult> = results.into_iter().map(|(_, r)| r).collect();
        cancelled |= results.len() < symbols.len();

        let summary = CollectionSummary {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            results,
            cancelled,
        };

        tracing::info!(
            run_id = %run_id,
            "Collection finished: {} records, {} complete, {} partial, {} failed, {} skipped{}",
            summary.total_records(),
            summary.count_status(CollectionStatus::Complete),
            summary.count_status(CollectionStatus::Partial),
            summary.count_status(CollectionStatus::Failed),
            summary.count_status(CollectionStatus::Skipped),
            if summary.cancelled { " (stopped early)" } else { "" }
        );

        Ok(summary)
    }

    /// Collect whatever `symbol` is missing in the mode's target range
    ///
    /// `None` when a stop arrived before the first window was attempted.
    async fn collect_symbol(
        &self,
        symbol: &str,
        mode: CollectionMode,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        stop: &StopSignal,
    ) -> Result<Option<CollectionResult>> {
        let timer = Instant::now();

        let last_known = match mode {
            CollectionMode::Forward => self.store.last_timestamp(symbol).await?,
            _ => None,
        };

        let lookback = chrono::Duration::days(self.settings.default_lookback_days);
        let Some(target) = target_range(mode, start, end, last_known, now, lookback) else {
            tracing::debug!(symbol = %symbol, "Empty target range, skipping");
            return Ok(Some(CollectionResult::skipped(symbol, timer.elapsed())));
        };

        let existing = self
            .store
            .existing_timestamps(symbol, target.start, target.end)
            .await?;
        let gaps = missing_ranges(&existing, target.start, target.end);

        if gaps.is_empty() {
            tracing::info!(
                symbol = %symbol,
                "No gaps in {} -> {}, skipping",
                target.start,
                target.end
            );
            return Ok(Some(CollectionResult::skipped(symbol, timer.elapsed())));
        }

        let windows: Vec<MissingRange> = gaps
            .iter()
            .flat_map(|gap| split_windows(gap, self.settings.window_hours))
            .collect();

        tracing::info!(
            symbol = %symbol,
            "Found {} gaps ({} hours) in {} -> {}, fetching in {} windows",
            gaps.len(),
            gaps.iter().map(|g| g.hours()).sum::<i64>(),
            target.start,
            target.end,
            windows.len()
        );

        let mut records_collected = 0;
        let mut succeeded = 0;
        let mut failed_ranges = Vec::new();
        let mut retry_count = 0;
        let mut interrupted = false;

        for window in &windows {
            if stop.is_stopped() {
                interrupted = true;
                break;
            }

            match self.fetch_with_retry(symbol, window, &mut retry_count).await {
                Ok(observations) => {
                    let (valid, rejected) = self.validator.filter_valid(observations, Utc::now());
                    // Persist right away so an interrupted run keeps this window
                    let inserted = self.store.insert_observations(&valid).await?;
                    records_collected += inserted;
                    succeeded += 1;

                    tracing::debug!(
                        symbol = %symbol,
                        "✓ Window {} -> {}: {} new ({} fetched, {} rejected)",
                        window.start,
                        window.end,
                        inserted,
                        valid.len(),
                        rejected
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        symbol = %symbol,
                        "✗ Window {} -> {} failed: {}",
                        window.start,
                        window.end,
                        e
                    );
                    failed_ranges.push(*window);
                }
            }
        }

        if interrupted && succeeded == 0 && failed_ranges.is_empty() {
            tracing::info!(symbol = %symbol, "Stop requested before the first window");
            return Ok(None);
        }

        let status = if succeeded > 0 && (interrupted || !failed_ranges.is_empty()) {
            CollectionStatus::Partial
        } else if failed_ranges.is_empty() {
            CollectionStatus::Complete
        } else {
            CollectionStatus::Failed
        };

        tracing::info!(
            symbol = %symbol,
            "{:?}: {} records, {} failed windows, {} retries",
            status,
            records_collected,
            failed_ranges.len(),
            retry_count
        );

        Ok(Some(CollectionResult {
            symbol: symbol.to_string(),
            status,
            records_collected,
            failed_ranges,
            retry_count,
            duration: timer.elapsed(),
        }))
    }

    /// Fetch one window, retrying transient failures with exponential backoff
    ///
    /// Makes at most `max_retries` attempts in total. Permanent failures are
    /// returned immediately.
    async fn fetch_with_retry(
        &self,
        symbol: &str,
        window: &MissingRange,
        retry_count: &mut u32,
    ) -> std::result::Result<Vec<Observation>, FetchError> {
        let max_attempts = self.settings.max_retries.max(1);
        let mut attempt = 1;

        loop {
            match self
                .exchange
                .fetch_range(symbol, window.start, window.end)
                .await
            {
                Ok(observations) => return Ok(observations),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let backoff = self.settings.base_delay() * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        symbol = %symbol,
                        "{}, retrying in {:?} (attempt {}/{})",
                        e,
                        backoff,
                        attempt,
                        max_attempts
                    );
                    *retry_count += 1;
                    attempt += 1;
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Scheduled forward collection
///
/// Shares `run_state` with on-demand triggers, so a tick that lands while a
/// pass is running is skipped.
pub async fn run_collection_loop(
    collector: Collector,
    run_state: Arc<CollectionRunState>,
    symbols: Vec<String>,
    period: Duration,
    stop: StopSignal,
) {
    tracing::info!("🔄 Collection loop starting (every {:?})", period);

    // Start immediately, then run on the configured period
    let mut ticker = interval_at(tokio::time::Instant::now(), period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.stopped() => break,
            _ = ticker.tick() => {}
        }

        let Some(_guard) = run_state.try_begin(CollectionMode::Forward) else {
            tracing::info!("Collection already running, skipping scheduled pass");
            continue;
        };

        match collector
            .collect(&symbols, CollectionMode::Forward, None, None, &stop)
            .await
        {
            Ok(summary) => run_state.record_summary(summary),
            Err(e) => tracing::error!("Scheduled collection aborted: {}", e),
        }
    }

    tracing::info!("Collection loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use parking_lot::Mutex;

    fn hour(h: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + ChronoDuration::hours(h)
    }

    fn settings() -> CollectorSettings {
        CollectorSettings {
            window_hours: 24,
            max_retries: 3,
            base_delay_ms: 1,
            workers: 2,
            ..CollectorSettings::default()
        }
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Serves one observation per hour; fails windows listed in `fail_from`
    #[derive(Default)]
    struct ScriptedExchange {
        calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
        fail_from: Vec<DateTime<Utc>>,
        permanent: bool,
        /// Raised after every successful fetch
        stop_after_fetch: Option<StopSignal>,
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        async fn fetch_range(
            &self,
            symbol: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> std::result::Result<Vec<Observation>, FetchError> {
            self.calls.lock().push((symbol.to_string(), start, end));

            if self.fail_from.contains(&start) {
                return Err(if self.permanent {
                    FetchError::Permanent("bad request".to_string())
                } else {
                    FetchError::Transient("server error 503".to_string())
                });
            }

            let mut observations = Vec::new();
            let mut ts = start;
            while ts < end {
                observations.push(Observation {
                    symbol: symbol.to_string(),
                    timestamp: ts,
                    price: 100.0 + (ts - hour(0)).num_hours() as f64,
                    volume: 10.0,
                    market_cap: 1000.0,
                });
                ts += ChronoDuration::hours(1);
            }
            if let Some(stop) = &self.stop_after_fetch {
                stop.stop();
            }
            Ok(observations)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Range store whose writes always fail
    struct BrokenStore;

    #[async_trait]
    impl RangeStore for BrokenStore {
        async fn insert_observations(&self, _: &[Observation]) -> Result<usize> {
            Err(Error::Store("disk full".to_string()))
        }
        async fn existing_timestamps(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<DateTime<Utc>>> {
            Ok(Vec::new())
        }
        async fn last_timestamp(&self, _: &str) -> Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
        async fn load_observations(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<Observation>> {
            Ok(Vec::new())
        }
        async fn latest_observations(&self, _: &str, _: usize) -> Result<Vec<Observation>> {
            Ok(Vec::new())
        }
        async fn count_observations(&self) -> Result<u64> {
            Ok(0)
        }
        async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_collect_fetches_missing_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(ScriptedExchange::default());
        let collector = Collector::new(store.clone(), exchange.clone(), settings());

        let summary = collector
            .collect(
                &symbols(&["BTC"]),
                CollectionMode::Backward,
                Some(hour(0)),
                Some(hour(48)),
                &StopSignal::new(),
            )
            .await
            .unwrap();

        let result = summary.result_for("BTC").unwrap();
        assert_eq!(result.status, CollectionStatus::Complete);
        assert_eq!(result.records_collected, 48);
        assert!(result.failed_ranges.is_empty());
        // 48 hours at 24 hours per window
        assert_eq!(exchange.calls.lock().len(), 2);
        assert_eq!(store.count_observations().await.unwrap(), 48);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_second_run_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(ScriptedExchange::default());
        let collector = Collector::new(store.clone(), exchange.clone(), settings());
        let names = symbols(&["BTC", "ETH"]);

        collector
            .collect(&names, CollectionMode::GapFill, Some(hour(0)), Some(hour(30)), &StopSignal::new())
            .await
            .unwrap();
        let calls_after_first = exchange.calls.lock().len();

        let second = collector
            .collect(&names, CollectionMode::GapFill, Some(hour(0)), Some(hour(30)), &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(second.total_records(), 0);
        assert_eq!(second.count_status(CollectionStatus::Skipped), 2);
        assert_eq!(exchange.calls.lock().len(), calls_after_first);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_exactly_max_retries() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(ScriptedExchange {
            fail_from: vec![hour(0)],
            ..ScriptedExchange::default()
        });
        let collector = Collector::new(store.clone(), exchange.clone(), settings());

        let summary = collector
            .collect(&symbols(&["ETH"]), CollectionMode::Backward, Some(hour(0)), Some(hour(10)), &StopSignal::new())
            .await
            .unwrap();

        let result = summary.result_for("ETH").unwrap();
        assert_eq!(result.status, CollectionStatus::Failed);
        assert_eq!(exchange.calls.lock().len(), 3);
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.failed_ranges, vec![MissingRange::new(hour(0), hour(10))]);
        assert_eq!(store.count_observations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(ScriptedExchange {
            fail_from: vec![hour(0)],
            permanent: true,
            ..ScriptedExchange::default()
        });
        let collector = Collector::new(store, exchange.clone(), settings());

        let summary = collector
            .collect(&symbols(&["ETH"]), CollectionMode::Backward, Some(hour(0)), Some(hour(10)), &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(summary.result_for("ETH").unwrap().status, CollectionStatus::Failed);
        assert_eq!(exchange.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_when_some_windows_fail() {
        let store = Arc::new(MemoryStore::new());
        // Second 24h window always fails
        let exchange = Arc::new(ScriptedExchange {
            fail_from: vec![hour(24)],
            ..ScriptedExchange::default()
        });
        let collector = Collector::new(store.clone(), exchange, settings());

        let summary = collector
            .collect(&symbols(&["SOL"]), CollectionMode::Backward, Some(hour(0)), Some(hour(72)), &StopSignal::new())
            .await
            .unwrap();

        let result = summary.result_for("SOL").unwrap();
        assert_eq!(result.status, CollectionStatus::Partial);
        assert_eq!(result.records_collected, 48);
        assert_eq!(result.failed_ranges, vec![MissingRange::new(hour(24), hour(48))]);

        // Gap fill later picks up only the failed window
        let retry_exchange = Arc::new(ScriptedExchange::default());
        let retry = Collector::new(store.clone(), retry_exchange.clone(), settings());
        retry
            .collect(&symbols(&["SOL"]), CollectionMode::GapFill, Some(hour(0)), Some(hour(72)), &StopSignal::new())
            .await
            .unwrap();

        let calls = retry_exchange.calls.lock().clone();
        assert_eq!(calls, vec![("SOL".to_string(), hour(24), hour(48))]);
        assert_eq!(store.count_observations().await.unwrap(), 72);
    }

    #[tokio::test]
    async fn test_one_symbol_failure_does_not_abort_others() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(ScriptedExchange {
            fail_from: vec![hour(0)],
            ..ScriptedExchange::default()
        });
        let collector = Collector::new(store.clone(), exchange, settings());

        // Pre-fill BTC so its gap starts later and does not hit the failing window
        let seed: Vec<Observation> = (0..5)
            .map(|h| Observation {
                symbol: "BTC".to_string(),
                timestamp: hour(h),
                price: 1.0,
                volume: 0.0,
                market_cap: 0.0,
            })
            .collect();
        store.insert_observations(&seed).await.unwrap();

        let summary = collector
            .collect(&symbols(&["BTC", "ETH"]), CollectionMode::Backward, Some(hour(0)), Some(hour(10)), &StopSignal::new())
            .await
            .unwrap();

        assert_eq!(summary.result_for("BTC").unwrap().status, CollectionStatus::Complete);
        assert_eq!(summary.result_for("ETH").unwrap().status, CollectionStatus::Failed);
        // Results keep the input order
        assert_eq!(summary.results[0].symbol, "BTC");
    }

    #[tokio::test]
    async fn test_store_failure_aborts_run() {
        let exchange = Arc::new(ScriptedExchange::default());
        let collector = Collector::new(Arc::new(BrokenStore), exchange, settings());

        let result = collector
            .collect(&symbols(&["BTC", "ETH"]), CollectionMode::Backward, Some(hour(0)), Some(hour(10)), &StopSignal::new())
            .await;

        let err = tokio_test::assert_err!(result);
        assert!(err.is_store());
    }

    #[tokio::test]
    async fn test_stopped_before_start_collects_nothing() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(ScriptedExchange::default());
        let collector = Collector::new(store, exchange.clone(), settings());

        let stop = StopSignal::new();
        stop.stop();

        let summary = collector
            .collect(&symbols(&["BTC", "ETH"]), CollectionMode::Backward, Some(hour(0)), Some(hour(10)), &stop)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert!(summary.results.is_empty());
        assert!(exchange.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_before_first_window_reports_nothing() {
        let store = Arc::new(MemoryStore::new());
        let exchange = Arc::new(ScriptedExchange::default());
        let collector = Collector::new(store.clone(), exchange.clone(), settings());

        let stop = StopSignal::new();
        stop.stop();

        let result = collector
            .collect_symbol("BTC", CollectionMode::Backward, Some(hour(0)), Some(hour(48)), Utc::now(), &stop)
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(exchange.calls.lock().is_empty());
        assert_eq!(store.count_observations().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_between_windows_is_partial() {
        let store = Arc::new(MemoryStore::new());
        let stop = StopSignal::new();
        let exchange = Arc::new(ScriptedExchange {
            stop_after_fetch: Some(stop.clone()),
            ..ScriptedExchange::default()
        });
        let collector = Collector::new(store.clone(), exchange, settings());

        // Two 24 hour windows; the stop lands after the first
        let result = collector
            .collect_symbol("BTC", CollectionMode::Backward, Some(hour(0)), Some(hour(48)), Utc::now(), &stop)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, CollectionStatus::Partial);
        assert_eq!(result.records_collected, 24);
        assert!(result.failed_ranges.is_empty());

        let resumed = collector
            .collect_symbol("BTC", CollectionMode::Backward, Some(hour(0)), Some(hour(48)), Utc::now(), &StopSignal::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.records_collected, 24);
        assert_eq!(store.count_observations().await.unwrap(), 48);
    }
}
