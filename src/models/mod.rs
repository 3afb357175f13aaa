use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Observations are stored at hourly resolution
pub const HOUR_SECS: i64 = 3600;

/// Truncate a timestamp to the start of its hour
pub fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(chrono::Duration::hours(1)).unwrap_or(ts)
}

/// One hourly price observation for a symbol
///
/// Uniquely keyed by (symbol, timestamp)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub volume: f64,
    pub market_cap: f64,
}

/// Half-open interval [start, end) of hours with no stored observation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl MissingRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Number of hourly slots covered
    pub fn hours(&self) -> i64 {
        ((self.end - self.start).num_seconds() / HOUR_SECS).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Which target range a collection pass covers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    /// [start, now - 1h]
    Backward,
    /// [last known timestamp, now]
    Forward,
    /// [start, now], repairs holes left by partial runs
    GapFill,
}

impl std::fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CollectionMode::Backward => "backward",
            CollectionMode::Forward => "forward",
            CollectionMode::GapFill => "gap_fill",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Complete,
    Partial,
    Failed,
    Skipped,
}

/// Per-symbol outcome of one collection pass
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionResult {
    pub symbol: String,
    pub status: CollectionStatus,
    pub records_collected: usize,
    pub failed_ranges: Vec<MissingRange>,
    pub retry_count: u32,
    pub duration: Duration,
}

impl CollectionResult {
    pub fn skipped(symbol: &str, duration: Duration) -> Self {
        Self {
            symbol: symbol.to_string(),
            status: CollectionStatus::Skipped,
            records_collected: 0,
            failed_ranges: Vec::new(),
            retry_count: 0,
            duration,
        }
    }
}

/// Run-level aggregate of collection results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionSummary {
    pub run_id: Uuid,
    pub mode: CollectionMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<CollectionResult>,
    /// Stop was requested before every symbol ran
    pub cancelled: bool,
}

impl CollectionSummary {
    pub fn total_records(&self) -> usize {
        self.results.iter().map(|r| r.records_collected).sum()
    }

    pub fn count_status(&self, status: CollectionStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn result_for(&self, symbol: &str) -> Option<&CollectionResult> {
        self.results.iter().find(|r| r.symbol == symbol)
    }
}

/// Answer to `collection_status()`
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatusReport {
    pub is_running: bool,
    pub current_mode: Option<CollectionMode>,
    pub elapsed: Option<Duration>,
    pub last_run_summary: Option<CollectionSummary>,
}

/// Answer to `trigger_collection()`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Accepted,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    Incremental,
    Full,
}

impl TrainingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainingMode::Incremental => "incremental",
            TrainingMode::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "incremental" => Some(TrainingMode::Incremental),
            "full" => Some(TrainingMode::Full),
            _ => None,
        }
    }
}

/// Serialized model plus the window it was trained on
///
/// Artifacts are immutable. A retrain writes a new one and moves the
/// per-symbol current pointer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArtifact {
    pub id: Uuid,
    pub symbol: String,
    pub version_timestamp: DateTime<Utc>,
    pub weights: Vec<u8>,
    pub training_window_start: DateTime<Utc>,
    pub training_window_end: DateTime<Utc>,
    pub training_mode: TrainingMode,
}

/// Raw model output for one symbol
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Forecast {
    /// Last observed price the forecast starts from
    pub current_price: f64,
    /// Predicted price one hour ahead
    pub predicted_value: f64,
    /// 0.0 - 1.0
    pub confidence: f64,
}

impl Forecast {
    /// Relative change from the current price (0.02 = +2%)
    pub fn predicted_change(&self) -> f64 {
        if self.current_price == 0.0 {
            return 0.0;
        }
        (self.predicted_value - self.current_price) / self.current_price
    }
}

/// Prediction held by the cache with its freshness bound
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedPrediction {
    pub symbol: String,
    pub current_price: f64,
    pub predicted_value: f64,
    pub predicted_change: f64,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CachedPrediction {
    pub fn from_forecast(
        symbol: &str,
        forecast: &Forecast,
        generated_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            current_price: forecast.current_price,
            predicted_value: forecast.predicted_value,
            predicted_change: forecast.predicted_change(),
            confidence: forecast.confidence,
            generated_at,
            ttl_secs: ttl.as_secs(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.generated_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }

    /// Valid while generated_at + ttl >= now
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() >= now
    }
}

/// Public shape of a prediction returned to callers
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PredictionView {
    pub symbol: String,
    pub predicted_value: f64,
    pub confidence: f64,
    pub generated_at: DateTime<Utc>,
}

impl From<CachedPrediction> for PredictionView {
    fn from(entry: CachedPrediction) -> Self {
        Self {
            symbol: entry.symbol,
            predicted_value: entry.predicted_value,
            confidence: entry.confidence,
            generated_at: entry.generated_at,
        }
    }
}

/// Answer to `system_info()`
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SystemInfo {
    pub symbols_tracked: usize,
    pub total_observations: u64,
    pub last_observation_timestamp: Option<DateTime<Utc>>,
    pub models_current: usize,
    pub cache_entry_count: usize,
}
