use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::Result;

const DEFAULT_CONFIG_FILE: &str = "pricecast.toml";
const ENV_PREFIX: &str = "PRICECAST";

/// Application settings
///
/// Layered: serde defaults, then `pricecast.toml` (or `$PRICECAST_CONFIG`),
/// then `PRICECAST__SECTION__KEY` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Postgres URL; in-memory stores are used when absent or unreachable
    pub database_url: Option<String>,
    /// Redis URL for the prediction mirror; the JSON file mirror is used when absent
    pub redis_url: Option<String>,
    /// Symbols to collect, train and serve
    pub symbols: Vec<String>,
    pub coingecko: CoinGeckoSettings,
    pub collector: CollectorSettings,
    pub training: TrainingSettings,
    pub cache: CacheSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            symbols: vec!["BTC".to_string(), "ETH".to_string(), "SOL".to_string()],
            coingecko: CoinGeckoSettings::default(),
            collector: CollectorSettings::default(),
            training: TrainingSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoinGeckoSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub rate_limit_rpm: u32,
    pub timeout_secs: u64,
    /// Symbol -> CoinGecko coin_id
    pub coin_ids: HashMap<String, String>,
}

impl Default for CoinGeckoSettings {
    fn default() -> Self {
        let coin_ids = [
            ("BTC", "bitcoin"),
            ("ETH", "ethereum"),
            ("SOL", "solana"),
            ("BNB", "binancecoin"),
            ("XRP", "ripple"),
            ("ADA", "cardano"),
        ]
        .into_iter()
        .map(|(symbol, id)| (symbol.to_string(), id.to_string()))
        .collect();

        Self {
            api_key: None,
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            rate_limit_rpm: 30, // Demo API: 30 requests per minute
            timeout_secs: 30,
            coin_ids,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Hours per upstream call (CoinGecko serves hourly data up to 90 days)
    pub window_hours: i64,
    /// Total attempts per window before it is recorded as failed
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further attempt
    pub base_delay_ms: u64,
    /// Symbols processed in parallel
    pub workers: usize,
    /// Period of the scheduled forward collection
    pub interval_hours: u64,
    /// Start of the range when none is given
    pub default_lookback_days: i64,
}

impl CollectorSettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            window_hours: 24 * 30,
            max_retries: 3,
            base_delay_ms: 2_000,
            workers: 4,
            interval_hours: 4,
            default_lookback_days: 90,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Symbols trained together; bounds resident training data
    pub batch_size: usize,
    pub incremental_interval_minutes: u64,
    pub full_interval_hours: u64,
    pub incremental_epochs: usize,
    pub full_epochs: usize,
    pub full_lookback_days: i64,
    /// Hours before the incremental window loaded as feature history
    pub context_hours: i64,
    pub learning_rate: f64,
    pub l2_penalty: f64,
    /// Seed for weight initialization
    pub seed: u64,
}

impl TrainingSettings {
    pub fn incremental_interval(&self) -> Duration {
        Duration::from_secs(self.incremental_interval_minutes * 60)
    }

    pub fn full_interval(&self) -> Duration {
        Duration::from_secs(self.full_interval_hours * 3600)
    }

    pub fn full_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(self.full_lookback_days)
    }

    pub fn context(&self) -> chrono::Duration {
        chrono::Duration::hours(self.context_hours)
    }
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            incremental_interval_minutes: 60,
            full_interval_hours: 24 * 7,
            incremental_epochs: 5,
            full_epochs: 200,
            full_lookback_days: 120,
            context_hours: 48,
            learning_rate: 0.05,
            l2_penalty: 1e-4,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    /// TTL used while a full retrain is in progress
    pub extended_ttl_secs: u64,
    pub mirror_path: PathBuf,
    pub fallback_timeout_ms: u64,
    pub fallback_concurrency: usize,
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn extended_ttl(&self) -> Duration {
        Duration::from_secs(self.extended_ttl_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            extended_ttl_secs: 6 * 3600,
            mirror_path: PathBuf::from("data/predictions.json"),
            fallback_timeout_ms: 2_000,
            fallback_concurrency: 4,
        }
    }
}

impl Settings {
    /// Load settings from the default file location and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var("PRICECAST_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Some(PathBuf::from(path)))
    }

    /// Load settings from an explicit file (optional) and environment
    pub fn load_from(path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("symbols")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()
    }

    /// Parse settings from a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()
    }

    fn validate(mut self) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        self.symbols = self
            .symbols
            .iter()
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();

        if self.symbols.is_empty() {
            return Err(config::ConfigError::Message("no symbols configured".to_string()).into());
        }
        if self.collector.window_hours <= 0 {
            return Err(config::ConfigError::Message(
                "collector.window_hours must be positive".to_string(),
            )
            .into());
        }
        if self.training.batch_size == 0 {
            return Err(config::ConfigError::Message(
                "training.batch_size must be positive".to_string(),
            )
            .into());
        }
        if self.collector.interval_hours == 0
            || self.training.incremental_interval_minutes == 0
            || self.training.full_interval_hours == 0
        {
            return Err(config::ConfigError::Message(
                "schedule intervals must be positive".to_string(),
            )
            .into());
        }

        Ok(self)
    }
}
