pub mod coingecko;
pub mod converter;

pub use coingecko::{CoinGeckoClient, MarketChartData};
pub use converter::HourlyConverter;

use crate::models::Observation;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Upstream fetch failure, classified for the collector's retry loop
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FetchError {
    /// Network failure, timeout, rate limit or 5xx. Worth retrying.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// Rejected request or unparseable body. Retrying will not help.
    #[error("upstream error: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

/// Source of historical observations
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Fetch hourly observations for `symbol` in [start, end)
    ///
    /// Callers keep the window small enough for upstream limits.
    async fn fetch_range(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>, FetchError>;

    /// Client name for logs
    fn name(&self) -> &str;
}
