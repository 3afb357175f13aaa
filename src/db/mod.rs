pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::models::{ModelArtifact, Observation};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Durable table of hourly observations per symbol
///
/// Inserts are idempotent: an existing (symbol, timestamp) key is left as is.
#[async_trait]
pub trait RangeStore: Send + Sync {
    /// Insert observations, returning how many keys were new
    async fn insert_observations(&self, observations: &[Observation]) -> Result<usize>;

    /// Timestamps stored for `symbol` in [start, end), ascending
    async fn existing_timestamps(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>>;

    /// Most recent stored timestamp for `symbol`
    async fn last_timestamp(&self, symbol: &str) -> Result<Option<DateTime<Utc>>>;

    /// Observations for `symbol` in [start, end), ascending
    async fn load_observations(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>>;

    /// The `limit` most recent observations for `symbol`, ascending
    async fn latest_observations(&self, symbol: &str, limit: usize) -> Result<Vec<Observation>>;

    async fn count_observations(&self) -> Result<u64>;

    /// Most recent timestamp across all symbols
    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Keyed-by-symbol model storage with a current pointer per symbol
///
/// `put` writes the new version first and only then moves the pointer, so
/// `current` never returns a partially written artifact.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn current(&self, symbol: &str) -> Result<Option<Arc<ModelArtifact>>>;

    /// Store a new version and make it current
    async fn put(&self, artifact: ModelArtifact) -> Result<Arc<ModelArtifact>>;

    /// All stored versions for `symbol`, oldest first
    async fn history(&self, symbol: &str) -> Result<Vec<ModelArtifact>>;

    /// Number of symbols with a current artifact
    async fn count_current(&self) -> Result<usize>;
}
