use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

use super::mirror::PredictionMirror;
use crate::models::CachedPrediction;
use crate::{Error, Result};

const DEFAULT_KEY: &str = "pricecast:predictions";

/// Redis mirror for cached predictions
///
/// Keeps every entry as JSON in one hash, field per symbol.
pub struct RedisMirror {
    conn: ConnectionManager,
    key: String,
}

impl RedisMirror {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_key(redis_url, DEFAULT_KEY).await
    }

    pub async fn with_key(redis_url: &str, key: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        // Add 5 second timeout to connection attempt
        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Store("Redis connection timeout after 5 seconds".to_string()))??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl PredictionMirror for RedisMirror {
    async fn store(&self, entry: &CachedPrediction) -> Result<()> {
        let value = serde_json::to_string(entry)?;
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(&self.key, &entry.symbol, value)
            .await?;
        Ok(())
    }

    async fn load(&self, symbol: &str) -> Result<Option<CachedPrediction>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(&self.key, symbol).await?;

        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn load_all(&self) -> Result<Vec<CachedPrediction>> {
        let mut conn = self.conn.clone();
        let values: Vec<(String, String)> = conn.hgetall(&self.key).await?;

        let mut entries = Vec::with_capacity(values.len());
        for (symbol, json) in values {
            match serde_json::from_str(&json) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(symbol = %symbol, "Skipping unreadable mirror entry: {}", e),
            }
        }

        tracing::debug!("Loaded {} predictions from Redis", entries.len());
        Ok(entries)
    }

    async fn remove(&self, symbol: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(&self.key, symbol).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}
