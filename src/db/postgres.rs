use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use std::sync::Arc;
use uuid::Uuid;

use super::{ModelStore, RangeStore};
use crate::models::{ModelArtifact, Observation, TrainingMode};
use crate::{Error, Result};

/// Postgres persistence for observations and model artifacts
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to Postgres and run migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Delete everything for symbols matching a prefix (testing only)
    #[cfg(test)]
    async fn clear_symbol_prefix(&self, prefix: &str) -> Result<()> {
        let pattern = format!("{}%", prefix);
        sqlx::query("DELETE FROM model_current WHERE symbol LIKE $1")
            .bind(&pattern)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM model_artifacts WHERE symbol LIKE $1")
            .bind(&pattern)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM observations WHERE symbol LIKE $1")
            .bind(&pattern)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn to_decimal(value: f64, field: &str) -> Result<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| Error::Store(format!("{} is not representable: {}", field, value)))
}

fn from_decimal(value: Decimal, field: &str) -> Result<f64> {
    value
        .to_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Store(format!("Stored {} does not fit an f64: {}", field, value)))
}

fn observation_from_row(row: &PgRow) -> Result<Observation> {
    Ok(Observation {
        symbol: row.get("symbol"),
        timestamp: row.get("ts"),
        price: from_decimal(row.get("price"), "price")?,
        volume: from_decimal(row.get("volume"), "volume")?,
        market_cap: from_decimal(row.get("market_cap"), "market_cap")?,
    })
}

fn artifact_from_row(row: &PgRow) -> Result<ModelArtifact> {
    let mode_str: String = row.get("training_mode");
    let training_mode = TrainingMode::parse(&mode_str)
        .ok_or_else(|| Error::Store(format!("Invalid training mode: {}", mode_str)))?;

    Ok(ModelArtifact {
        id: row.get("id"),
        symbol: row.get("symbol"),
        version_timestamp: row.get("version_ts"),
        weights: row.get("weights"),
        training_window_start: row.get("window_start"),
        training_window_end: row.get("window_end"),
        training_mode,
    })
}

#[async_trait]
impl RangeStore for PostgresStore {
    async fn insert_observations(&self, observations: &[Observation]) -> Result<usize> {
        if observations.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;

        for observation in observations {
            let result = sqlx::query(
                r#"
                INSERT INTO observations (symbol, ts, price, volume, market_cap)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (symbol, ts) DO NOTHING
                "#,
            )
            .bind(&observation.symbol)
            .bind(observation.timestamp)
            .bind(to_decimal(observation.price, "price")?)
            .bind(to_decimal(observation.volume, "volume")?)
            .bind(to_decimal(observation.market_cap, "market_cap")?)
            .execute(&mut *tx)
            .await?;

            inserted += result.rows_affected();
        }

        tx.commit().await?;

        tracing::debug!(
            "Inserted {} of {} observations into Postgres",
            inserted,
            observations.len()
        );

        Ok(inserted as usize)
    }

    async fn existing_timestamps(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let rows = sqlx::query(
            r#"
            SELECT ts
            FROM observations
            WHERE symbol = $1 AND ts >= $2 AND ts < $3
            ORDER BY ts ASC
            "#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get("ts")).collect())
    }

    async fn last_timestamp(&self, symbol: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(ts) AS last_ts FROM observations WHERE symbol = $1")
            .bind(symbol)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("last_ts"))
    }

    async fn load_observations(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, ts, price, volume, market_cap
            FROM observations
            WHERE symbol = $1 AND ts >= $2 AND ts < $3
            ORDER BY ts ASC
            "#,
        )
        .bind(symbol)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(observation_from_row).collect()
    }

    async fn latest_observations(&self, symbol: &str, limit: usize) -> Result<Vec<Observation>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, ts, price, volume, market_cap
            FROM observations
            WHERE symbol = $1
            ORDER BY ts DESC
            LIMIT $2
            "#,
        )
        .bind(symbol)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut observations = rows.iter().map(observation_from_row).collect::<Result<Vec<_>>>()?;
        observations.reverse();
        Ok(observations)
    }

    async fn count_observations(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM observations")
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.get("count");
        Ok(count.max(0) as u64)
    }

    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(ts) AS last_ts FROM observations")
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get("last_ts"))
    }
}

#[async_trait]
impl ModelStore for PostgresStore {
    async fn current(&self, symbol: &str) -> Result<Option<Arc<ModelArtifact>>> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.symbol, a.version_ts, a.weights, a.window_start,
                   a.window_end, a.training_mode
            FROM model_current c
            JOIN model_artifacts a ON a.id = c.artifact_id
            WHERE c.symbol = $1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| artifact_from_row(&row).map(Arc::new))
            .transpose()
    }

    async fn put(&self, artifact: ModelArtifact) -> Result<Arc<ModelArtifact>> {
        let mut tx = self.pool.begin().await?;

        // New version first, then move the pointer
        sqlx::query(
            r#"
            INSERT INTO model_artifacts (
                id, symbol, version_ts, weights, window_start, window_end, training_mode
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(artifact.id)
        .bind(&artifact.symbol)
        .bind(artifact.version_timestamp)
        .bind(&artifact.weights)
        .bind(artifact.training_window_start)
        .bind(artifact.training_window_end)
        .bind(artifact.training_mode.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO model_current (symbol, artifact_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (symbol) DO UPDATE SET
                artifact_id = EXCLUDED.artifact_id,
                updated_at = NOW()
            "#,
        )
        .bind(&artifact.symbol)
        .bind(artifact.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            "Saved {} model {} for {} to Postgres",
            artifact.training_mode.as_str(),
            artifact.id,
            artifact.symbol
        );

        Ok(Arc::new(artifact))
    }

    async fn history(&self, symbol: &str) -> Result<Vec<ModelArtifact>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, version_ts, weights, window_start, window_end, training_mode
            FROM model_artifacts
            WHERE symbol = $1
            ORDER BY version_ts ASC
            "#,
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(artifact_from_row).collect()
    }

    async fn count_current(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM model_current")
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.get("count");
        Ok(count.max(0) as usize)
    }
}
