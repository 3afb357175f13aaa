use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{ModelStore, RangeStore};
use crate::models::{ModelArtifact, Observation};
use crate::Result;

/// In-process Range Store and Model Store
///
/// Used when Postgres is not configured and by the test suites. Holds the
/// same invariants as the Postgres backend: idempotent inserts and
/// write-then-swap model pointers.
#[derive(Default)]
pub struct MemoryStore {
    observations: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, Observation>>>,
    artifacts: RwLock<HashMap<String, Vec<Arc<ModelArtifact>>>>,
    current: RwLock<HashMap<String, Arc<ModelArtifact>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RangeStore for MemoryStore {
    async fn insert_observations(&self, observations: &[Observation]) -> Result<usize> {
        let mut data = self.observations.write();
        let mut inserted = 0;

        for observation in observations {
            let series = data.entry(observation.symbol.clone()).or_default();
            if !series.contains_key(&observation.timestamp) {
                series.insert(observation.timestamp, observation.clone());
                inserted += 1;
            }
        }

        Ok(inserted)
    }

    async fn existing_timestamps(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let data = self.observations.read();
        Ok(data
            .get(symbol)
            .map(|series| series.range(start..end).map(|(ts, _)| *ts).collect())
            .unwrap_or_default())
    }

    async fn last_timestamp(&self, symbol: &str) -> Result<Option<DateTime<Utc>>> {
        let data = self.observations.read();
        Ok(data
            .get(symbol)
            .and_then(|series| series.keys().next_back().copied()))
    }

    async fn load_observations(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Observation>> {
        if end <= start {
            return Ok(Vec::new());
        }
        let data = self.observations.read();
        Ok(data
            .get(symbol)
            .map(|series| series.range(start..end).map(|(_, o)| o.clone()).collect())
            .unwrap_or_default())
    }

    async fn latest_observations(&self, symbol: &str, limit: usize) -> Result<Vec<Observation>> {
        let data = self.observations.read();
        Ok(data
            .get(symbol)
            .map(|series| {
                series
                    .values()
                    .rev()
                    .take(limit)
                    .rev()
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count_observations(&self) -> Result<u64> {
        let data = self.observations.read();
        Ok(data.values().map(|series| series.len() as u64).sum())
    }

    async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let data = self.observations.read();
        Ok(data
            .values()
            .filter_map(|series| series.keys().next_back().copied())
            .max())
    }
}

#[async_trait]
impl ModelStore for MemoryStore {
    async fn current(&self, symbol: &str) -> Result<Option<Arc<ModelArtifact>>> {
        Ok(self.current.read().get(symbol).cloned())
    }

    async fn put(&self, artifact: ModelArtifact) -> Result<Arc<ModelArtifact>> {
        let artifact = Arc::new(artifact);

        self.artifacts
            .write()
            .entry(artifact.symbol.clone())
            .or_default()
            .push(artifact.clone());

        self.current
            .write()
            .insert(artifact.symbol.clone(), artifact.clone());

        Ok(artifact)
    }

    async fn history(&self, symbol: &str) -> Result<Vec<ModelArtifact>> {
        Ok(self
            .artifacts
            .read()
            .get(symbol)
            .map(|versions| versions.iter().map(|a| (**a).clone()).collect())
            .unwrap_or_default())
    }

    async fn count_current(&self) -> Result<usize> {
        Ok(self.current.read().len())
    }
}
