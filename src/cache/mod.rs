pub mod mirror;
pub mod redis;

pub use mirror::{FileMirror, PredictionMirror};
pub use redis::RedisMirror;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{CachedPrediction, Forecast};
use crate::Result;

/// Ordered projection of every valid entry at build time
#[derive(Debug, Clone)]
struct TopNView {
    entries: Vec<CachedPrediction>,
    expires_at: DateTime<Utc>,
}

impl TopNView {
    fn build(entries: &HashMap<String, CachedPrediction>, now: DateTime<Utc>) -> Option<Self> {
        let mut ranked: Vec<CachedPrediction> = entries
            .values()
            .filter(|e| e.is_valid_at(now))
            .cloned()
            .collect();

        let expires_at = ranked.iter().map(|e| e.expires_at()).min()?;
        ranked.sort_by(rank_order);

        Some(Self {
            entries: ranked,
            expires_at,
        })
    }
}

/// Highest predicted change first, symbol breaks ties
pub(crate) fn rank_order(a: &CachedPrediction, b: &CachedPrediction) -> Ordering {
    b.predicted_change
        .total_cmp(&a.predicted_change)
        .then_with(|| a.symbol.cmp(&b.symbol))
}

/// Latest prediction per symbol with TTL and a materialized Top-N view
///
/// Stores and expires only; generating a missing prediction is up to the
/// caller. The in-memory layer is authoritative for unexpired entries and the
/// mirror is read only on a miss.
pub struct PredictionCache {
    entries: RwLock<HashMap<String, CachedPrediction>>,
    top_n: RwLock<Option<TopNView>>,
    mirror: Option<Arc<dyn PredictionMirror>>,
}

impl PredictionCache {
    pub fn new(mirror: Option<Arc<dyn PredictionMirror>>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            top_n: RwLock::new(None),
            mirror,
        }
    }

    /// Cache with no persistent mirror
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    /// Valid entry for `symbol`, promoting a mirror hit into memory
    pub async fn get(&self, symbol: &str) -> Option<CachedPrediction> {
        let now = Utc::now();

        if let Some(entry) = self.entries.read().get(symbol) {
            if entry.is_valid_at(now) {
                return Some(entry.clone());
            }
        }

        let mirror = self.mirror.as_ref()?;
        let entry = match mirror.load(symbol).await {
            Ok(Some(entry)) if entry.is_valid_at(now) => entry,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Prediction mirror read failed: {}", e);
                return None;
            }
        };

        tracing::debug!(symbol = %symbol, "Promoting prediction from {} mirror", mirror.name());
        self.entries
            .write()
            .insert(entry.symbol.clone(), entry.clone());
        self.rebuild_view();

        Some(entry)
    }

    /// Cache a fresh forecast for `symbol`, valid for `ttl` from now
    pub async fn set(&self, symbol: &str, forecast: &Forecast, ttl: Duration) -> CachedPrediction {
        let entry = CachedPrediction::from_forecast(symbol, forecast, Utc::now(), ttl);
        self.insert(entry.clone()).await;
        entry
    }

    /// Cache a prediction as given, replacing any entry for the symbol
    ///
    /// A mirror failure is logged and does not fail the write.
    pub async fn insert(&self, entry: CachedPrediction) {
        self.entries
            .write()
            .insert(entry.symbol.clone(), entry.clone());
        self.rebuild_view();

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.store(&entry).await {
                tracing::warn!(
                    symbol = %entry.symbol,
                    "Failed to mirror prediction to {}: {}",
                    mirror.name(),
                    e
                );
            }
        }
    }

    /// First `n` entries of the Top-N view, or `None` once the view expired
    pub fn get_top_n(&self, n: usize) -> Option<Vec<CachedPrediction>> {
        self.get_top_n_covering(n, &[])
    }

    /// Like [`get_top_n`](Self::get_top_n), but only when the view holds
    /// every one of `symbols`
    pub fn get_top_n_covering(&self, n: usize, symbols: &[String]) -> Option<Vec<CachedPrediction>> {
        let view = self.top_n.read();
        let view = view.as_ref()?;

        if view.expires_at < Utc::now() {
            return None;
        }

        let covered = symbols
            .iter()
            .all(|symbol| view.entries.iter().any(|e| &e.symbol == symbol));
        if !covered {
            return None;
        }

        Some(view.entries.iter().take(n).cloned().collect())
    }

    pub async fn invalidate(&self, symbol: &str) {
        let removed = self.entries.write().remove(symbol).is_some();
        if removed {
            self.rebuild_view();
        }

        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.remove(symbol).await {
                tracing::warn!(symbol = %symbol, "Failed to remove mirrored prediction: {}", e);
            }
        }
    }

    /// Number of unexpired entries in memory
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .read()
            .values()
            .filter(|e| e.is_valid_at(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries still resident in memory
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut entries = self.entries.write();
            let before = entries.len();
            entries.retain(|_, e| e.is_valid_at(now));
            before - entries.len()
        };

        if removed > 0 {
            self.rebuild_view();
            tracing::debug!("Purged {} expired predictions", removed);
        }
        removed
    }

    /// Load unexpired mirror entries into memory at cold start
    pub async fn warm_from_mirror(&self) -> Result<usize> {
        let Some(mirror) = &self.mirror else {
            return Ok(0);
        };

        let now = Utc::now();
        let loaded: Vec<CachedPrediction> = mirror
            .load_all()
            .await?
            .into_iter()
            .filter(|e| e.is_valid_at(now))
            .collect();

        let count = loaded.len();
        {
            let mut entries = self.entries.write();
            for entry in loaded {
                // Never overwrite something newer already in memory
                let newer_in_memory = entries
                    .get(&entry.symbol)
                    .is_some_and(|current| current.generated_at >= entry.generated_at);
                if !newer_in_memory {
                    entries.insert(entry.symbol.clone(), entry);
                }
            }
        }
        self.rebuild_view();

        tracing::info!("Warmed prediction cache with {} entries from {}", count, mirror.name());
        Ok(count)
    }

    // Holding the view lock across the snapshot keeps concurrent rebuilds
    // from publishing an older one last
    fn rebuild_view(&self) {
        let mut view = self.top_n.write();
        *view = TopNView::build(&self.entries.read(), Utc::now());
    }
}

impl Default for PredictionCache {
    fn default() -> Self {
        Self::in_memory()
    }
}
