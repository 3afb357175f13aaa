use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::models::CachedPrediction;
use crate::Result;

/// Persistent copy of the prediction cache
///
/// Consulted only on an in-memory miss or at cold start. Stores entries as
/// written; expiry is judged by the reader.
#[async_trait]
pub trait PredictionMirror: Send + Sync {
    async fn store(&self, entry: &CachedPrediction) -> Result<()>;

    async fn load(&self, symbol: &str) -> Result<Option<CachedPrediction>>;

    async fn load_all(&self) -> Result<Vec<CachedPrediction>>;

    async fn remove(&self, symbol: &str) -> Result<()>;

    fn name(&self) -> &str;
}

/// Mirror backed by a single JSON file
///
/// Writes go to a temporary file that is then renamed over the original, so
/// a crash mid-write leaves the previous contents intact.
pub struct FileMirror {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileMirror {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, CachedPrediction>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, entries: &BTreeMap<String, CachedPrediction>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl PredictionMirror for FileMirror {
    async fn store(&self, entry: &CachedPrediction) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(entry.symbol.clone(), entry.clone());
        self.write_all(&entries).await
    }

    async fn load(&self, symbol: &str) -> Result<Option<CachedPrediction>> {
        let _guard = self.write_lock.lock().await;
        Ok(self.read_all().await?.remove(symbol))
    }

    async fn load_all(&self) -> Result<Vec<CachedPrediction>> {
        let _guard = self.write_lock.lock().await;
        Ok(self.read_all().await?.into_values().collect())
    }

    async fn remove(&self, symbol: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        if entries.remove(symbol).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("pricecast-test-{}", Uuid::new_v4()))
            .join("predictions.json")
    }

    fn entry(symbol: &str, predicted_value: f64) -> CachedPrediction {
        CachedPrediction {
            symbol: symbol.to_string(),
            current_price: 100.0,
            predicted_value,
            predicted_change: (predicted_value - 100.0) / 100.0,
            confidence: 0.7,
            generated_at: Utc::now(),
            ttl_secs: 3600,
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let mirror = FileMirror::new(temp_path());
        assert!(mirror.load_all().await.unwrap().is_empty());
        assert!(mirror.load("BTC").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_load_remove() {
        let path = temp_path();
        let mirror = FileMirror::new(&path);

        mirror.store(&entry("BTC", 101.0)).await.unwrap();
        mirror.store(&entry("ETH", 99.0)).await.unwrap();
        // Replaces the earlier BTC entry
        mirror.store(&entry("BTC", 103.0)).await.unwrap();

        let btc = mirror.load("BTC").await.unwrap().unwrap();
        assert_eq!(btc.predicted_value, 103.0);
        assert_eq!(mirror.load_all().await.unwrap().len(), 2);

        mirror.remove("BTC").await.unwrap();
        assert!(mirror.load("BTC").await.unwrap().is_none());

        // A fresh mirror over the same file sees the persisted state
        let reopened = FileMirror::new(&path);
        let all = reopened.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].symbol, "ETH");

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
