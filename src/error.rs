use thiserror::Error;

/// Errors surfaced by the pipeline
///
/// Store variants are fatal to a collection or training run. Everything else is
/// isolated to the symbol that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("training failed: {0}")]
    Training(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl Error {
    /// True when the Range Store or Model Store itself is unusable
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::Database(_) | Error::Migration(_)
        )
    }
}
