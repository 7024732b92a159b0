use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported alias store uri '{0}'")]
    UnsupportedUri(String),
    #[error("sqlite error: {0}")]
    #[cfg(feature = "sqlite")]
    Sqlite(#[from] rusqlite::Error),
    #[error("redis error: {0}")]
    #[cfg(feature = "redis")]
    Redis(#[from] redis::RedisError),
    #[error("backend task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}
