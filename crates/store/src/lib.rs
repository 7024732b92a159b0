//! The alias store: a pluggable key/value backend with TTL expiry, used by
//! the `original-envelope = database` indirection mode to remember the true
//! original address out-of-band instead of embedding it in the rewritten
//! one.

pub mod error;
#[cfg(feature = "redis")]
pub mod redis_backend;
#[cfg(feature = "sqlite")]
pub mod sqlite_backend;

use std::time::Duration;

use async_trait::async_trait;

pub use error::StoreError;

#[async_trait]
pub trait AliasStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    /// Sweeps expired entries. A no-op for backends with native TTL.
    async fn expire(&self) -> Result<(), StoreError>;
}

/// Opens an alias store from a `sqlite:` or `redis:` URI, dispatching on
/// scheme exactly as the reference implementation's `database_connect` does.
pub async fn connect(uri: &str) -> Result<Box<dyn AliasStore>, StoreError> {
    #[cfg(feature = "sqlite")]
    if let Some(path) = uri.strip_prefix("sqlite:") {
        return Ok(Box::new(sqlite_backend::SqliteStore::open(path)?));
    }
    #[cfg(feature = "redis")]
    if uri.starts_with("redis:") {
        return Ok(Box::new(redis_backend::RedisStore::connect(uri).await?));
    }
    Err(StoreError::UnsupportedUri(uri.to_string()))
}
