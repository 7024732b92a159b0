//! sqlite-backed alias store. Exactly one connection per backend instance -
//! the concurrency model gives every worker its own store handle rather than
//! pooling, so a plain mutex around a single `rusqlite::Connection` is
//! enough; the blocking sqlite calls are shipped off to
//! `tokio::task::spawn_blocking` so they never stall the async runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;

use crate::error::StoreError;
use crate::AliasStore;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                k TEXT NOT NULL UNIQUE ON CONFLICT REPLACE,
                v TEXT NOT NULL,
                lt INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS ltidx ON kv (lt);",
        )?;
        Ok(SqliteStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl AliasStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn.prepare_cached("SELECT v FROM kv WHERE k = ?1")?;
            let mut rows = stmt.query([&key])?;
            match rows.next()? {
                Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                None => Ok(None),
            }
        })
        .await?
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = now_unix() + ttl.as_secs() as i64;
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            // Relies on the UNIQUE ... ON CONFLICT REPLACE constraint rather
            // than a literal REPLACE INTO, matching the reference schema.
            conn.execute(
                "INSERT INTO kv (k, v, lt) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, value, expires_at],
            )?;
            Ok(())
        })
        .await?
    }

    async fn expire(&self) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let cutoff = now_unix();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute("DELETE FROM kv WHERE lt <= ?1", [cutoff])?;
            Ok(())
        })
        .await?
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.put("k1", "v1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some("v1".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_replaces_existing_key() {
        let store = SqliteStore::open(":memory:").unwrap();
        store.put("k1", "v1", Duration::from_secs(60)).await.unwrap();
        store.put("k1", "v2", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some("v2".to_string()));
    }

    #[tokio::test]
    async fn expire_drops_old_rows() {
        let store = SqliteStore::open(":memory:").unwrap();
        store
            .put("stale", "v1", Duration::from_secs(0))
            .await
            .unwrap();
        // make sure `now` has moved past the expiry.
        tokio::time::sleep(Duration::from_millis(1100)).await;
        store.expire().await.unwrap();
        assert_eq!(store.get("stale").await.unwrap(), None);
    }
}
