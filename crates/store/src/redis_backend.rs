//! redis-backed alias store. Keys are prefixed `PostSRSd/` to share a redis
//! instance safely with other tenants; expiry is native (`SETEX`), so
//! `expire()` is a no-op here - redis already drops the key itself.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::AliasStore;

const KEY_PREFIX: &str = "PostSRSd/";

pub struct RedisStore {
    conn: Mutex<redis::aio::MultiplexedConnection>,
}

impl RedisStore {
    pub async fn connect(uri: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(to_redis_url(uri))?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(RedisStore {
            conn: Mutex::new(conn),
        })
    }
}

/// Translates the daemon's own `redis:<host>:<port>` / `redis:<unix-path>`
/// endpoint spelling (a single colon after the scheme, per §4.5) into the
/// `redis://`/`redis+unix://` URL the `redis` crate's `Client::open` expects.
/// A trailing `:<port>` whose suffix is all digits is treated as
/// `host:port`; anything else (a leading `/`, or no trailing numeric port)
/// is treated as a unix-socket path.
fn to_redis_url(uri: &str) -> String {
    let rest = uri.strip_prefix("redis:").unwrap_or(uri);
    if let Some((host, port)) = rest.rsplit_once(':') {
        if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() {
            return format!("redis://{host}:{port}");
        }
    }
    format!("redis+unix://{rest}")
}

#[cfg(test)]
mod uri_tests {
    use super::to_redis_url;

    #[test]
    fn host_port_form_becomes_a_redis_url() {
        assert_eq!(to_redis_url("redis:localhost:6379"), "redis://localhost:6379");
    }

    #[test]
    fn bare_path_form_becomes_a_unix_url() {
        assert_eq!(
            to_redis_url("redis:/var/run/redis.sock"),
            "redis+unix:///var/run/redis.sock"
        );
    }
}

#[async_trait]
impl AliasStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.lock().await;
        let value: Option<String> = conn.get(format!("{KEY_PREFIX}{key}")).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let _: () = conn
            .set_ex(format!("{KEY_PREFIX}{key}"), value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn expire(&self) -> Result<(), StoreError> {
        // redis already expires keys natively via SETEX.
        Ok(())
    }
}
