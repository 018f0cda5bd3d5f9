//! Redis-backed key-value store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};
use tracing::debug;

use crate::application::repos::{KeyValueStore, SetMode, StoreError};

/// Maps a Redis failure on `key` into the store contract.
pub fn map_redis_error(key: &str, err: RedisError) -> StoreError {
    if err.code() == Some("WRONGTYPE") {
        return StoreError::WrongType {
            key: key.to_string(),
        };
    }
    if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        return StoreError::unavailable(err);
    }
    StoreError::query(err)
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Shared auto-reconnecting connection for ordinary commands. Blocking pops open their
/// own connection so they never stall commands queued behind them.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }

    pub async fn health_check(&self) -> Result<(), RedisError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(key, err))
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(&keys[0], err))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        mode: SetMode,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if mode == SetMode::IfAbsent {
            cmd.arg("NX");
        }
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }

        let mut conn = self.conn.clone();
        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(key, err))?;
        Ok(reply.is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let remaining: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(key, err))?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(key, err))?;
        Ok(updated == 1)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(&keys[0], err))
    }

    async fn push_left(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(key, err))
    }

    async fn push_right(&self, key: &str, value: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(key, err))
    }

    async fn blocking_pop_right(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError> {
        let Some(first) = keys.first() else {
            return Ok(None);
        };

        if timeout.is_zero() {
            let mut conn = self.conn.clone();
            for key in keys {
                let popped: Option<String> = redis::cmd("RPOP")
                    .arg(key)
                    .query_async(&mut conn)
                    .await
                    .map_err(|err| map_redis_error(key, err))?;
                if let Some(value) = popped {
                    return Ok(Some((key.clone(), value)));
                }
            }
            return Ok(None);
        }

        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| map_redis_error(first, err))?;
        debug!(keys = keys.len(), timeout_ms = millis(timeout), "blocking pop");
        redis::cmd("BRPOP")
            .arg(keys)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(|err| map_redis_error(first, err))
    }
}
