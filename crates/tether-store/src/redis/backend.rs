//! Redis implementation of the store gateway.
//!
//! Compound operations (append+trim+expire, read+delete drain, two-sided
//! set updates) are pipelined into single round trips; the drain and set
//! updates additionally run under MULTI/EXEC so the room-index invariant
//! and destructive-drain semantics hold against concurrent callers.

use crate::backend::{StoreBackend, Subscription};
use crate::error::StoreResult;
use crate::redis::pool::{RedisPool, RedisPoolConfig};
use crate::redis::pubsub::{PubSubListener, PubSubListenerConfig};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;

fn ttl_secs(ttl: Duration) -> i64 {
    ttl.as_secs().max(1) as i64
}

/// Redis-backed store gateway
pub struct RedisStore {
    pool: RedisPool,
    listener: PubSubListener,
}

impl RedisStore {
    /// Create a pool and pub/sub listener against the same Redis instance
    pub fn new(config: RedisPoolConfig) -> StoreResult<Self> {
        let listener = PubSubListener::new(PubSubListenerConfig {
            redis_url: config.url.clone(),
            ..PubSubListenerConfig::default()
        })?;
        let pool = RedisPool::new(config)?;
        Ok(Self { pool, listener })
    }

    /// Create a Redis store from tether-common config
    pub fn from_config(config: &tether_common::RedisConfig) -> StoreResult<Self> {
        Self::new(RedisPoolConfig::from(config))
    }

    /// Build from separately configured parts
    #[must_use]
    pub fn with_parts(pool: RedisPool, listener: PubSubListener) -> Self {
        Self { pool, listener }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool", &self.pool)
            .field("listener", &self.listener)
            .finish()
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.pool.get().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        match ttl {
            Some(t) => {
                conn.set_ex::<_, _, ()>(key, value, t.as_secs().max(1)).await?;
            }
            None => {
                conn.set::<_, _, ()>(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let deleted: i32 = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        let refreshed: bool = conn.expire(key, ttl_secs(ttl)).await?;
        Ok(refreshed)
    }

    async fn list_append(
        &self,
        key: &str,
        value: &str,
        max_len: Option<usize>,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.rpush(key, value).ignore();
        if let Some(max) = max_len {
            pipe.ltrim(key, -(max as isize), -1).ignore();
        }
        if let Some(t) = ttl {
            pipe.expire(key, ttl_secs(t)).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn list_drain(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let (items, _deleted): (Vec<String>, i32) = redis::pipe()
            .atomic()
            .lrange(key, 0, -1)
            .del(key)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.pool.get().await?;
        let len: usize = conn.llen(key).await?;
        Ok(len)
    }

    async fn set_update(
        &self,
        add: &[(String, String)],
        remove: &[(String, String)],
    ) -> StoreResult<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, member) in add {
            pipe.sadd(key, member).ignore();
        }
        for (key, member) in remove {
            pipe.srem(key, member).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<usize> {
        let mut conn = self.pool.get().await?;
        let receivers: i64 = conn.publish(channel, payload).await?;
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
        self.listener.subscribe(channel)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.pool.health_check().await
    }
}
