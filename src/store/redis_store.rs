use super::{ConsumeOutcome, LimitStore, WindowRecord, WindowView};
use crate::error::{LimitError, Result};
use crate::plan::Resource;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicU64, Ordering};

// Redis-backed store for multi-instance deployments. Windows are sorted sets
// scored by epoch ms; usage counters are plain INCR keys. Window keys carry a
// window-sized TTL so idle subjects expire without a sweeper.
pub struct RedisStore {
    conn: ConnectionManager,
    // disambiguates members recorded in the same millisecond
    seq: AtomicU64,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        Ok(Self {
            conn,
            seq: AtomicU64::new(0),
        })
    }

    fn window_key(key: &str) -> String {
        format!("limits:win:{}", key)
    }

    fn usage_key(tenant: &str, resource: Resource) -> String {
        format!("limits:use:{}:{}", tenant, resource.as_str())
    }

    // ZREMRANGEBYSCORE + ZCARD + oldest member in one round trip
    async fn purge_and_count(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> Result<(u32, Option<i64>)> {
        let mut conn = self.conn.clone();
        // exclusive bound: a stamp exactly window_ms old is still inside
        // [now - window, now] and must survive, matching the memory store
        let (count, oldest): (u32, Vec<(String, i64)>) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({}", now_ms - window_ms))
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;

        Ok((count, oldest.first().map(|(_, score)| *score)))
    }
}

#[async_trait::async_trait]
impl LimitStore for RedisStore {
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        max_requests: u32,
    ) -> Result<WindowRecord> {
        let redis_key = Self::window_key(key);
        let (count, oldest_ms) = self.purge_and_count(&redis_key, now_ms, window_ms).await?;

        if count >= max_requests {
            return Ok(WindowRecord {
                admitted: false,
                count,
                oldest_ms,
            });
        }

        // Second round trip; the gap is the documented (tolerated) race
        // under which concurrent requests may briefly overshoot the quota.
        let member = format!("{}-{}", now_ms, self.seq.fetch_add(1, Ordering::Relaxed));
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("ZADD")
            .arg(&redis_key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&redis_key)
            .arg(window_ms)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(store_err)?;

        Ok(WindowRecord {
            admitted: true,
            count: count + 1,
            oldest_ms: oldest_ms.or(Some(now_ms)),
        })
    }

    async fn observe(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<WindowView> {
        let redis_key = Self::window_key(key);
        let (count, oldest_ms) = self.purge_and_count(&redis_key, now_ms, window_ms).await?;
        Ok(WindowView { count, oldest_ms })
    }

    async fn try_consume(
        &self,
        tenant: &str,
        resource: Resource,
        limit: i64,
    ) -> Result<ConsumeOutcome> {
        let key = Self::usage_key(tenant, resource);
        let mut conn = self.conn.clone();

        let post: i64 = conn.incr(&key, 1).await.map_err(store_err)?;

        if limit >= 0 && post > limit {
            // undo so the counter reflects actual consumption
            let current: i64 = conn.decr(&key, 1).await.map_err(store_err)?;
            return Ok(ConsumeOutcome {
                allowed: false,
                current,
            });
        }

        Ok(ConsumeOutcome {
            allowed: true,
            current: post,
        })
    }

    async fn resource_usage(&self, tenant: &str, resource: Resource) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn
            .get(Self::usage_key(tenant, resource))
            .await
            .map_err(store_err)?;
        Ok(value.unwrap_or(0))
    }

    async fn set_usage(&self, tenant: &str, resource: Resource, value: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(Self::usage_key(tenant, resource), value)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn sweep(&self, _now_ms: i64, _idle_ms: i64) -> Result<usize> {
        // key TTLs handle eviction
        Ok(0)
    }
}

fn store_err(e: redis::RedisError) -> LimitError {
    LimitError::StoreUnavailable(e.to_string())
}
