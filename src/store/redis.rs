use super::CacheStore;
use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Keys requested per SCAN iteration
const SCAN_BATCH: usize = 500;

/// Keys removed per DEL command
const DEL_BATCH: usize = 500;

/// Redis-backed shared store
#[derive(Clone)]
pub struct RedisStore {
    /// Redis connection manager (reconnects transparently)
    connection: ConnectionManager,
    /// Upper bound for every store call
    op_timeout: Duration,
}

impl RedisStore {
    /// Open a connection and verify it with a PING
    pub async fn connect(redis_url: &str, op_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = match tokio::time::timeout(op_timeout * 4, ConnectionManager::new(client))
            .await
        {
            Ok(conn) => conn?,
            Err(_) => return Err(StoreError::Timeout(op_timeout * 4)),
        };

        let store = Self {
            connection,
            op_timeout,
        };
        store.ping().await?;

        debug!("Successfully connected to Redis at {}", redis_url);
        Ok(store)
    }

    /// Run a store call under the configured timeout
    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("PING")
                .query_async::<_, String>(&mut conn)
                .await
                .map(|_| ())
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("GET")
                .arg(key)
                .query_async::<_, Option<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        self.bounded(async move {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl_ms)
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let mut removed = 0;
        for chunk in keys.chunks(DEL_BATCH) {
            let mut conn = self.connection.clone();
            removed += self
                .bounded(async move {
                    redis::cmd("DEL")
                        .arg(chunk)
                        .query_async::<_, u64>(&mut conn)
                        .await
                })
                .await?;
        }
        Ok(removed)
    }

    async fn incr_with_pttl(&self, key: &str) -> StoreResult<(i64, i64)> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::pipe()
                .cmd("INCR")
                .arg(key)
                .cmd("PTTL")
                .arg(key)
                .query_async::<_, (i64, i64)>(&mut conn)
                .await
        })
        .await
    }

    async fn pexpire(&self, key: &str, ttl_ms: i64) -> StoreResult<bool> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_ms)
                .query_async::<_, bool>(&mut conn)
                .await
        })
        .await
    }

    async fn pttl(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("PTTL")
                .arg(key)
                .query_async::<_, i64>(&mut conn)
                .await
        })
        .await
    }

    async fn zpurge_and_count(&self, key: &str, min_score: i64) -> StoreResult<u64> {
        let mut conn = self.connection.clone();
        // "(" makes the upper bound exclusive: entries scored exactly at
        // `min_score` stay in the window.
        let max = format!("({}", min_score);
        self.bounded(async move {
            redis::pipe()
                .cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg("-inf")
                .arg(max)
                .ignore()
                .cmd("ZCARD")
                .arg(key)
                .query_async::<_, (u64,)>(&mut conn)
                .await
                .map(|(count,)| count)
        })
        .await
    }

    async fn zadd_with_pexpire(
        &self,
        key: &str,
        score: i64,
        member: &str,
        ttl_ms: i64,
    ) -> StoreResult<()> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::pipe()
                .cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_ms)
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await
        })
        .await
    }

    async fn zmembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection.clone();
        self.bounded(async move {
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query_async::<_, Vec<String>>(&mut conn)
                .await
        })
        .await
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut conn = self.connection.clone();
            let (next, batch) = self
                .bounded(async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async::<_, (u64, Vec<String>)>(&mut conn)
                        .await
                })
                .await?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running Redis instance
    // They are ignored by default. Run with: cargo test -- --ignored

    async fn create_test_store() -> RedisStore {
        RedisStore::connect("redis://127.0.0.1:6379", Duration::from_millis(500))
            .await
            .expect("Failed to connect to Redis")
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_counter_ttl() {
        let store = create_test_store().await;
        let key = format!("clubguard-test:counter:{}", rand::random::<u32>());

        let (count, ttl) = store.incr_with_pttl(&key).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(ttl, -1);

        assert!(store.pexpire(&key, 60_000).await.unwrap());
        let (count, ttl) = store.incr_with_pttl(&key).await.unwrap();
        assert_eq!(count, 2);
        assert!(ttl > 0 && ttl <= 60_000);

        store.del(&[key]).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_sorted_window() {
        let store = create_test_store().await;
        let key = format!("clubguard-test:window:{}", rand::random::<u32>());

        store.zadd_with_pexpire(&key, 0, "a", 60_000).await.unwrap();
        store.zadd_with_pexpire(&key, 59_999, "b", 60_000).await.unwrap();

        let count = store.zpurge_and_count(&key, 1).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.zmembers(&key).await.unwrap(), vec!["b".to_string()]);

        store.del(&[key]).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_scan_and_delete() {
        let store = create_test_store().await;
        let prefix = format!("clubguard-test:scan:{}:", rand::random::<u32>());

        for i in 0..3 {
            store
                .set_ex(&format!("{}{}", prefix, i), "v", Duration::from_secs(60))
                .await
                .unwrap();
        }

        let keys = store
            .scan_keys(&crate::store::prefix_pattern(&prefix))
            .await
            .unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(store.del(&keys).await.unwrap(), 3);
    }
}
