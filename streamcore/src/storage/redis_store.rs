//! `ResilientRedisClient` wraps any `KvStore` with circuit-breaker
//! protection and exponential-backoff retry, generalized from
//! `streaming::worker_pool::StreamingWorkerPool`'s backpressure
//! circuit breaker to the storage-retry use named in spec §4.5. A real
//! `redis`-backed `KvStore` impl lives at the bottom of this file.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::{StreamCoreError, StreamResult};
use crate::storage::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::storage::kv_store::{KvStore, PipelineOp};

pub const REDIS_MAX_RETRIES: u32 = 3;

/// Storage client wrapper with circuit breaker and retry logic over
/// any `KvStore` implementation.
pub struct ResilientRedisClient {
    inner: Arc<dyn KvStore>,
    circuit: Mutex<CircuitBreaker>,
}

impl ResilientRedisClient {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self {
            inner,
            circuit: Mutex::new(CircuitBreaker::default()),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.lock().unwrap().state()
    }

    /// Execute `op` against the inner store, with circuit-breaker
    /// gating and up to `REDIS_MAX_RETRIES` attempts on failure,
    /// backing off `0.1 * 2^attempt` seconds between tries.
    pub async fn execute_with_retry<F, Fut, T>(&self, op: F) -> StreamResult<T>
    where
        F: Fn(Arc<dyn KvStore>) -> Fut,
        Fut: Future<Output = StreamResult<T>>,
    {
        {
            let mut circuit = self.circuit.lock().unwrap();
            if !circuit.can_execute() {
                return Err(StreamCoreError::CircuitOpen);
            }
        }

        let mut last_error = None;
        for attempt in 0..REDIS_MAX_RETRIES {
            match op(self.inner.clone()).await {
                Ok(value) => {
                    self.circuit.lock().unwrap().record_success();
                    return Ok(value);
                }
                Err(err) => {
                    self.circuit.lock().unwrap().record_failure();
                    last_error = Some(err);
                    if attempt + 1 < REDIS_MAX_RETRIES {
                        let backoff = Duration::from_secs_f64(0.1 * 2f64.powi(attempt as i32));
                        warn!(attempt = attempt + 1, ?backoff, "storage_retry");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_error.unwrap())
    }

    pub async fn ping(&self) -> bool {
        self.execute_with_retry(|store| async move { store.ping().await })
            .await
            .is_ok()
    }
}

/// Real Redis-backed `KvStore`, using a pooled async connection
/// manager (`redis`'s `tokio-comp` + `connection-manager` features).
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> StreamResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StreamResult<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn lpush(&self, key: &str, value: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        conn.ltrim::<_, ()>(key, start as isize, stop as isize)
            .await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StreamResult<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start as isize, stop as isize).await?)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StreamResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrangebyscore_withscores(key, min, max).await?)
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> StreamResult<Vec<(String, f64)>> {
        let mut conn = self.conn.clone();
        Ok(conn
            .zrevrange_withscores(key, start as isize, stop as isize)
            .await?)
    }

    async fn zremrangebyscore(&self, key: &str, min: f64, max: f64) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        conn.zrembyscore::<_, _, _, ()>(key, min, max).await?;
        Ok(())
    }

    async fn zincrby(&self, key: &str, score: f64, member: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        conn.zincr::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    async fn pipeline(&self, ops: Vec<PipelineOp>) -> StreamResult<()> {
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                PipelineOp::ZAdd { key, score, member } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                PipelineOp::ZRemRangeByScore { key, min, max } => {
                    pipe.zrembyscore(key, *min, *max).ignore();
                }
                PipelineOp::LPush { key, value } => {
                    pipe.lpush(key, value).ignore();
                }
                PipelineOp::LTrim { key, start, stop } => {
                    pipe.ltrim(key, *start as isize, *stop as isize).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn scan_count(&self, pattern: &str) -> StreamResult<usize> {
        let mut conn = self.conn.clone();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        let mut count = 0usize;
        use futures::StreamExt;
        while iter.next().await.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv_store::InMemoryStore;

    #[tokio::test]
    async fn circuit_opens_after_repeated_failures() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_calls(10);
        let client = ResilientRedisClient::new(store);

        for _ in 0..2 {
            let res = client
                .execute_with_retry(|s| async move { s.ping().await })
                .await;
            assert!(res.is_err());
        }
        assert_eq!(client.circuit_state(), CircuitState::Open);

        let res = client
            .execute_with_retry(|s| async move { s.ping().await })
            .await;
        assert!(matches!(res, Err(StreamCoreError::CircuitOpen)));
    }

    #[tokio::test]
    async fn succeeds_and_resets_after_transient_failure() {
        let store = Arc::new(InMemoryStore::new());
        store.fail_next_calls(1);
        let client = ResilientRedisClient::new(store);
        let res = client
            .execute_with_retry(|s| async move { s.ping().await })
            .await;
        assert!(res.is_ok());
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }
}
