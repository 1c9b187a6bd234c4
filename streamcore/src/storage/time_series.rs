//! Time-series storage on top of sorted sets: a single-threaded
//! buffered batcher for writes, and read-side range/latest queries.

use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;

use crate::error::StreamResult;
use crate::storage::kv_store::PipelineOp;
use crate::storage::redis_store::ResilientRedisClient;

struct Pending {
    key: String,
    timestamp: f64,
    payload: String,
}

/// Buffers writes and flushes them as one pipelined round trip once
/// `pipeline_batch` entries accumulate (or on an explicit `flush`).
pub struct TimeSeriesWriter {
    client: Arc<ResilientRedisClient>,
    batch_size: usize,
    retention_ms: f64,
    pending: Mutex<Vec<Pending>>,
}

impl TimeSeriesWriter {
    pub fn new(client: Arc<ResilientRedisClient>, batch_size: usize, retention_ms: i64) -> Self {
        Self {
            client,
            batch_size,
            retention_ms: retention_ms as f64,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Buffer a write; flushes automatically once the batch fills.
    pub async fn write(&self, key: &str, timestamp: f64, data: &Value) -> StreamResult<()> {
        let payload = serde_json::to_string(data)?;
        let should_flush = {
            let mut pending = self.pending.lock().unwrap();
            pending.push(Pending {
                key: key.to_string(),
                timestamp,
                payload,
            });
            pending.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Execute all pending writes as one pipeline: one `ZADD` per
    /// pending entry, then one `ZREMRANGEBYSCORE` per distinct
    /// `ts:<key>` touched in this flush.
    pub async fn flush(&self) -> StreamResult<()> {
        let entries = {
            let mut pending = self.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if entries.is_empty() {
            return Ok(());
        }

        let mut ops = Vec::with_capacity(entries.len() * 2);
        let mut max_ts_per_key: std::collections::HashMap<String, f64> =
            std::collections::HashMap::new();

        for entry in &entries {
            let ts_key = format!("ts:{}", entry.key);
            ops.push(PipelineOp::ZAdd {
                key: ts_key.clone(),
                score: entry.timestamp,
                member: entry.payload.clone(),
            });
            let max = max_ts_per_key.entry(ts_key).or_insert(0.0);
            if entry.timestamp > *max {
                *max = entry.timestamp;
            }
        }

        for (ts_key, max_ts) in max_ts_per_key {
            ops.push(PipelineOp::ZRemRangeByScore {
                key: ts_key,
                min: f64::NEG_INFINITY,
                max: max_ts - self.retention_ms,
            });
        }

        self.client
            .execute_with_retry(|store| {
                let ops = ops.clone();
                async move { store.pipeline(ops).await }
            })
            .await
    }
}

/// Read-side queries for time-series data stored in sorted sets.
pub struct TimeSeriesReader {
    client: Arc<ResilientRedisClient>,
}

impl TimeSeriesReader {
    pub fn new(client: Arc<ResilientRedisClient>) -> Self {
        Self { client }
    }

    /// Query `[start, end]` and deterministically downsample by
    /// stride when more than `max_points` survive (skipping, not
    /// averaging).
    pub async fn get_range(
        &self,
        key: &str,
        start: f64,
        end: f64,
        max_points: usize,
    ) -> StreamResult<Vec<Value>> {
        let ts_key = format!("ts:{key}");
        let raw = self
            .client
            .execute_with_retry(|store| {
                let ts_key = ts_key.clone();
                async move { store.zrangebyscore(&ts_key, start, end).await }
            })
            .await?;

        let mut results: Vec<Value> = raw
            .into_iter()
            .map(|(payload, score)| {
                let mut data: Value =
                    serde_json::from_str(&payload).unwrap_or(Value::Null);
                if let Value::Object(ref mut map) = data {
                    map.insert("_timestamp".to_string(), serde_json::json!(score));
                }
                data
            })
            .collect();

        if results.len() > max_points {
            let step = results.len() / max_points;
            results = results.into_iter().step_by(step.max(1)).collect();
        }
        Ok(results)
    }

    pub async fn get_latest(&self, key: &str) -> StreamResult<Option<Value>> {
        let ts_key = format!("ts:{key}");
        let raw = self
            .client
            .execute_with_retry(|store| {
                let ts_key = ts_key.clone();
                async move { store.zrevrange(&ts_key, 0, 0).await }
            })
            .await?;
        let Some((payload, score)) = raw.into_iter().next() else {
            return Ok(None);
        };
        let mut data: Value = serde_json::from_str(&payload).unwrap_or(Value::Null);
        if let Value::Object(ref mut map) = data {
            map.insert("_timestamp".to_string(), serde_json::json!(score));
        }
        Ok(Some(data))
    }

    /// Approximate count of time-series keys; racy under concurrent
    /// mutation (§9 open question), documented rather than removed.
    pub async fn get_key_count(&self) -> StreamResult<usize> {
        self.client
            .execute_with_retry(|store| async move { store.scan_count("ts:*").await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv_store::InMemoryStore;
    use std::sync::Arc;

    fn client() -> Arc<ResilientRedisClient> {
        Arc::new(ResilientRedisClient::new(Arc::new(InMemoryStore::new())))
    }

    #[tokio::test]
    async fn flush_empties_pending_buffer() {
        let client = client();
        let writer = TimeSeriesWriter::new(client.clone(), 50, 86_400_000);
        writer
            .write("iot:temperature:d1", 1000.0, &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let reader = TimeSeriesReader::new(client);
        let latest = reader.get_latest("iot:temperature:d1").await.unwrap();
        assert!(latest.is_some());
    }

    #[tokio::test]
    async fn auto_flush_on_batch_full() {
        let client = client();
        let writer = TimeSeriesWriter::new(client.clone(), 2, 86_400_000);
        writer
            .write("k", 1.0, &serde_json::json!({"v": 1}))
            .await
            .unwrap();
        writer
            .write("k", 2.0, &serde_json::json!({"v": 2}))
            .await
            .unwrap();
        // Batch size 2 triggers an automatic flush; a fresh reader
        // should already see the latest entry.
        let reader = TimeSeriesReader::new(client);
        let latest = reader.get_latest("k").await.unwrap().unwrap();
        assert_eq!(latest["v"], 2);
    }

    #[tokio::test]
    async fn get_range_downsamples_deterministically() {
        let client = client();
        let writer = TimeSeriesWriter::new(client.clone(), 100, 86_400_000);
        for i in 0..20 {
            writer
                .write("k", i as f64, &serde_json::json!({"i": i}))
                .await
                .unwrap();
        }
        writer.flush().await.unwrap();
        let reader = TimeSeriesReader::new(client);
        let range = reader.get_range("k", 0.0, 20.0, 5).await.unwrap();
        assert!(range.len() <= 5);
    }
}
