//! Real-time metrics cache: latest-value hashes, a bounded alert list,
//! a purchases leaderboard, and the dashboard pub/sub publisher.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::error::StreamResult;
use crate::storage::kv_store::PipelineOp;
use crate::storage::redis_store::ResilientRedisClient;

const LATEST_IOT_KEY: &str = "metrics:iot:latest";
const LATEST_ACTIVITY_KEY: &str = "metrics:activity:latest";
const ALERTS_KEY: &str = "alerts:anomalies";
const LEADERBOARD_KEY: &str = "rank:activity:purchases";
const DASHBOARD_CHANNEL: &str = "channel:dashboard_updates";
const MAX_ALERTS: i64 = 100;

pub struct MetricsCache {
    client: Arc<ResilientRedisClient>,
}

impl MetricsCache {
    pub fn new(client: Arc<ResilientRedisClient>) -> Self {
        Self { client }
    }

    pub async fn update_iot_latest(&self, device_id: &str, data: &Value) -> StreamResult<()> {
        let payload = serde_json::to_string(data)?;
        self.client
            .execute_with_retry(|store| {
                let payload = payload.clone();
                async move { store.hset(LATEST_IOT_KEY, device_id, &payload).await }
            })
            .await
    }

    pub async fn update_activity_latest(
        &self,
        event_type: &str,
        data: &Value,
    ) -> StreamResult<()> {
        let payload = serde_json::to_string(data)?;
        self.client
            .execute_with_retry(|store| {
                let payload = payload.clone();
                async move { store.hset(LATEST_ACTIVITY_KEY, event_type, &payload).await }
            })
            .await
    }

    pub async fn get_iot_latest(&self) -> StreamResult<HashMap<String, Value>> {
        self.get_latest_hash(LATEST_IOT_KEY).await
    }

    pub async fn get_activity_latest(&self) -> StreamResult<HashMap<String, Value>> {
        self.get_latest_hash(LATEST_ACTIVITY_KEY).await
    }

    async fn get_latest_hash(&self, key: &'static str) -> StreamResult<HashMap<String, Value>> {
        let raw = self
            .client
            .execute_with_retry(|store| async move { store.hgetall(key).await })
            .await?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| (k, serde_json::from_str(&v).unwrap_or(Value::Null)))
            .collect())
    }

    /// `LPUSH` then `LTRIM 0, MAX_ALERTS-1` in one pipeline.
    pub async fn push_alert<T: Serialize>(&self, alert: &T) -> StreamResult<()> {
        let payload = serde_json::to_string(alert)?;
        let ops = vec![
            PipelineOp::LPush {
                key: ALERTS_KEY.to_string(),
                value: payload,
            },
            PipelineOp::LTrim {
                key: ALERTS_KEY.to_string(),
                start: 0,
                stop: MAX_ALERTS - 1,
            },
        ];
        self.client
            .execute_with_retry(|store| {
                let ops = ops.clone();
                async move { store.pipeline(ops).await }
            })
            .await
    }

    pub async fn get_alerts(&self, limit: i64) -> StreamResult<Vec<Value>> {
        let raw = self
            .client
            .execute_with_retry(|store| async move { store.lrange(ALERTS_KEY, 0, limit - 1).await })
            .await?;
        Ok(raw
            .into_iter()
            .map(|s| serde_json::from_str(&s).unwrap_or(Value::Null))
            .collect())
    }

    pub async fn update_leaderboard(&self, member: &str, amount: f64) -> StreamResult<()> {
        self.client
            .execute_with_retry(|store| {
                async move { store.zincrby(LEADERBOARD_KEY, amount, member).await }
            })
            .await
    }

    pub async fn get_leaderboard(&self, top_n: i64) -> StreamResult<Vec<(String, f64)>> {
        self.client
            .execute_with_retry(|store| async move {
                store.zrevrange(LEADERBOARD_KEY, 0, top_n - 1).await
            })
            .await
    }

    pub async fn publish_update(&self, data: &Value) -> StreamResult<()> {
        let payload = serde_json::to_string(data)?;
        self.client
            .execute_with_retry(|store| {
                let payload = payload.clone();
                async move { store.publish(DASHBOARD_CHANNEL, &payload).await }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::kv_store::InMemoryStore;

    fn cache() -> MetricsCache {
        MetricsCache::new(Arc::new(ResilientRedisClient::new(Arc::new(
            InMemoryStore::new(),
        ))))
    }

    #[tokio::test]
    async fn latest_roundtrips() {
        let cache = cache();
        cache
            .update_iot_latest("d1", &serde_json::json!({"value": 1.0}))
            .await
            .unwrap();
        let all = cache.get_iot_latest().await.unwrap();
        assert_eq!(all["d1"]["value"], 1.0);
    }

    #[tokio::test]
    async fn alerts_are_bounded() {
        let cache = cache();
        for i in 0..150 {
            cache
                .push_alert(&serde_json::json!({"i": i}))
                .await
                .unwrap();
        }
        let alerts = cache.get_alerts(200).await.unwrap();
        assert_eq!(alerts.len(), 100);
        // Most recently pushed alert is first.
        assert_eq!(alerts[0]["i"], 149);
    }

    #[tokio::test]
    async fn leaderboard_accumulates_descending() {
        let cache = cache();
        cache.update_leaderboard("/checkout", 10.0).await.unwrap();
        cache.update_leaderboard("/cart", 50.0).await.unwrap();
        cache.update_leaderboard("/checkout", 5.0).await.unwrap();
        let top = cache.get_leaderboard(10).await.unwrap();
        assert_eq!(top[0].0, "/cart");
        assert_eq!(top[1], ("/checkout".to_string(), 15.0));
    }
}
