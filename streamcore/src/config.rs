//! Centralized, environment-driven configuration.
//!
//! All values are optional and fall back to the defaults below, the
//! same shape as the `Config::from_env()` constructors used by the
//! Kafka/Redis services this crate's stack is modeled on.

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct Settings {
    // Kafka
    pub kafka_bootstrap_servers: String,
    pub kafka_consumer_group: String,
    pub kafka_auto_offset_reset: String,
    pub kafka_max_poll_records: u32,

    // Redis
    pub redis_url: String,
    pub redis_pool_size: u32,
    pub redis_pipeline_batch: usize,
    pub redis_ts_retention_ms: i64,

    // Processing
    pub tumbling_window_sec: u64,
    pub sliding_window_sec: u64,
    pub anomaly_z_threshold: f64,
    pub anomaly_window_size: usize,
    pub trend_window_size: usize,

    // Broadcast
    pub ws_throttle_ms: u64,

    // Topics
    pub topic_iot_raw: String,
    pub topic_activity_raw: String,
    pub topic_dlq: String,

    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kafka_bootstrap_servers: "kafka:9092".to_string(),
            kafka_consumer_group: "stream-processor".to_string(),
            kafka_auto_offset_reset: "latest".to_string(),
            kafka_max_poll_records: 500,

            redis_url: "redis://redis:6379/0".to_string(),
            redis_pool_size: 20,
            redis_pipeline_batch: 50,
            redis_ts_retention_ms: 86_400_000,

            tumbling_window_sec: 10,
            sliding_window_sec: 60,
            anomaly_z_threshold: 3.0,
            anomaly_window_size: 100,
            trend_window_size: 60,

            ws_throttle_ms: 100,

            topic_iot_raw: "iot.sensors.raw".to_string(),
            topic_activity_raw: "activity.events.raw".to_string(),
            topic_dlq: "pipeline.dlq".to_string(),

            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from `PIPELINE_`-prefixed environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Self {
            kafka_bootstrap_servers: env_or_string(
                "PIPELINE_KAFKA_BOOTSTRAP_SERVERS",
                &d.kafka_bootstrap_servers,
            ),
            kafka_consumer_group: env_or_string(
                "PIPELINE_KAFKA_CONSUMER_GROUP",
                &d.kafka_consumer_group,
            ),
            kafka_auto_offset_reset: env_or_string(
                "PIPELINE_KAFKA_AUTO_OFFSET_RESET",
                &d.kafka_auto_offset_reset,
            ),
            kafka_max_poll_records: env_or(
                "PIPELINE_KAFKA_MAX_POLL_RECORDS",
                d.kafka_max_poll_records,
            ),

            redis_url: env_or_string("PIPELINE_REDIS_URL", &d.redis_url),
            redis_pool_size: env_or("PIPELINE_REDIS_POOL_SIZE", d.redis_pool_size),
            redis_pipeline_batch: env_or("PIPELINE_REDIS_PIPELINE_BATCH", d.redis_pipeline_batch),
            redis_ts_retention_ms: env_or(
                "PIPELINE_REDIS_TS_RETENTION_MS",
                d.redis_ts_retention_ms,
            ),

            tumbling_window_sec: env_or("PIPELINE_TUMBLING_WINDOW_SEC", d.tumbling_window_sec),
            sliding_window_sec: env_or("PIPELINE_SLIDING_WINDOW_SEC", d.sliding_window_sec),
            anomaly_z_threshold: env_or("PIPELINE_ANOMALY_Z_THRESHOLD", d.anomaly_z_threshold),
            anomaly_window_size: env_or("PIPELINE_ANOMALY_WINDOW_SIZE", d.anomaly_window_size),
            trend_window_size: d.trend_window_size,

            ws_throttle_ms: env_or("PIPELINE_WS_THROTTLE_MS", d.ws_throttle_ms),

            topic_iot_raw: env_or_string("PIPELINE_TOPIC_IOT_RAW", &d.topic_iot_raw),
            topic_activity_raw: env_or_string("PIPELINE_TOPIC_ACTIVITY_RAW", &d.topic_activity_raw),
            topic_dlq: env_or_string("PIPELINE_TOPIC_DLQ", &d.topic_dlq),

            log_level: env_or_string("PIPELINE_LOG_LEVEL", &d.log_level),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.tumbling_window_sec)
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.ws_throttle_ms)
    }
}
