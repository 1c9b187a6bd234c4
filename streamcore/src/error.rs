//! Unified error type for the streaming analytics core.
//!
//! Structured the way `streaming::error_handling::StreamError` is: one
//! enum per failure domain, rich enough to log without re-deriving
//! context at the call site.

use thiserror::Error;

/// Crate-wide result alias.
pub type StreamResult<T> = Result<T, StreamCoreError>;

#[derive(Debug, Error)]
pub enum StreamCoreError {
    #[error("storage connection/timeout error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("circuit breaker is open — failing fast")]
    CircuitOpen,

    #[error("decode error on topic {topic}: {source}")]
    Decode {
        topic: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler error for topic {topic}: {message}")]
    Handler { topic: String, message: String },

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("messagepack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("messagepack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for StreamCoreError {
    fn from(err: redis::RedisError) -> Self {
        StreamCoreError::Storage(anyhow::Error::new(err))
    }
}
