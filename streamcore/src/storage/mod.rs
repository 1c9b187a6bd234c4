//! Storage layer: a resilient key-value client abstraction plus the
//! time-series writer/reader and metrics cache built on top of it.

pub mod cache;
pub mod circuit_breaker;
pub mod kv_store;
pub mod redis_store;
pub mod time_series;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use kv_store::{InMemoryStore, KvStore};
pub use redis_store::{ResilientRedisClient, REDIS_MAX_RETRIES};
