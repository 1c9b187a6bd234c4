//! Streaming analytics core: ingests IoT and activity events from a
//! partitioned message bus, computes windowed aggregates, detects
//! anomalies, fits trends, persists to a time-series/KV store, and
//! fans results out to live subscribers.

pub mod aggregator;
pub mod anomaly;
pub mod broadcast;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
pub mod processor;
pub mod schemas;
pub mod storage;
pub mod trend;

pub use aggregator::WindowedAggregator;
pub use anomaly::ZScoreDetector;
pub use broadcast::BroadcastManager;
pub use config::Settings;
pub use consumer::StreamConsumer;
pub use dead_letter::DeadLetterQueue;
pub use error::{StreamCoreError, StreamResult};
pub use processor::StreamProcessor;
pub use trend::TrendAnalyzer;

/// Initialize structured logging at the configured level, scoped to
/// this crate's `streamcore=` target.
pub fn init_logging(level: &str) {
    if tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::new(format!(
                "streamcore={level}"
            )))
            .json()
            .finish(),
    )
    .is_err()
    {
        // A global subscriber is already set (e.g. under `cargo test`); ignore.
    }
}
