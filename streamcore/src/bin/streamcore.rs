//! Process entrypoint: wires configuration, storage, the processing
//! engines, the consumer, the flush loop, the pub/sub bridge, and the
//! live WebSocket surface together, then runs until SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use streamcore::broadcast::{BroadcastManager, PubSubBridge};
use streamcore::consumer::StreamConsumer;
use streamcore::dead_letter::DeadLetterQueue;
use streamcore::processor::StreamProcessor;
use streamcore::storage::cache::MetricsCache;
use streamcore::storage::redis_store::{RedisStore, ResilientRedisClient};
use streamcore::storage::time_series::TimeSeriesWriter;
use streamcore::{init_logging, Settings, WindowedAggregator, ZScoreDetector};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Arc::new(Settings::from_env());
    init_logging(&settings.log_level);
    info!(?settings, "streamcore_starting");

    let store = RedisStore::connect(&settings.redis_url)
        .await
        .context("failed to connect to Redis")?;
    let client = Arc::new(ResilientRedisClient::new(Arc::new(store)));

    let ts_writer = Arc::new(TimeSeriesWriter::new(
        client.clone(),
        settings.redis_pipeline_batch,
        settings.redis_ts_retention_ms,
    ));
    let cache = Arc::new(MetricsCache::new(client.clone()));

    let aggregator = Arc::new(WindowedAggregator::new(settings.sliding_window_sec));
    let anomaly = Arc::new(ZScoreDetector::new(
        settings.anomaly_window_size,
        settings.anomaly_z_threshold,
    ));
    let trend = Arc::new(streamcore::TrendAnalyzer::new(settings.trend_window_size));

    let processor = Arc::new(StreamProcessor::new(
        aggregator,
        anomaly,
        trend,
        ts_writer,
        cache,
    ));

    let dlq = Arc::new(
        DeadLetterQueue::new(&settings.kafka_bootstrap_servers, &settings.topic_dlq)
            .context("failed to create dead-letter producer")?,
    );
    let consumer = Arc::new(
        StreamConsumer::new(settings.clone(), dlq)
            .context("failed to create Kafka consumer")?,
    );

    let broadcast_manager = Arc::new(BroadcastManager::new(settings.throttle_interval()));
    let pubsub_bridge = Arc::new(PubSubBridge::new(
        settings.redis_url.clone(),
        broadcast_manager.clone(),
    ));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let flush_task = {
        let processor = processor.clone();
        let period = settings.flush_interval();
        tokio::spawn(async move { processor.run_flush_loop(period).await })
    };

    let bridge_task = {
        let bridge = pubsub_bridge.clone();
        let stop_rx = stop_rx.clone();
        tokio::spawn(async move { bridge.run(stop_rx).await })
    };

    let ws_app = streamcore::broadcast::ws::router(broadcast_manager.clone());
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8090")
        .await
        .context("failed to bind websocket listener")?;
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, ws_app).await {
            error!(error = %e, "ws_server_failed");
        }
    });

    let consumer_task = {
        let consumer = consumer.clone();
        let processor = processor.clone();
        tokio::spawn(async move {
            let shutdown = async {
                let mut sigterm =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            };
            consumer
                .run(
                    |message| {
                        let processor = processor.clone();
                        async move { processor.handle(message).await }
                    },
                    shutdown,
                )
                .await;
        })
    };

    consumer_task.await.context("consumer task panicked")?;

    info!("consumer_stopped_shutting_down");
    let _ = stop_tx.send(true);
    flush_task.abort();
    bridge_task.abort();
    server_task.abort();

    if let Err(e) = processor.flush_and_publish().await {
        error!(error = %e, "final_flush_failed");
    }

    info!("streamcore_shutdown_complete");
    Ok(())
}
