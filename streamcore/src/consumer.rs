//! Kafka consumer: decodes MessagePack payloads off the raw topics,
//! dispatches by topic, and routes anything that fails to decode or
//! to handle to the dead-letter queue. Commits are manual and batched
//! so a crash mid-batch only reprocesses, never skips, messages.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer as RdStreamConsumer};
use rdkafka::Message;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::dead_letter::{encode_original_value, DeadLetterQueue};
use crate::error::StreamResult;
use crate::schemas::{ActivityEvent, DlqEnvelope, SensorReading};

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

/// A decoded, topic-tagged inbound record.
pub enum InboundMessage {
    Iot(SensorReading),
    Activity(ActivityEvent),
}

pub struct StreamConsumer {
    consumer: RdStreamConsumer,
    settings: Arc<Settings>,
    dlq: Arc<DeadLetterQueue>,
    uncommitted: AtomicUsize,
}

impl StreamConsumer {
    pub fn new(settings: Arc<Settings>, dlq: Arc<DeadLetterQueue>) -> StreamResult<Self> {
        let consumer: RdStreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.kafka_bootstrap_servers)
            .set("group.id", &settings.kafka_consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &settings.kafka_auto_offset_reset)
            .set("client.id", "streamcore")
            .create()?;

        consumer.subscribe(&[
            settings.topic_iot_raw.as_str(),
            settings.topic_activity_raw.as_str(),
        ])?;
        info!(
            iot = %settings.topic_iot_raw,
            activity = %settings.topic_activity_raw,
            "consumer_subscribed"
        );

        Ok(Self {
            consumer,
            settings,
            dlq,
            uncommitted: AtomicUsize::new(0),
        })
    }

    /// Poll until `stop` resolves, decoding and dispatching each
    /// message to `handle`. Any decode or handler failure is routed to
    /// the dead-letter queue; the offset is still committed so a
    /// poison message doesn't wedge the partition.
    pub async fn run<F, Fut>(&self, mut handle: F, stop: impl std::future::Future<Output = ()>)
    where
        F: FnMut(InboundMessage) -> Fut,
        Fut: std::future::Future<Output = StreamResult<()>>,
    {
        tokio::pin!(stop);
        loop {
            tokio::select! {
                message = self.consumer.recv() => {
                    match message {
                        Ok(m) => {
                            let topic = m.topic().to_string();
                            let partition = m.partition();
                            let offset = m.offset();
                            let payload = m.payload().map(|p| p.to_vec());

                            if let Some(bytes) = payload {
                                self.dispatch(&topic, partition, offset, &bytes, &mut handle).await;
                            }

                            if let Err(e) = self.consumer.commit_message(&m, CommitMode::Async) {
                                warn!(error = %e, "commit_failed");
                            }

                            let count = self.uncommitted.fetch_add(1, Ordering::Relaxed) + 1;
                            if count as u32 >= self.settings.kafka_max_poll_records {
                                if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
                                    warn!(error = %e, "batch_commit_failed");
                                }
                                self.uncommitted.store(0, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "kafka_recv_error");
                        }
                    }
                }
                _ = &mut stop => {
                    info!("consumer_stop_requested");
                    break;
                }
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %e, "final_commit_failed");
        }
    }

    async fn dispatch<F, Fut>(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        bytes: &[u8],
        handle: &mut F,
    ) where
        F: FnMut(InboundMessage) -> Fut,
        Fut: std::future::Future<Output = StreamResult<()>>,
    {
        let decoded = if topic == self.settings.topic_iot_raw {
            rmp_serde::from_slice::<SensorReading>(bytes)
                .map(InboundMessage::Iot)
                .map_err(|e| e.to_string())
        } else if topic == self.settings.topic_activity_raw {
            rmp_serde::from_slice::<ActivityEvent>(bytes)
                .map(InboundMessage::Activity)
                .map_err(|e| e.to_string())
        } else {
            warn!(%topic, "unexpected_topic");
            return;
        };

        match decoded {
            Ok(message) => {
                if let Err(e) = handle(message).await {
                    self.dlq
                        .send(&DlqEnvelope {
                            original_topic: topic.to_string(),
                            partition,
                            offset,
                            error_type: "handler_error".to_string(),
                            error_message: e.to_string(),
                            stack_trace: String::new(),
                            failed_at: now_ms(),
                            original_value_b64: Some(encode_original_value(bytes)),
                        })
                        .await;
                }
            }
            Err(msg) => {
                self.dlq
                    .send(&DlqEnvelope {
                        original_topic: topic.to_string(),
                        partition,
                        offset,
                        error_type: "decode_error".to_string(),
                        error_message: msg,
                        stack_trace: String::new(),
                        failed_at: now_ms(),
                        original_value_b64: Some(encode_original_value(bytes)),
                    })
                    .await;
            }
        }
    }
}
