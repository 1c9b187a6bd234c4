//! Dead-letter routing: undecodable or unhandleable messages are
//! re-published as a JSON `DlqEnvelope` rather than dropped.

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::error;

use crate::error::StreamResult;
use crate::schemas::DlqEnvelope;

pub struct DeadLetterQueue {
    producer: FutureProducer,
    topic: String,
}

impl DeadLetterQueue {
    pub fn new(bootstrap_servers: &str, topic: &str) -> StreamResult<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }

    /// Serialize `envelope` as JSON and send to the dead-letter topic,
    /// keyed by the original topic so a single consumer can fan back
    /// out by source if needed. Logs and continues on send failure —
    /// the DLQ itself must never block the main consume loop.
    pub async fn send(&self, envelope: &DlqEnvelope) {
        let payload = match serde_json::to_string(envelope) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "dlq_envelope_serialize_failed");
                return;
            }
        };

        let record = FutureRecord::to(&self.topic)
            .key(&envelope.original_topic)
            .payload(&payload);

        if let Err((e, _)) = self
            .producer
            .send(record, std::time::Duration::from_secs(5))
            .await
        {
            error!(error = %e, topic = %self.topic, "dlq_send_failed");
        }
    }
}

/// Hex-encode raw bytes for embedding in a `DlqEnvelope`.
pub fn encode_original_value(bytes: &[u8]) -> String {
    hex::encode(bytes)
}
