//! Live fan-out to dashboard subscribers: a throttled, filtered
//! broadcast manager; a pub/sub bridge that feeds it from Redis; and a
//! thin axum WebSocket adapter binding real sockets to the manager.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tracing::{error, info, warn};

fn default_filters() -> HashSet<String> {
    ["iot", "activity", "alerts", "trends"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// A transport-agnostic handle a broadcast can be dispatched to.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn send(&self, payload: &str) -> bool;
}

struct SubscriberEntry {
    handle: Arc<dyn Subscriber>,
    filters: Mutex<HashSet<String>>,
    last_send: Mutex<Instant>,
}

/// Per-subscriber throttled, channel-filtered fan-out.
pub struct BroadcastManager {
    subscribers: Mutex<HashMap<String, Arc<SubscriberEntry>>>,
    throttle: Duration,
}

impl BroadcastManager {
    pub fn new(throttle: Duration) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            throttle,
        }
    }

    pub fn connect(&self, id: &str, handle: Arc<dyn Subscriber>) {
        self.subscribers.lock().unwrap().insert(
            id.to_string(),
            Arc::new(SubscriberEntry {
                handle,
                filters: Mutex::new(default_filters()),
                last_send: Mutex::new(Instant::now() - Duration::from_secs(3600)),
            }),
        );
        info!(subscriber = %id, "broadcast_subscriber_connected");
    }

    pub fn disconnect(&self, id: &str) {
        self.subscribers.lock().unwrap().remove(id);
        info!(subscriber = %id, "broadcast_subscriber_disconnected");
    }

    pub fn update_filters(&self, id: &str, channels: HashSet<String>) {
        if let Some(entry) = self.subscribers.lock().unwrap().get(id) {
            *entry.filters.lock().unwrap() = channels;
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Dispatch `payload` on `channel` to every eligible subscriber,
    /// concurrently, dropping any whose send fails.
    pub async fn broadcast(&self, channel: &str, payload: &Value) {
        let envelope = serde_json::json!({ "channel": channel, "data": payload }).to_string();
        let now = Instant::now();

        let snapshot: Vec<(String, Arc<SubscriberEntry>)> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut sends = Vec::new();
        for (id, entry) in snapshot {
            if !entry.filters.lock().unwrap().contains(channel) {
                continue;
            }
            {
                let mut last_send = entry.last_send.lock().unwrap();
                if now.duration_since(*last_send) < self.throttle {
                    continue;
                }
                *last_send = now;
            }
            let envelope = envelope.clone();
            sends.push(async move { (id, entry.handle.send(&envelope).await) });
        }

        let results = futures::future::join_all(sends).await;
        for (id, ok) in results {
            if !ok {
                self.disconnect(&id);
            }
        }
    }
}

/// Bridges Redis pub/sub messages on `channel:dashboard_updates` into
/// `BroadcastManager::broadcast`. Reconnects on any error with a fixed
/// 2 s backoff and loops forever.
pub struct PubSubBridge {
    redis_url: String,
    manager: Arc<BroadcastManager>,
}

const DASHBOARD_CHANNEL: &str = "channel:dashboard_updates";
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

impl PubSubBridge {
    pub fn new(redis_url: String, manager: Arc<BroadcastManager>) -> Self {
        Self { redis_url, manager }
    }

    pub async fn run(&self, mut stop: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                return;
            }
            tokio::select! {
                result = self.listen_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "pubsub_bridge_error");
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return;
                    }
                }
            }
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn listen_once(&self) -> anyhow::Result<()> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(DASHBOARD_CHANNEL).await?;
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = msg.get_payload()?;
            match serde_json::from_str::<Value>(&payload) {
                Ok(data) => self.manager.broadcast("metrics", &data).await,
                Err(e) => error!(error = %e, "pubsub_payload_decode_failed"),
            }
        }
        Ok(())
    }
}

pub mod ws {
    use super::{BroadcastManager, Subscriber};
    use async_trait::async_trait;
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use futures::{stream::SplitSink, SinkExt, StreamExt};
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;
    use tracing::info;
    use uuid::Uuid;

    struct WsSubscriber {
        sender: AsyncMutex<SplitSink<WebSocket, Message>>,
    }

    #[async_trait]
    impl Subscriber for WsSubscriber {
        async fn send(&self, payload: &str) -> bool {
            self.sender
                .lock()
                .await
                .send(Message::Text(payload.to_string()))
                .await
                .is_ok()
        }
    }

    pub fn router(manager: Arc<BroadcastManager>) -> Router {
        Router::new()
            .route("/ws/live", get(handle_upgrade))
            .with_state(manager)
    }

    async fn handle_upgrade(
        ws: WebSocketUpgrade,
        State(manager): State<Arc<BroadcastManager>>,
    ) -> impl IntoResponse {
        ws.on_upgrade(move |socket| handle_socket(socket, manager))
    }

    async fn handle_socket(socket: WebSocket, manager: Arc<BroadcastManager>) {
        let id = Uuid::new_v4().to_string();
        let (sender, mut receiver) = socket.split();
        manager.connect(
            &id,
            Arc::new(WsSubscriber {
                sender: AsyncMutex::new(sender),
            }),
        );

        // Inbound frames aren't part of the dashboard protocol today;
        // drain them so the socket stays alive until the client closes.
        while receiver.next().await.is_some() {}

        manager.disconnect(&id);
        info!(subscriber = %id, "ws_connection_closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSubscriber {
        count: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Subscriber for RecordingSubscriber {
        async fn send(&self, _payload: &str) -> bool {
            if self.fail {
                return false;
            }
            self.count.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn broadcast_respects_channel_filter() {
        let manager = BroadcastManager::new(Duration::from_millis(0));
        let count = Arc::new(AtomicUsize::new(0));
        manager.connect(
            "sub1",
            Arc::new(RecordingSubscriber {
                count: count.clone(),
                fail: false,
            }),
        );
        manager.update_filters("sub1", ["iot".to_string()].into_iter().collect());

        manager.broadcast("activity", &serde_json::json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        manager.broadcast("iot", &serde_json::json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_send_drops_subscriber() {
        let manager = BroadcastManager::new(Duration::from_millis(0));
        manager.connect(
            "sub1",
            Arc::new(RecordingSubscriber {
                count: Arc::new(AtomicUsize::new(0)),
                fail: true,
            }),
        );
        assert_eq!(manager.subscriber_count(), 1);
        manager.broadcast("iot", &serde_json::json!({})).await;
        assert_eq!(manager.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn throttle_suppresses_rapid_repeat_sends() {
        let manager = BroadcastManager::new(Duration::from_secs(3600));
        let count = Arc::new(AtomicUsize::new(0));
        manager.connect(
            "sub1",
            Arc::new(RecordingSubscriber {
                count: count.clone(),
                fail: false,
            }),
        );
        manager.broadcast("iot", &serde_json::json!({})).await;
        manager.broadcast("iot", &serde_json::json!({})).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
