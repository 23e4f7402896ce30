//! # WebSocket Bus
//!
//! Typed pub/sub fan-out to many concurrent clients. One logical
//! subscriber registry serves both endpoints: the standalone
//! `tokio-tungstenite` listener and the `/ws` route mounted on the HTTP
//! server.
//!
//! ## Back-pressure
//!
//! Every client has a bounded send queue. On overflow the oldest queued
//! message of the same channel is dropped first; if nothing on that
//! channel is queued, the incoming message is dropped and the client's
//! `lag` counter grows. A client whose lag crosses the configured
//! threshold is disconnected with reason `slow_consumer`.
//!
//! Publishing serializes each envelope exactly once; queues share the
//! serialized frame by reference. Per-client per-channel FIFO order is
//! preserved; nothing is promised across channels or across clients.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::engine::EngineHandle;
use crate::error::EngineError;

pub mod client;
pub mod message;

pub use message::{Channel, ClientRequest, DeviceCommand, Envelope, MessageType};

/// Close reason sent to clients that cannot keep up.
pub const SLOW_CONSUMER_REASON: &str = "slow_consumer";

struct QueuedFrame {
    channel: Option<Channel>,
    text: Arc<String>,
}

/// What happened to a frame offered to a client queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Enqueue {
    /// Queued without loss.
    Delivered,
    /// Queued after evicting the oldest frame of the same channel.
    ReplacedOldest,
    /// Dropped outright.
    Dropped,
}

/// One registered client: its queue, subscriptions, and lifecycle
/// token. Shared between the registry and the transport pumps.
pub struct BusClient {
    pub id: u64,
    capacity: usize,
    lag_threshold: u32,
    queue: Mutex<VecDeque<QueuedFrame>>,
    notify: Notify,
    subscriptions: Mutex<HashSet<Channel>>,
    lag: AtomicU32,
    kicked: AtomicBool,
    /// Cancelled when the client is unregistered; transport pumps
    /// observe it.
    pub closed: CancellationToken,
}

impl BusClient {
    fn new(id: u64, capacity: usize, lag_threshold: u32) -> Self {
        Self {
            id,
            capacity,
            lag_threshold,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            subscriptions: Mutex::new(HashSet::new()),
            lag: AtomicU32::new(0),
            kicked: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Whether this client subscribed to `channel`.
    #[must_use]
    pub fn is_subscribed(&self, channel: Channel) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .contains(&channel)
    }

    /// Snapshot of the subscription set.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Channel> {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    /// Current dropped-message count.
    #[must_use]
    pub fn lag(&self) -> u32 {
        self.lag.load(Ordering::Relaxed)
    }

    /// Queue a frame under the overflow policy. Either kind of loss
    /// feeds the lag counter; crossing the threshold marks the client
    /// for disconnection.
    fn enqueue(&self, channel: Option<Channel>, text: Arc<String>) -> Enqueue {
        let mut queue = self.queue.lock().expect("queue lock poisoned");
        if queue.len() >= self.capacity {
            // Oldest same-channel frame goes first.
            let same_channel =
                channel.and_then(|ch| queue.iter().position(|f| f.channel == Some(ch)));
            if let Some(index) = same_channel {
                queue.remove(index);
                queue.push_back(QueuedFrame { channel, text });
                drop(queue);
                self.note_lag();
                self.notify.notify_one();
                return Enqueue::ReplacedOldest;
            }
            drop(queue);
            self.note_lag();
            return Enqueue::Dropped;
        }
        queue.push_back(QueuedFrame { channel, text });
        drop(queue);
        self.notify.notify_one();
        Enqueue::Delivered
    }

    fn note_lag(&self) {
        let lag = self.lag.fetch_add(1, Ordering::Relaxed) + 1;
        if lag >= self.lag_threshold && !self.kicked.swap(true, Ordering::Relaxed) {
            tracing::warn!(client_id = self.id, lag, "Disconnecting slow consumer");
            self.notify.notify_waiters();
            // A transport pump stuck in a blocked send must abandon it;
            // waking the queue alone cannot reach it.
            self.closed.cancel();
        }
    }

    /// Whether this client was marked a slow consumer.
    #[must_use]
    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::Relaxed)
    }

    /// Next frame to write, in FIFO order. Returns `None` once the
    /// client has been marked a slow consumer; the transport should
    /// close the socket with [`SLOW_CONSUMER_REASON`].
    pub async fn next_frame(&self) -> Option<Arc<String>> {
        loop {
            if self.kicked.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(frame) = self
                .queue
                .lock()
                .expect("queue lock poisoned")
                .pop_front()
            {
                return Some(frame.text);
            }
            self.notify.notified().await;
        }
    }
}

struct BusInner {
    queue_len: usize,
    lag_threshold: u32,
    clients: Mutex<HashMap<u64, Arc<BusClient>>>,
    next_id: AtomicU64,
    engine: OnceLock<EngineHandle>,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// The bus handle. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct WsBus {
    inner: Arc<BusInner>,
}

impl WsBus {
    #[must_use]
    pub fn new(queue_len: usize, lag_threshold: u32) -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue_len,
                lag_threshold,
                clients: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                engine: OnceLock::new(),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Wire the coordinator in. Called once during engine bring-up;
    /// device commands arriving before this are answered with an error.
    pub fn set_engine(&self, handle: EngineHandle) {
        let _ = self.inner.engine.set(handle);
    }

    /// Register a new client and queue its greeting.
    #[must_use]
    pub fn register(&self) -> Arc<BusClient> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(BusClient::new(
            id,
            self.inner.queue_len,
            self.inner.lag_threshold,
        ));
        client.enqueue(None, Arc::new(Envelope::greeting(id).to_wire()));
        self.inner
            .clients
            .lock()
            .expect("clients lock poisoned")
            .insert(id, Arc::clone(&client));
        tracing::debug!(client_id = id, "Client registered");
        client
    }

    /// Remove a client and its subscriptions; cancels its transport
    /// pumps. Idempotent.
    pub fn unregister(&self, id: u64) {
        let removed = self
            .inner
            .clients
            .lock()
            .expect("clients lock poisoned")
            .remove(&id);
        if let Some(client) = removed {
            client.closed.cancel();
            tracing::debug!(client_id = id, "Client unregistered");
        }
    }

    /// Number of connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().expect("clients lock poisoned").len()
    }

    /// Total messages published.
    #[must_use]
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Total per-client frames dropped by the overflow policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Fan an envelope out to every subscriber of `channel`.
    /// Serializes once; never blocks.
    pub fn publish(&self, channel: Channel, envelope: &Envelope) {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        let text = Arc::new(envelope.to_wire());
        let clients: Vec<Arc<BusClient>> = {
            let guard = self.inner.clients.lock().expect("clients lock poisoned");
            guard.values().cloned().collect()
        };
        for client in clients {
            if client.is_subscribed(channel)
                && client.enqueue(Some(channel), Arc::clone(&text)) != Enqueue::Delivered
            {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Queue a direct reply to one client, outside any channel.
    pub fn send_to(&self, client: &BusClient, envelope: &Envelope) {
        if client.enqueue(None, Arc::new(envelope.to_wire())) != Enqueue::Delivered {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Handle one client text frame: subscriptions, ping, health, and
    /// device commands forwarded to the coordinator.
    pub async fn handle_text(&self, client: &Arc<BusClient>, text: &str) {
        let request = match ClientRequest::parse(text) {
            Ok(request) => request,
            Err(e) => {
                self.send_to(client, &Envelope::error(e.code(), &e.to_string()));
                return;
            }
        };

        match request {
            ClientRequest::Subscribe { channel } => match Channel::parse(&channel) {
                Ok(channel) => {
                    client
                        .subscriptions
                        .lock()
                        .expect("subscriptions lock poisoned")
                        .insert(channel);
                    self.send_to(client, &Envelope::subscription(channel, true));
                }
                Err(e) => self.send_to(client, &Envelope::error(e.code(), &e.to_string())),
            },
            ClientRequest::Unsubscribe { channel } => match Channel::parse(&channel) {
                Ok(channel) => {
                    client
                        .subscriptions
                        .lock()
                        .expect("subscriptions lock poisoned")
                        .remove(&channel);
                    self.send_to(client, &Envelope::subscription(channel, false));
                }
                Err(e) => self.send_to(client, &Envelope::error(e.code(), &e.to_string())),
            },
            ClientRequest::Ping => self.send_to(client, &Envelope::pong()),
            ClientRequest::HealthCheck => self.reply_health(client).await,
            ClientRequest::Command {
                command,
                address,
                duration_s,
            } => self.run_device_command(client, command, address, duration_s).await,
        }
    }

    async fn reply_health(&self, client: &Arc<BusClient>) {
        match self.engine() {
            Ok(engine) => match engine.status().await {
                Ok(status) => {
                    let data = serde_json::to_value(&status).unwrap_or_default();
                    self.send_to(client, &Envelope::health(data));
                }
                Err(e) => self.send_to(client, &Envelope::error(e.code(), &e.to_string())),
            },
            Err(e) => self.send_to(client, &Envelope::error(e.code(), &e.to_string())),
        }
    }

    fn engine(&self) -> Result<&EngineHandle, EngineError> {
        self.inner.engine.get().ok_or(EngineError::InvalidParameters {
            reason: "engine not ready".into(),
        })
    }

    async fn run_device_command(
        &self,
        client: &Arc<BusClient>,
        command: DeviceCommand,
        address: Option<String>,
        duration_s: Option<u64>,
    ) {
        let engine = match self.engine() {
            Ok(engine) => engine.clone(),
            Err(e) => {
                self.send_to(client, &Envelope::error(e.code(), &e.to_string()));
                return;
            }
        };

        let reply = match command {
            DeviceCommand::ScanDevices => engine
                .scan(duration_s.map(std::time::Duration::from_secs))
                .await
                .map(|devices| {
                    serde_json::json!({ "event": "scan_result", "devices": devices })
                }),
            DeviceCommand::ConnectDevice => match address {
                Some(address) => engine.connect(address, None, None).await.map(|device| {
                    serde_json::json!({ "event": "device_connected", "device": device })
                }),
                None => Err(EngineError::InvalidParameters {
                    reason: "connect_device requires an address".into(),
                }),
            },
            DeviceCommand::DisconnectDevice => engine
                .disconnect()
                .await
                .map(|()| serde_json::json!({ "event": "device_disconnected" })),
            DeviceCommand::StartStreaming => engine
                .start_streaming()
                .await
                .map(|()| serde_json::json!({ "event": "streaming_started" })),
            DeviceCommand::StopStreaming => engine
                .stop_streaming()
                .await
                .map(|()| serde_json::json!({ "event": "streaming_stopped" })),
            DeviceCommand::HealthCheck => {
                self.reply_health(client).await;
                return;
            }
        };

        match reply {
            Ok(data) => self.send_to(client, &Envelope::new(MessageType::Event, None, data)),
            Err(e) => self.send_to(client, &Envelope::error(e.code(), &e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u64) -> Arc<String> {
        Arc::new(format!("frame-{n}"))
    }

    #[test]
    fn test_subscribe_then_unsubscribe_restores_set() {
        let bus = WsBus::new(8, 4);
        let client = bus.register();
        let before = client.subscriptions().len();
        client
            .subscriptions
            .lock()
            .unwrap()
            .insert(Channel::RawEeg);
        client
            .subscriptions
            .lock()
            .unwrap()
            .remove(&Channel::RawEeg);
        assert_eq!(client.subscriptions().len(), before);
    }

    #[test]
    fn test_publish_reaches_only_subscribers() {
        let bus = WsBus::new(8, 4);
        let subscriber = bus.register();
        let bystander = bus.register();
        subscriber
            .subscriptions
            .lock()
            .unwrap()
            .insert(Channel::ProcessedEeg);

        bus.publish(
            Channel::ProcessedEeg,
            &Envelope::processed(Channel::ProcessedEeg, serde_json::json!(1)),
        );

        // Greeting + published frame for the subscriber.
        assert_eq!(subscriber.queue.lock().unwrap().len(), 2);
        // Greeting only for the bystander.
        assert_eq!(bystander.queue.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_overflow_drops_oldest_same_channel_first() {
        let bus = WsBus::new(3, 100);
        let client = bus.register();
        // Drain the greeting.
        client.queue.lock().unwrap().clear();

        assert_eq!(
            client.enqueue(Some(Channel::RawEeg), frame(1)),
            Enqueue::Delivered
        );
        assert_eq!(
            client.enqueue(Some(Channel::Event), frame(2)),
            Enqueue::Delivered
        );
        assert_eq!(
            client.enqueue(Some(Channel::RawEeg), frame(3)),
            Enqueue::Delivered
        );
        // Queue full: the oldest raw_eeg frame makes room.
        assert_eq!(
            client.enqueue(Some(Channel::RawEeg), frame(4)),
            Enqueue::ReplacedOldest
        );

        let texts: Vec<String> = client
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.text.as_str().to_string())
            .collect();
        assert_eq!(texts, vec!["frame-2", "frame-3", "frame-4"]);
        assert_eq!(client.lag(), 1);
    }

    #[test]
    fn test_overflow_without_same_channel_increments_lag() {
        let bus = WsBus::new(2, 100);
        let client = bus.register();
        client.queue.lock().unwrap().clear();

        assert_eq!(
            client.enqueue(Some(Channel::Event), frame(1)),
            Enqueue::Delivered
        );
        assert_eq!(
            client.enqueue(Some(Channel::DeviceInfo), frame(2)),
            Enqueue::Delivered
        );
        // No battery frame queued, so the incoming one is dropped.
        assert_eq!(
            client.enqueue(Some(Channel::Battery), frame(3)),
            Enqueue::Dropped
        );
        assert_eq!(client.lag(), 1);
    }

    #[tokio::test]
    async fn test_slow_consumer_gets_kicked() {
        let bus = WsBus::new(1, 3);
        let client = bus.register();
        client.queue.lock().unwrap().clear();

        assert_eq!(
            client.enqueue(Some(Channel::Event), frame(0)),
            Enqueue::Delivered
        );
        for n in 1..=3 {
            assert_eq!(
                client.enqueue(Some(Channel::Battery), frame(n)),
                Enqueue::Dropped
            );
        }
        // Queue still holds the event frame, but the client is marked.
        assert!(client.next_frame().await.is_none());
    }

    #[test]
    fn test_unregister_cancels_and_forgets() {
        let bus = WsBus::new(8, 4);
        let client = bus.register();
        assert_eq!(bus.client_count(), 1);
        bus.unregister(client.id);
        assert_eq!(bus.client_count(), 0);
        assert!(client.closed.is_cancelled());
        bus.unregister(client.id);
    }

    #[tokio::test]
    async fn test_handle_text_subscribe_flow() {
        let bus = WsBus::new(8, 4);
        let client = bus.register();
        client.queue.lock().unwrap().clear();

        bus.handle_text(&client, r#"{"type":"subscribe","channel":"processed_ppg"}"#)
            .await;
        assert!(client.is_subscribed(Channel::ProcessedPpg));
        let confirmation = client.next_frame().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&confirmation).unwrap();
        assert_eq!(value["type"], "subscription_confirmed");
        assert_eq!(value["data"]["subscribed"], true);

        bus.handle_text(&client, r#"{"type":"unsubscribe","channel":"processed_ppg"}"#)
            .await;
        assert!(!client.is_subscribed(Channel::ProcessedPpg));
    }

    #[tokio::test]
    async fn test_handle_text_ping_pong() {
        let bus = WsBus::new(8, 4);
        let client = bus.register();
        client.queue.lock().unwrap().clear();
        bus.handle_text(&client, r#"{"type":"ping"}"#).await;
        let reply = client.next_frame().await.unwrap();
        assert!(reply.contains("\"pong\""));
    }

    #[tokio::test]
    async fn test_unknown_channel_subscription_rejected() {
        let bus = WsBus::new(8, 4);
        let client = bus.register();
        client.queue.lock().unwrap().clear();
        bus.handle_text(&client, r#"{"type":"subscribe","channel":"raw_emg"}"#)
            .await;
        let reply = client.next_frame().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "INVALID_PARAMETERS");
    }
}
