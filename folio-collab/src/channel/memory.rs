//! In-process channel transport.
//!
//! One [`MemoryHub`] stands in for the realtime backend. Each document topic
//! owns a tokio broadcast channel; every subscribed endpoint gets an
//! independent receiver and a delivery task that dispatches frames to the
//! endpoint's handlers.
//!
//! ```text
//!  MemoryChannel A ──┐                       ┌──► delivery task A ──► handlers A
//!                    ├──► Topic (broadcast) ─┤
//!  MemoryChannel B ──┘     + presence table  └──► delivery task B ──► handlers B
//! ```
//!
//! Frames are delivered to the sender as well unless
//! [`HubConfig::echo_to_sender`] is off. `disconnect`/`reconnect` simulate a
//! transport outage for tests: frames published while an endpoint is
//! disconnected are lost for that endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::{
    document_topic, BroadcastHandler, Channel, ChannelError, ChannelFactory, ConnectionStatus,
    DocumentId, PresenceEvent, PresenceHandler, PresenceKind, StatusStream, Subscription,
};
use crate::lock;
use crate::presence::PresenceRecord;
use crate::protocol::Envelope;
use crate::state::PeerId;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Frames buffered per receiver before a slow endpoint starts lagging.
    pub capacity: usize,
    /// Deliver broadcasts back to the endpoint that sent them.
    pub echo_to_sender: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            echo_to_sender: true,
        }
    }
}

/// Per-topic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_endpoints: usize,
    pub tracked_peers: usize,
}

#[derive(Debug)]
enum Frame {
    Broadcast { origin: u64, envelope: Envelope },
    Presence(PresenceEvent),
}

/// A document topic: fan-out channel plus the authoritative presence table.
struct Topic {
    name: String,
    sender: broadcast::Sender<Arc<Frame>>,
    presence: Mutex<HashMap<PeerId, PresenceRecord>>,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Topic {
    fn new(name: String, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name,
            sender,
            presence: Mutex::new(HashMap::new()),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    fn publish(&self, frame: Frame) {
        // No receivers is not an error: nobody is listening yet.
        let _ = self.sender.send(Arc::new(frame));
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn upsert_presence(&self, record: PresenceRecord) {
        // Publish under the lock so sync tables go out in mutation order.
        let mut table = lock(&self.presence);
        let joined = table.insert(record.peer_id, record.clone()).is_none();
        if joined {
            self.publish(Frame::Presence(PresenceEvent::Join(record)));
        }
        self.publish(Frame::Presence(PresenceEvent::Sync(table.clone())));
    }

    fn remove_presence(&self, peer_id: &PeerId) {
        let mut table = lock(&self.presence);
        if let Some(record) = table.remove(peer_id) {
            self.publish(Frame::Presence(PresenceEvent::Leave(record)));
            self.publish(Frame::Presence(PresenceEvent::Sync(table.clone())));
        }
    }

    fn stats(&self) -> TopicStats {
        TopicStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_endpoints: self.sender.receiver_count(),
            tracked_peers: lock(&self.presence).len(),
        }
    }
}

/// In-memory realtime backend: maps topics to fan-out groups.
pub struct MemoryHub {
    config: HubConfig,
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    next_endpoint: AtomicU64,
}

impl MemoryHub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            topics: Mutex::new(HashMap::new()),
            next_endpoint: AtomicU64::new(1),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HubConfig::default())
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = lock(&self.topics);
        topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name.to_string(), self.config.capacity)))
            .clone()
    }

    /// Open a new endpoint on a document's channel.
    pub fn open(&self, document_id: DocumentId) -> Arc<MemoryChannel> {
        self.open_topic(&document_topic(document_id))
    }

    /// Open a new endpoint on an arbitrary topic.
    pub fn open_topic(&self, topic: &str) -> Arc<MemoryChannel> {
        let id = self.next_endpoint.fetch_add(1, Ordering::Relaxed);
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let endpoint = Arc::new(Endpoint {
            id,
            echo_to_sender: self.config.echo_to_sender,
            topic: self.topic(topic),
            status,
            handlers: Mutex::new(Handlers::default()),
            next_handler: AtomicU64::new(1),
            tracked: Mutex::new(None),
            pump: Mutex::new(None),
        });
        Arc::new(MemoryChannel { endpoint })
    }

    pub fn topic_count(&self) -> usize {
        lock(&self.topics).len()
    }

    pub fn stats(&self, document_id: DocumentId) -> Option<TopicStats> {
        lock(&self.topics)
            .get(&document_topic(document_id))
            .map(|t| t.stats())
    }

    /// Drop a document topic nobody is subscribed to.
    pub fn remove_if_empty(&self, document_id: DocumentId) -> bool {
        let mut topics = lock(&self.topics);
        let name = document_topic(document_id);
        let empty = topics
            .get(&name)
            .is_some_and(|t| t.sender.receiver_count() == 0 && lock(&t.presence).is_empty());
        if empty {
            topics.remove(&name);
        }
        empty
    }
}

impl ChannelFactory for MemoryHub {
    fn open_channel(&self, document_id: DocumentId) -> Arc<dyn Channel> {
        self.open(document_id)
    }
}

#[derive(Default)]
struct Handlers {
    broadcast: HashMap<String, Vec<(u64, BroadcastHandler)>>,
    presence: Vec<(u64, PresenceKind, PresenceHandler)>,
}

/// Shared state of one endpoint; the delivery task holds a strong reference.
struct Endpoint {
    id: u64,
    echo_to_sender: bool,
    topic: Arc<Topic>,
    status: watch::Sender<ConnectionStatus>,
    handlers: Mutex<Handlers>,
    next_handler: AtomicU64,
    tracked: Mutex<Option<PeerId>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    fn current_status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn ensure_connected(&self) -> Result<(), ChannelError> {
        match self.current_status() {
            ConnectionStatus::Subscribed => Ok(()),
            ConnectionStatus::Unsubscribed => Err(ChannelError::Closed),
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {
                Err(ChannelError::Disconnected)
            }
        }
    }

    async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<Arc<Frame>>) {
        self.set_status(ConnectionStatus::Subscribed);
        log::debug!("Endpoint {} subscribed to {}", self.id, self.topic.name);
        self.send_local_sync();

        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if self.current_status() == ConnectionStatus::Subscribed {
                        self.deliver(&frame);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!("Endpoint {} on {} lagged by {n} frames", self.id, self.topic.name);
                    self.topic.messages_dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn send_local_sync(&self) {
        let table = lock(&self.topic.presence).clone();
        self.dispatch_presence(&PresenceEvent::Sync(table));
    }

    fn deliver(&self, frame: &Frame) {
        match frame {
            Frame::Broadcast { origin, envelope } => {
                if *origin == self.id && !self.echo_to_sender {
                    return;
                }
                self.dispatch_broadcast(&envelope.event, &envelope.payload);
            }
            Frame::Presence(event) => self.dispatch_presence(event),
        }
    }

    fn dispatch_broadcast(&self, event: &str, payload: &Value) {
        // Snapshot so handlers run without the lock held.
        let targets: Vec<BroadcastHandler> = lock(&self.handlers)
            .broadcast
            .get(event)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in targets {
            handler(payload);
        }
    }

    fn dispatch_presence(&self, event: &PresenceEvent) {
        let kind = event.kind();
        let targets: Vec<PresenceHandler> = lock(&self.handlers)
            .presence
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| h.clone())
            .collect();
        for handler in targets {
            handler(event);
        }
    }

    fn untrack(&self, peer_id: &PeerId) {
        let mut tracked = lock(&self.tracked);
        if tracked.as_ref() == Some(peer_id) {
            *tracked = None;
            self.topic.remove_presence(peer_id);
        }
    }

    fn untrack_current(&self) {
        let current = lock(&self.tracked).take();
        if let Some(peer_id) = current {
            self.topic.remove_presence(&peer_id);
        }
    }

    fn shutdown(&self) {
        self.set_status(ConnectionStatus::Unsubscribed);
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.untrack_current();
        let mut handlers = lock(&self.handlers);
        handlers.broadcast.clear();
        handlers.presence.clear();
    }
}

/// One subscriber's view of a hub topic.
pub struct MemoryChannel {
    endpoint: Arc<Endpoint>,
}

impl MemoryChannel {
    pub fn endpoint_id(&self) -> u64 {
        self.endpoint.id
    }

    /// Simulate losing the transport. The tracked record is dropped upstream
    /// as a liveness timeout would, and frames are lost until `reconnect`.
    pub fn disconnect(&self) {
        if self.endpoint.current_status() != ConnectionStatus::Subscribed {
            return;
        }
        log::debug!("Endpoint {} disconnected", self.endpoint.id);
        self.endpoint.set_status(ConnectionStatus::Disconnected);
        self.endpoint.untrack_current();
    }

    /// Simulate the transport recovering.
    pub fn reconnect(&self) {
        if self.endpoint.current_status() != ConnectionStatus::Disconnected {
            return;
        }
        log::debug!("Endpoint {} reconnected", self.endpoint.id);
        self.endpoint.set_status(ConnectionStatus::Subscribed);
        self.endpoint.send_local_sync();
    }

    pub fn stats(&self) -> TopicStats {
        self.endpoint.topic.stats()
    }
}

impl Channel for MemoryChannel {
    fn topic(&self) -> &str {
        &self.endpoint.topic.name
    }

    fn subscribe(&self) -> StatusStream {
        let endpoint = &self.endpoint;
        if endpoint.current_status() != ConnectionStatus::Unsubscribed {
            let mut pump = lock(&endpoint.pump);
            if pump.is_none() {
                endpoint.set_status(ConnectionStatus::Connecting);
                let rx = endpoint.topic.sender.subscribe();
                *pump = Some(tokio::spawn(endpoint.clone().run(rx)));
            }
        }
        status_stream(endpoint.status.subscribe())
    }

    fn status(&self) -> ConnectionStatus {
        self.endpoint.current_status()
    }

    fn track(&self, record: PresenceRecord) -> Result<Subscription, ChannelError> {
        self.endpoint.ensure_connected()?;
        let peer_id = record.peer_id;
        {
            let mut tracked = lock(&self.endpoint.tracked);
            if let Some(previous) = tracked.replace(peer_id) {
                if previous != peer_id {
                    self.endpoint.topic.remove_presence(&previous);
                }
            }
        }
        self.endpoint.topic.upsert_presence(record);

        let weak: Weak<Endpoint> = Arc::downgrade(&self.endpoint);
        Ok(Subscription::new(move || {
            if let Some(endpoint) = weak.upgrade() {
                endpoint.untrack(&peer_id);
            }
        }))
    }

    fn broadcast(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.endpoint.ensure_connected()?;
        self.endpoint.topic.publish(Frame::Broadcast {
            origin: self.endpoint.id,
            envelope: Envelope::new(event, payload),
        });
        Ok(())
    }

    fn on(&self, event: &str, handler: BroadcastHandler) -> Subscription {
        let id = self.endpoint.next_handler.fetch_add(1, Ordering::Relaxed);
        lock(&self.endpoint.handlers)
            .broadcast
            .entry(event.to_string())
            .or_default()
            .push((id, handler));

        let weak = Arc::downgrade(&self.endpoint);
        let event = event.to_string();
        Subscription::new(move || {
            if let Some(endpoint) = weak.upgrade() {
                if let Some(hs) = lock(&endpoint.handlers).broadcast.get_mut(&event) {
                    hs.retain(|(hid, _)| *hid != id);
                }
            }
        })
    }

    fn on_presence(&self, kind: PresenceKind, handler: PresenceHandler) -> Subscription {
        let id = self.endpoint.next_handler.fetch_add(1, Ordering::Relaxed);
        lock(&self.endpoint.handlers).presence.push((id, kind, handler));

        let weak = Arc::downgrade(&self.endpoint);
        Subscription::new(move || {
            if let Some(endpoint) = weak.upgrade() {
                lock(&endpoint.handlers).presence.retain(|(hid, _, _)| *hid != id);
            }
        })
    }

    fn presence_state(&self) -> HashMap<PeerId, PresenceRecord> {
        lock(&self.endpoint.topic.presence).clone()
    }

    fn unsubscribe(&self) {
        if self.endpoint.current_status() == ConnectionStatus::Unsubscribed {
            return;
        }
        log::debug!("Endpoint {} unsubscribed from {}", self.endpoint.id, self.endpoint.topic.name);
        self.endpoint.shutdown();
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        // The delivery task keeps the endpoint alive; stop it with us.
        if let Some(pump) = lock(&self.endpoint.pump).take() {
            pump.abort();
        }
    }
}

fn status_stream(rx: watch::Receiver<ConnectionStatus>) -> StatusStream {
    futures_util::stream::unfold((rx, true), |(mut rx, first)| async move {
        if !first {
            rx.changed().await.ok()?;
        }
        let status = *rx.borrow_and_update();
        Some((status, (rx, false)))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PeerIdentity;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};
    use uuid::Uuid;

    async fn wait_subscribed(channel: &MemoryChannel) {
        let mut statuses = channel.subscribe();
        while let Some(status) = statuses.next().await {
            if status == ConnectionStatus::Subscribed {
                return;
            }
        }
        panic!("status stream ended before subscribing");
    }

    fn collect(channel: &MemoryChannel, event: &str) -> (Subscription, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub = channel.on(
            event,
            Arc::new(move |payload: &Value| {
                let _ = tx.send(payload.clone());
            }),
        );
        (sub, rx)
    }

    fn record(name: &str) -> PresenceRecord {
        PresenceRecord::new(&PeerIdentity::new(Uuid::new_v4(), name), 0)
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        timeout(Duration::from_millis(200), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_broadcast_fan_out_with_echo() {
        let hub = MemoryHub::with_defaults();
        let doc = Uuid::new_v4();
        let a = hub.open(doc);
        let b = hub.open(doc);
        let (_sa, mut rx_a) = collect(&a, "state:update");
        let (_sb, mut rx_b) = collect(&b, "state:update");
        wait_subscribed(&a).await;
        wait_subscribed(&b).await;

        a.broadcast("state:update", json!({ "n": 1 })).unwrap();

        assert_eq!(recv(&mut rx_b).await, Some(json!({ "n": 1 })));
        // Echoed back to the sender by default.
        assert_eq!(recv(&mut rx_a).await, Some(json!({ "n": 1 })));
    }

    #[tokio::test]
    async fn test_no_echo_when_disabled() {
        let hub = MemoryHub::new(HubConfig { capacity: 16, echo_to_sender: false });
        let doc = Uuid::new_v4();
        let a = hub.open(doc);
        let b = hub.open(doc);
        let (_sa, mut rx_a) = collect(&a, "x");
        let (_sb, mut rx_b) = collect(&b, "x");
        wait_subscribed(&a).await;
        wait_subscribed(&b).await;

        a.broadcast("x", json!(1)).unwrap();
        assert_eq!(recv(&mut rx_b).await, Some(json!(1)));
        assert_eq!(recv(&mut rx_a).await, None);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = MemoryHub::with_defaults();
        let a = hub.open(Uuid::new_v4());
        let b = hub.open(Uuid::new_v4());
        let (_sb, mut rx_b) = collect(&b, "x");
        wait_subscribed(&a).await;
        wait_subscribed(&b).await;

        a.broadcast("x", json!(1)).unwrap();
        assert_eq!(recv(&mut rx_b).await, None);
        assert_eq!(hub.topic_count(), 2);
    }

    #[tokio::test]
    async fn test_disposed_handler_stops_receiving() {
        let hub = MemoryHub::with_defaults();
        let doc = Uuid::new_v4();
        let a = hub.open(doc);
        let (sub, mut rx) = collect(&a, "x");
        wait_subscribed(&a).await;

        sub.dispose();
        a.broadcast("x", json!(1)).unwrap();
        assert_eq!(recv(&mut rx).await, None);
    }

    #[tokio::test]
    async fn test_broadcast_requires_subscription() {
        let hub = MemoryHub::with_defaults();
        let a = hub.open(Uuid::new_v4());
        assert_eq!(a.broadcast("x", json!(1)), Err(ChannelError::Disconnected));
        assert!(a.track(record("Alice")).is_err());

        wait_subscribed(&a).await;
        a.unsubscribe();
        assert_eq!(a.status(), ConnectionStatus::Unsubscribed);
        assert_eq!(a.broadcast("x", json!(1)), Err(ChannelError::Closed));
    }

    #[tokio::test]
    async fn test_track_publishes_sync_to_others() {
        let hub = MemoryHub::with_defaults();
        let doc = Uuid::new_v4();
        let a = hub.open(doc);
        let b = hub.open(doc);

        let (tx, mut syncs) = mpsc::unbounded_channel();
        let _sub = b.on_presence(
            PresenceKind::Sync,
            Arc::new(move |event: &PresenceEvent| {
                if let PresenceEvent::Sync(table) = event {
                    let _ = tx.send(table.len());
                }
            }),
        );
        wait_subscribed(&a).await;
        wait_subscribed(&b).await;
        // Initial sync on subscribe: empty table.
        assert_eq!(recv(&mut syncs).await, Some(0));

        let alice = record("Alice");
        let tracked = a.track(alice.clone()).unwrap();
        assert_eq!(recv(&mut syncs).await, Some(1));
        assert!(a.presence_state().contains_key(&alice.peer_id));

        // Re-tracking the same peer updates in place.
        let again = a.track(alice.clone()).unwrap();
        assert_eq!(recv(&mut syncs).await, Some(1));
        drop(again);

        tracked.dispose();
        assert_eq!(recv(&mut syncs).await, Some(0));
        assert!(a.presence_state().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_drops_frames_and_presence() {
        let hub = MemoryHub::with_defaults();
        let doc = Uuid::new_v4();
        let a = hub.open(doc);
        let b = hub.open(doc);
        let (_sb, mut rx_b) = collect(&b, "x");
        wait_subscribed(&a).await;
        wait_subscribed(&b).await;
        let _tracked = b.track(record("Bob")).unwrap();

        b.disconnect();
        assert_eq!(b.status(), ConnectionStatus::Disconnected);
        assert!(b.presence_state().is_empty());
        assert_eq!(b.broadcast("x", json!(0)), Err(ChannelError::Disconnected));

        a.broadcast("x", json!(1)).unwrap();
        assert_eq!(recv(&mut rx_b).await, None);

        b.reconnect();
        assert_eq!(b.status(), ConnectionStatus::Subscribed);
        a.broadcast("x", json!(2)).unwrap();
        assert_eq!(recv(&mut rx_b).await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_status_stream_reports_transitions() {
        let hub = MemoryHub::with_defaults();
        let a = hub.open(Uuid::new_v4());
        let mut statuses = a.subscribe();
        loop {
            let status = timeout(Duration::from_secs(1), statuses.next()).await.unwrap().unwrap();
            if status == ConnectionStatus::Subscribed {
                break;
            }
        }
        a.disconnect();
        let next = timeout(Duration::from_secs(1), statuses.next()).await.unwrap();
        assert_eq!(next, Some(ConnectionStatus::Disconnected));
        a.reconnect();
        let next = timeout(Duration::from_secs(1), statuses.next()).await.unwrap();
        assert_eq!(next, Some(ConnectionStatus::Subscribed));
    }

    #[tokio::test]
    async fn test_stats_and_cleanup() {
        let hub = MemoryHub::with_defaults();
        let doc = Uuid::new_v4();
        let a = hub.open(doc);
        wait_subscribed(&a).await;
        a.broadcast("x", json!(1)).unwrap();
        a.broadcast("x", json!(2)).unwrap();

        let stats = hub.stats(doc).unwrap();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.active_endpoints, 1);
        assert!(!hub.remove_if_empty(doc));

        a.unsubscribe();
        drop(a);
        // The aborted delivery task releases its receiver once polled.
        let mut removed = false;
        for _ in 0..20 {
            tokio::task::yield_now().await;
            if hub.remove_if_empty(doc) {
                removed = true;
                break;
            }
        }
        assert!(removed);
        assert_eq!(hub.topic_count(), 0);
    }
}
