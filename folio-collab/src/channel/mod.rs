//! Publish/subscribe channel scoped to one document.
//!
//! A channel offers three things and no business logic:
//!
//! - presence tracking keyed by peer id (`track`, `on_presence`)
//! - named broadcast messages with a JSON payload (`broadcast`, `on`)
//! - a subscription lifecycle reported as a stream of [`ConnectionStatus`]
//!
//! ```text
//!   Connecting ──► Subscribed ◄──► Disconnected
//!                      │
//!                      ▼
//!                 Unsubscribed
//! ```
//!
//! Reconnection is the transport's job. Consumers only see `Disconnected`
//! followed by `Subscribed` again and must treat that as a fresh join.
//!
//! Every `on`/`on_presence`/`track` call returns a [`Subscription`]. Callers
//! collect them in a [`DisposeBag`] and tear them down in reverse order.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::presence::PresenceRecord;
use crate::state::PeerId;

pub use memory::{HubConfig, MemoryChannel, MemoryHub, TopicStats};

/// Identifier of a document (and therefore of its channel).
pub type DocumentId = Uuid;

/// Channel topic for a document.
pub fn document_topic(document_id: DocumentId) -> String {
    format!("document:{document_id}")
}

/// Subscription lifecycle as seen by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Subscribed,
    /// Transport lost; the transport is retrying.
    Disconnected,
    /// Closed by the consumer. Terminal.
    Unsubscribed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Subscribed)
    }
}

/// Presence notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceKind {
    Sync,
    Join,
    Leave,
}

/// Channel-native presence notification.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Authoritative table of everyone currently tracked.
    Sync(HashMap<PeerId, PresenceRecord>),
    Join(PresenceRecord),
    Leave(PresenceRecord),
}

impl PresenceEvent {
    pub fn kind(&self) -> PresenceKind {
        match self {
            PresenceEvent::Sync(_) => PresenceKind::Sync,
            PresenceEvent::Join(_) => PresenceKind::Join,
            PresenceEvent::Leave(_) => PresenceKind::Leave,
        }
    }
}

pub type BroadcastHandler = Arc<dyn Fn(&Value) + Send + Sync>;
pub type PresenceHandler = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;
pub type StatusStream = BoxStream<'static, ConnectionStatus>;

/// Document channel contract.
///
/// Handlers run on the transport's delivery task. They must not block; the
/// expected pattern is to forward into the owning session's inbox.
pub trait Channel: Send + Sync {
    fn topic(&self) -> &str;

    /// Start the subscription. The stream yields the current status first and
    /// then every transition.
    fn subscribe(&self) -> StatusStream;

    fn status(&self) -> ConnectionStatus;

    /// Publish or update this peer's presence record.
    fn track(&self, record: PresenceRecord) -> Result<Subscription, ChannelError>;

    fn broadcast(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    /// Register a handler for broadcast messages named `event`.
    fn on(&self, event: &str, handler: BroadcastHandler) -> Subscription;

    fn on_presence(&self, kind: PresenceKind, handler: PresenceHandler) -> Subscription;

    /// Current authoritative presence table.
    fn presence_state(&self) -> HashMap<PeerId, PresenceRecord>;

    fn unsubscribe(&self);
}

/// Opens the channel for a document.
pub trait ChannelFactory: Send + Sync {
    fn open_channel(&self, document_id: DocumentId) -> Arc<dyn Channel>;
}

/// Channel errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is disconnected")]
    Disconnected,
    #[error("channel is closed")]
    Closed,
    #[error("receiver lagged by {0} messages")]
    Lagged(u64),
}

// ───────────────────────────────────────────────────────────────────
// Subscription handles
// ───────────────────────────────────────────────────────────────────

/// Handle for one registration. Disposal is explicit; dropping the handle
/// leaves the registration in place.
#[must_use = "keep the subscription and dispose it on teardown"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// A handle with nothing to undo.
    pub fn noop() -> Self {
        Self { dispose: None }
    }

    pub fn dispose(mut self) {
        if let Some(f) = self.dispose.take() {
            f();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("live", &self.dispose.is_some())
            .finish()
    }
}

/// Ordered list of subscriptions disposed last-in first-out.
#[derive(Debug, Default)]
pub struct DisposeBag {
    subscriptions: Vec<Subscription>,
}

impl DisposeBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Dispose everything, newest first.
    pub fn dispose_all(&mut self) {
        while let Some(sub) = self.subscriptions.pop() {
            sub.dispose();
        }
    }
}

impl Drop for DisposeBag {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
