//! Broadcast messages exchanged over a document channel.
//!
//! Every message travels as an [`Envelope`]: an event name plus a JSON
//! payload. The channel layer never looks inside the payload; parsing into a
//! typed [`CollabMessage`] happens at the receiving peer.
//!
//! | Event                | Payload                 |
//! |----------------------|-------------------------|
//! | `user:join`          | `{peerId, timestamp}`   |
//! | `state:request`      | `{peerId, timestamp}`   |
//! | `state:response`     | `DocumentState`         |
//! | `state:update`       | `DocumentState`         |
//! | `presence:heartbeat` | `{peerId, timestamp}`   |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::state::{DocumentState, PeerId};

/// Broadcast event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserJoin,
    StateRequest,
    StateResponse,
    StateUpdate,
    Heartbeat,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::UserJoin,
        EventKind::StateRequest,
        EventKind::StateResponse,
        EventKind::StateUpdate,
        EventKind::Heartbeat,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::UserJoin => "user:join",
            EventKind::StateRequest => "state:request",
            EventKind::StateResponse => "state:response",
            EventKind::StateUpdate => "state:update",
            EventKind::Heartbeat => "presence:heartbeat",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

/// `{peerId, timestamp}` payload shared by join, request and heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStamp {
    pub peer_id: PeerId,
    pub timestamp: u64,
}

/// Raw broadcast frame as carried by a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Malformed {
            event: "<envelope>".to_string(),
            reason: e.to_string(),
        })
    }
}

/// Typed view of a broadcast message.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabMessage {
    /// A peer announces it joined the document.
    UserJoin(PeerStamp),
    /// A joining peer asks everyone for their current state.
    StateRequest(PeerStamp),
    /// Answer to a request or join: the responder's snapshot.
    StateResponse(DocumentState),
    /// A locally produced new state.
    StateUpdate(DocumentState),
    /// Liveness ping.
    Heartbeat(PeerStamp),
}

impl CollabMessage {
    pub fn user_join(peer_id: PeerId, timestamp: u64) -> Self {
        Self::UserJoin(PeerStamp { peer_id, timestamp })
    }

    pub fn state_request(peer_id: PeerId, timestamp: u64) -> Self {
        Self::StateRequest(PeerStamp { peer_id, timestamp })
    }

    pub fn heartbeat(peer_id: PeerId, timestamp: u64) -> Self {
        Self::Heartbeat(PeerStamp { peer_id, timestamp })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            CollabMessage::UserJoin(_) => EventKind::UserJoin,
            CollabMessage::StateRequest(_) => EventKind::StateRequest,
            CollabMessage::StateResponse(_) => EventKind::StateResponse,
            CollabMessage::StateUpdate(_) => EventKind::StateUpdate,
            CollabMessage::Heartbeat(_) => EventKind::Heartbeat,
        }
    }

    /// Peer that originated this message.
    pub fn sender(&self) -> PeerId {
        match self {
            CollabMessage::UserJoin(stamp)
            | CollabMessage::StateRequest(stamp)
            | CollabMessage::Heartbeat(stamp) => stamp.peer_id,
            CollabMessage::StateResponse(state) | CollabMessage::StateUpdate(state) => {
                state.author_id
            }
        }
    }

    /// Split into event name and JSON payload.
    pub fn to_envelope(&self) -> Result<Envelope, ProtocolError> {
        let payload = match self {
            CollabMessage::UserJoin(stamp)
            | CollabMessage::StateRequest(stamp)
            | CollabMessage::Heartbeat(stamp) => serde_json::to_value(stamp),
            CollabMessage::StateResponse(state) | CollabMessage::StateUpdate(state) => {
                serde_json::to_value(state)
            }
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Envelope::new(self.kind().name(), payload))
    }

    /// Parse a payload received under `event`.
    pub fn parse(event: &str, payload: &Value) -> Result<Self, ProtocolError> {
        let kind =
            EventKind::from_name(event).ok_or_else(|| ProtocolError::UnknownEvent(event.into()))?;
        let malformed = |e: serde_json::Error| ProtocolError::Malformed {
            event: event.to_string(),
            reason: e.to_string(),
        };
        let msg = match kind {
            EventKind::UserJoin => {
                CollabMessage::UserJoin(PeerStamp::deserialize(payload).map_err(malformed)?)
            }
            EventKind::StateRequest => {
                CollabMessage::StateRequest(PeerStamp::deserialize(payload).map_err(malformed)?)
            }
            EventKind::Heartbeat => {
                CollabMessage::Heartbeat(PeerStamp::deserialize(payload).map_err(malformed)?)
            }
            EventKind::StateResponse => CollabMessage::StateResponse(
                DocumentState::deserialize(payload).map_err(malformed)?,
            ),
            EventKind::StateUpdate => CollabMessage::StateUpdate(
                DocumentState::deserialize(payload).map_err(malformed)?,
            ),
        };
        Ok(msg)
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        Self::parse(&envelope.event, &envelope.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("malformed `{event}` payload: {reason}")]
    Malformed { event: String, reason: String },
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
}
