//! Presence: who is connected to a document and whether they are alive.
//!
//! ## Data flow
//!
//! ```text
//! channel subscribed ──► PresenceTracker::touch() ──► Channel::track(local record)
//!
//! presence "sync"    ──► PresenceTracker::handle()   (replace whole table)
//! presence join/leave──► PresenceTracker::handle()   (logged only)
//! presence:heartbeat ──► PresenceTracker::record_heartbeat()
//! ```
//!
//! Each peer owns and publishes only its own [`PresenceRecord`]. The table of
//! everyone else is a read-only copy of the channel's authoritative view.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::channel::PresenceEvent;
use crate::protocol::{CollabMessage, PeerStamp};
use crate::state::{PeerId, Selection};

/// A peer counts as active if seen within this window.
pub const ACTIVE_WINDOW_MS: u64 = 60_000;
/// A peer counts as idle (rather than stale) if seen within this window.
pub const IDLE_WINDOW_MS: u64 = 300_000;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Stable per-peer colour, derived from the peer id.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeerColor {
    /// Hue in degrees, `0..360`.
    pub hue: u16,
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl PeerColor {
    const SATURATION: f32 = 0.7;
    const LIGHTNESS: f32 = 0.6;

    /// Derive a colour from a peer id. The same id always yields the same
    /// colour, so it survives reconnects.
    pub fn from_peer(id: PeerId) -> Self {
        let hue = (id.as_u128() % 360) as u16;
        let (r, g, b) = hsl_to_rgb(f32::from(hue) / 360.0, Self::SATURATION, Self::LIGHTNESS);
        Self { hue, r, g, b, a: 1.0 }
    }

    /// CSS form, e.g. `hsl(212, 70%, 60%)`.
    pub fn css(&self) -> String {
        format!("hsl({}, 70%, 60%)", self.hue)
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Pointer position over the content surface plus the current selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, selection: None }
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// What the identity provider knows about the local user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
}

impl PeerIdentity {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            avatar_ref: None,
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }
}

/// One peer's published presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub peer_id: PeerId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub color: PeerColor,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    /// Milliseconds since epoch of the last track or heartbeat.
    pub last_active: u64,
}

impl PresenceRecord {
    pub fn new(identity: &PeerIdentity, now_ms: u64) -> Self {
        Self {
            peer_id: identity.peer_id,
            display_name: identity.display_name.clone(),
            avatar_ref: identity.avatar_ref.clone(),
            email: None,
            color: PeerColor::from_peer(identity.peer_id),
            cursor: None,
            last_active: now_ms,
        }
    }

    pub fn liveness(&self, now_ms: u64) -> Liveness {
        Liveness::classify(self.last_active, now_ms)
    }
}

/// Display-only liveness bucket. Never gates correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Idle,
    Stale,
}

impl Liveness {
    pub fn classify(last_active: u64, now_ms: u64) -> Self {
        let age = now_ms.saturating_sub(last_active);
        if age < ACTIVE_WINDOW_MS {
            Liveness::Active
        } else if age < IDLE_WINDOW_MS {
            Liveness::Idle
        } else {
            Liveness::Stale
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Local presence record plus the read-only table of everyone on the channel.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local: PresenceRecord,
    peers: HashMap<PeerId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new(identity: &PeerIdentity, now_ms: u64) -> Self {
        Self {
            local: PresenceRecord::new(identity, now_ms),
            peers: HashMap::new(),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local.peer_id
    }

    /// The record this peer publishes.
    pub fn local(&self) -> &PresenceRecord {
        &self.local
    }

    /// Refresh `last_active` and return the record to publish.
    pub fn touch(&mut self, now_ms: u64) -> &PresenceRecord {
        self.local.last_active = self.local.last_active.max(now_ms);
        &self.local
    }

    /// Store a new cursor position and refresh `last_active`.
    pub fn set_cursor(&mut self, cursor: CursorPosition, now_ms: u64) -> &PresenceRecord {
        self.local.cursor = Some(cursor);
        self.touch(now_ms)
    }

    /// Build the liveness ping and refresh the local record.
    pub fn heartbeat(&mut self, now_ms: u64) -> CollabMessage {
        self.touch(now_ms);
        CollabMessage::heartbeat(self.local.peer_id, now_ms)
    }

    /// Apply a channel presence notification.
    ///
    /// Only `Sync` changes the table; join/leave are informational.
    /// Returns `true` if the table changed.
    pub fn handle(&mut self, event: &PresenceEvent) -> bool {
        match event {
            PresenceEvent::Sync(table) => {
                if *table == self.peers {
                    return false;
                }
                self.peers = table.clone();
                true
            }
            PresenceEvent::Join(record) => {
                log::info!("Presence: {} ({}) joined", record.display_name, record.peer_id);
                false
            }
            PresenceEvent::Leave(record) => {
                log::info!("Presence: {} ({}) left", record.display_name, record.peer_id);
                false
            }
        }
    }

    /// Refresh a remote peer's `last_active` from its heartbeat.
    pub fn record_heartbeat(&mut self, stamp: &PeerStamp) -> bool {
        match self.peers.get_mut(&stamp.peer_id) {
            Some(record) if stamp.timestamp > record.last_active => {
                record.last_active = stamp.timestamp;
                true
            }
            _ => false,
        }
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<&PresenceRecord> {
        self.peers.get(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Copy of the whole table, keyed by peer id.
    pub fn snapshot(&self) -> HashMap<PeerId, PresenceRecord> {
        self.peers.clone()
    }

    /// Everyone except the local peer.
    pub fn others(&self) -> impl Iterator<Item = &PresenceRecord> {
        let local = self.local.peer_id;
        self.peers.values().filter(move |r| r.peer_id != local)
    }

    pub fn liveness(&self, peer_id: &PeerId, now_ms: u64) -> Option<Liveness> {
        self.peers.get(peer_id).map(|r| r.liveness(now_ms))
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
