//! Join protocol and version gate for one document.
//!
//! ```text
//!  Uninitialized ──self join──► AwaitingPeerState ──window closes──► Initialized
//!                                      ▲                                 │
//!                                      └──────── reconnect / retry ──────┘
//! ```
//!
//! While awaiting peer state every `state:response` is collected and every
//! `state:update` is queued. When the collection window closes the winning
//! candidate (or a version-0 fallback when nobody answered) is installed and
//! the queue is replayed in arrival order through the version gate.
//!
//! The reconciler does no I/O and owns no timers. The session drives it and
//! sends whatever messages it returns.

use std::collections::VecDeque;

use serde_json::Value;

use crate::error::SyncError;
use crate::protocol::{CollabMessage, PeerStamp};
use crate::state::{resolve_conflicts, DocumentState, PeerId, Selection};

/// Reconciler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    AwaitingPeerState,
    Initialized,
}

/// What happened to an incoming state.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// Passed the version gate and replaced the local state.
    Applied(DocumentState),
    /// Held until initialization finishes.
    Queued,
    /// Kept as a join candidate.
    Collected,
    /// Not newer than the local state. Not an error.
    Stale,
    /// Our own update looped back by the transport.
    Echo,
}

/// Result of closing the collection window.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinResolution {
    /// The state installed by the join.
    pub resolved: DocumentState,
    /// Number of peer responses that were considered.
    pub responses: usize,
    /// `true` when no candidate existed and the fallback was used.
    pub bootstrapped: bool,
    /// States that replaced the local state, in order: the resolved state
    /// (if it changed anything) followed by queued updates that passed the gate.
    pub applied: Vec<DocumentState>,
}

/// Updates received before initialization, kept in arrival order.
#[derive(Debug, Clone, Default)]
pub struct PendingUpdateQueue {
    queue: VecDeque<DocumentState>,
}

impl PendingUpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, state: DocumentState) {
        self.queue.push_back(state);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = DocumentState> + '_ {
        self.queue.drain(..)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Per-document reconciliation state machine.
#[derive(Debug, Clone)]
pub struct Reconciler {
    peer_id: PeerId,
    phase: Phase,
    current: Option<DocumentState>,
    responses: Vec<DocumentState>,
    pending: PendingUpdateQueue,
}

impl Reconciler {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            phase: Phase::Uninitialized,
            current: None,
            responses: Vec::new(),
            pending: PendingUpdateQueue::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_initialized(&self) -> bool {
        self.phase == Phase::Initialized
    }

    pub fn current(&self) -> Option<&DocumentState> {
        self.current.as_ref()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn collected_len(&self) -> usize {
        self.responses.len()
    }

    /// Enter `AwaitingPeerState` and build the `state:request` to broadcast.
    ///
    /// Also used for rejoin: the current state is kept and competes with the
    /// responses when the window closes.
    pub fn begin_join(&mut self, now_ms: u64) -> CollabMessage {
        self.phase = Phase::AwaitingPeerState;
        self.responses.clear();
        CollabMessage::state_request(self.peer_id, now_ms)
    }

    /// Handle a `state:response`.
    pub fn handle_response(&mut self, state: DocumentState) -> UpdateOutcome {
        match self.phase {
            Phase::AwaitingPeerState => {
                self.responses.push(state);
                UpdateOutcome::Collected
            }
            // Answers to someone else's request; still valid states.
            Phase::Uninitialized => {
                self.pending.push(state);
                UpdateOutcome::Queued
            }
            // Late answer to our own request.
            Phase::Initialized => self.gate(state),
        }
    }

    /// Handle a `state:update`.
    pub fn handle_update(&mut self, state: DocumentState) -> UpdateOutcome {
        if state.author_id == self.peer_id {
            return UpdateOutcome::Echo;
        }
        if self.phase != Phase::Initialized {
            self.pending.push(state);
            return UpdateOutcome::Queued;
        }
        self.gate(state)
    }

    /// Answer another peer's `state:request` or `user:join`.
    ///
    /// Returns the snapshot to send as `state:response`, or `None` for our
    /// own stamp or while we hold no state at all. A rejoining peer still
    /// answers with the state it had before the outage.
    pub fn handle_request(&self, stamp: &PeerStamp) -> Option<DocumentState> {
        if stamp.peer_id == self.peer_id {
            return None;
        }
        self.current.clone()
    }

    /// Close the collection window.
    ///
    /// Candidates are the collected responses plus the current state (so a
    /// rejoin never regresses). With no candidate at all a version-0 state
    /// authored by this peer is installed, using `fallback_content` or the
    /// empty document.
    pub fn finish_join(&mut self, fallback_content: Option<Value>, now_ms: u64) -> JoinResolution {
        let responses = self.responses.len();
        let previous = self.current.take();
        let candidates = self.responses.drain(..).chain(previous.clone());

        let (resolved, bootstrapped) = match resolve_conflicts(candidates) {
            Some(winner) => (winner, false),
            None => (DocumentState::initial(self.peer_id, fallback_content, now_ms), true),
        };

        let mut applied = Vec::new();
        if previous.as_ref() != Some(&resolved) {
            applied.push(resolved.clone());
        }
        self.current = Some(resolved.clone());
        self.phase = Phase::Initialized;

        let queued: Vec<DocumentState> = self.pending.drain().collect();
        for state in queued {
            if let UpdateOutcome::Applied(state) = self.gate(state) {
                applied.push(state);
            }
        }

        JoinResolution {
            resolved,
            responses,
            bootstrapped,
            applied,
        }
    }

    /// Produce the next local state from edited content.
    pub fn local_update(
        &mut self,
        content: Value,
        selection: Option<Selection>,
        now_ms: u64,
    ) -> Result<DocumentState, SyncError> {
        if self.phase != Phase::Initialized {
            return Err(SyncError::NotInitialized);
        }
        let current = self.current.as_ref().ok_or(SyncError::NotInitialized)?;
        let next = DocumentState {
            version: current.version + 1,
            content,
            last_modified: now_ms,
            author_id: self.peer_id,
            selection,
        };
        self.current = Some(next.clone());
        Ok(next)
    }

    /// Drop everything: queue, candidates and the current state.
    pub fn reset(&mut self) {
        self.phase = Phase::Uninitialized;
        self.current = None;
        self.responses.clear();
        self.pending.clear();
    }

    fn gate(&mut self, state: DocumentState) -> UpdateOutcome {
        let newer = match &self.current {
            Some(current) => state.supersedes(current),
            None => true,
        };
        if !newer {
            return UpdateOutcome::Stale;
        }
        self.current = Some(state.clone());
        UpdateOutcome::Applied(state)
    }
}
