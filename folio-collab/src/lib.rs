//! # folio-collab: Document synchronization core for Folio
//!
//! Keeps every peer editing the same document converged on one shared
//! state, over a broadcast channel that may drop, duplicate, reorder or loop
//! back messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   state:update    ┌──────────────┐
//! │ CollabSession│ ◄───────────────► │ CollabSession│
//! │  (peer A)    │   state:request   │  (peer B)    │
//! └──────┬───────┘   state:response  └──────┬───────┘
//!        │           presence               │
//!        └──────────────┬───────────────────┘
//!                       ▼
//!              ┌─────────────────┐
//!              │ Channel (topic  │
//!              │ per document)   │
//!              └─────────────────┘
//! ```
//!
//! There is no server holding canonical state. A joining peer asks everyone
//! for their snapshot, waits a bounded window, and takes the winner under
//! last-writer-wins ordering `(version, last_modified, author_id)`.
//!
//! ## Modules
//!
//! - [`state`]: `DocumentState`, LWW ordering, selection restoration
//! - [`protocol`]: broadcast event names and payloads
//! - [`channel`]: channel contract, subscription handles, in-memory hub
//! - [`presence`]: presence records, colours, liveness
//! - [`reconciler`]: join protocol and version gate
//! - [`pipeline`]: debounced local edits and echo guard
//! - [`cursor`]: throttled cursor publication
//! - [`session`]: per-document actor tying it all together
//! - [`store`]: persistence collaborator
//! - [`profiles`]: cached profile enrichment for presence

pub mod channel;
pub mod cursor;
pub mod error;
pub mod pipeline;
pub mod presence;
pub mod profiles;
pub mod protocol;
pub mod reconciler;
pub mod session;
pub mod state;
pub mod store;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-exports for convenience
pub use channel::{
    document_topic, Channel, ChannelError, ChannelFactory, ConnectionStatus, DisposeBag,
    DocumentId, HubConfig, MemoryChannel, MemoryHub, PresenceEvent, PresenceKind, Subscription,
    TopicStats,
};
pub use cursor::CursorBroadcaster;
pub use error::SyncError;
pub use pipeline::{Debouncer, EchoGuard, LocalEditPipeline};
pub use presence::{
    CursorPosition, Liveness, PeerColor, PeerIdentity, PresenceRecord, PresenceTracker,
};
pub use profiles::{Profile, ProfileCache, ProfileError, ProfileSource};
pub use protocol::{CollabMessage, Envelope, EventKind, PeerStamp, ProtocolError};
pub use reconciler::{JoinResolution, Phase, PendingUpdateQueue, Reconciler, UpdateOutcome};
pub use session::{AppliedContent, CollabSession, SessionConfig, SessionEvent};
pub use state::{resolve_conflicts, DocumentState, PeerId, Selection};
pub use store::{DocumentStore, FileStore, MemoryStore, StoreError};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
