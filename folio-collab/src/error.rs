//! Application-facing errors.

use thiserror::Error;

use crate::channel::ChannelError;
use crate::protocol::ProtocolError;
use crate::store::StoreError;

/// Errors returned by the session API.
///
/// Transport trouble is reported through connection status, not here; a
/// `Channel` variant only appears when a caller-initiated send fails outright.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("document state is not initialized yet")]
    NotInitialized,
    #[error("document is read-only for this peer")]
    ReadOnly,
    #[error("collaboration session is closed")]
    SessionClosed,
    #[error("failed to join collaboration session after {attempts} attempts")]
    JoinFailed { attempts: u32 },
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
