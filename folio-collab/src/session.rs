//! One collaborative session per open document.
//!
//! ```text
//!              CollabSession (handle)
//!                     │ commands (mpsc)
//!                     ▼
//!  channel handlers ──► SessionActor ◄── status stream
//!  (parse + forward)    │  select! over inbox, status, heartbeat,
//!                       │  collection window, debounce, cursor, retry
//!                       ├── Reconciler        (join protocol, version gate)
//!                       ├── PresenceTracker   (local record, peer table)
//!                       ├── LocalEditPipeline (debounce, echo guard)
//!                       └── CursorBroadcaster (throttle)
//! ```
//!
//! Everything that touches session state runs on the actor task, so no
//! component needs a lock of its own. The handle only reads snapshots the
//! actor publishes and sends commands into its inbox.
//!
//! Teardown is guarded by a single `live` flag: channel handlers stop
//! forwarding and content handlers stop firing as soon as it is cleared.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

use crate::channel::{
    Channel, ChannelError, ChannelFactory, ConnectionStatus, DisposeBag, DocumentId,
    PresenceEvent, PresenceKind, StatusStream, Subscription,
};
use crate::cursor::CursorBroadcaster;
use crate::error::SyncError;
use crate::lock;
use crate::pipeline::LocalEditPipeline;
use crate::presence::{CursorPosition, PeerIdentity, PresenceRecord, PresenceTracker};
use crate::protocol::{CollabMessage, EventKind, PeerStamp};
use crate::reconciler::{Phase, Reconciler, UpdateOutcome};
use crate::state::{now_millis, restore_selection, DocumentState, PeerId, Selection};
use crate::store::{Autosaver, DocumentStore, StoreError};

const EVENT_CAPACITY: usize = 64;

/// Session timing and behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a joining peer collects `state:response`s.
    pub collection_window_ms: u64,
    /// Liveness ping interval while connected.
    pub heartbeat_interval_ms: u64,
    /// Quiet period before a burst of local edits is emitted.
    pub debounce_wait_ms: u64,
    /// Upper bound on how long a sustained burst is delayed.
    pub debounce_max_wait_ms: u64,
    /// How long a just-emitted content counts as our own echo.
    pub echo_grace_ms: u64,
    /// Minimum interval between cursor publications.
    pub cursor_throttle_ms: u64,
    /// Join retries before the session gives up.
    pub max_join_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub join_backoff_base_ms: u64,
    /// Save content through the store after every local emission.
    pub autosave: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            collection_window_ms: 2_000,
            heartbeat_interval_ms: 30_000,
            debounce_wait_ms: 300,
            debounce_max_wait_ms: 1_000,
            echo_grace_ms: 50,
            cursor_throttle_ms: 100,
            max_join_retries: 3,
            join_backoff_base_ms: 1_000,
            autosave: true,
        }
    }
}

impl SessionConfig {
    pub fn collection_window(&self) -> Duration {
        Duration::from_millis(self.collection_window_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn debounce_wait(&self) -> Duration {
        Duration::from_millis(self.debounce_wait_ms)
    }

    pub fn debounce_max_wait(&self) -> Duration {
        Duration::from_millis(self.debounce_max_wait_ms)
    }

    pub fn echo_grace(&self) -> Duration {
        Duration::from_millis(self.echo_grace_ms)
    }

    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(self.cursor_throttle_ms)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`.
    pub fn join_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.join_backoff_base_ms.saturating_mul(1 << exponent))
    }
}

/// Notifications for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Channel subscribed (first time or after an outage).
    Connected,
    /// Transport lost; outgoing content is held until the next join.
    Reconnecting,
    Initialized {
        version: u64,
        responses: usize,
        bootstrapped: bool,
    },
    /// A state from the join or from a peer replaced the local content.
    RemoteApplied(DocumentState),
    PresenceChanged { peers: usize },
    /// Fatal: the session could not join and has shut down.
    JoinFailed { attempts: u32 },
    Closed,
}

/// Converged content handed back to the edit surface.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedContent {
    pub state: DocumentState,
    /// The caller's selection, restored or collapsed to end-of-content.
    pub selection: Selection,
}

pub type ContentHandler = Arc<dyn Fn(&AppliedContent) + Send + Sync>;

enum Command {
    ContentChanged(Value),
    SelectionChanged(Option<Selection>),
    CursorMoved(CursorPosition),
    Message(CollabMessage),
    Presence(PresenceEvent),
    Dispose(oneshot::Sender<()>),
}

/// State the actor publishes for the handle to read.
struct Shared {
    document_id: DocumentId,
    peer_id: PeerId,
    can_edit: bool,
    live: Arc<AtomicBool>,
    status: Mutex<ConnectionStatus>,
    phase: Mutex<Phase>,
    state: Mutex<Option<DocumentState>>,
    presence: Mutex<HashMap<PeerId, PresenceRecord>>,
    content_handlers: Mutex<Vec<(u64, ContentHandler)>>,
    next_handler: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

/// Application-facing handle to a document session.
///
/// Dropping the handle tears the session down; call [`dispose`] to wait for
/// teardown to finish.
///
/// [`dispose`]: CollabSession::dispose
pub struct CollabSession {
    shared: Arc<Shared>,
    inbox: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CollabSession {
    /// Open the document's channel and start the session.
    ///
    /// The store supplies the content a solo peer bootstraps from and the
    /// edit permission. Must be called from within a tokio runtime.
    pub async fn initialize(
        document_id: DocumentId,
        identity: PeerIdentity,
        store: Arc<dyn DocumentStore>,
        channels: &dyn ChannelFactory,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        let channel = channels.open_channel(document_id);
        Self::initialize_with_channel(document_id, identity, store, channel, config).await
    }

    /// Start a session on an already opened channel.
    pub async fn initialize_with_channel(
        document_id: DocumentId,
        identity: PeerIdentity,
        store: Arc<dyn DocumentStore>,
        channel: Arc<dyn Channel>,
        config: SessionConfig,
    ) -> Result<Self, SyncError> {
        let fallback_content = match store.load(document_id) {
            Ok(content) => content,
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let can_edit = store.can_edit(identity.peer_id, document_id);
        if !can_edit {
            log::info!("Document {document_id} is read-only for {}", identity.peer_id);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            document_id,
            peer_id: identity.peer_id,
            can_edit,
            live: Arc::new(AtomicBool::new(true)),
            status: Mutex::new(channel.status()),
            phase: Mutex::new(Phase::Uninitialized),
            state: Mutex::new(None),
            presence: Mutex::new(HashMap::new()),
            content_handlers: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            events,
        });

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let mut bag = DisposeBag::new();
        register_handlers(channel.as_ref(), &shared.live, &inbox_tx, &mut bag);
        let statuses = channel.subscribe();

        let mut heartbeat = time::interval_at(
            Instant::now() + config.heartbeat_interval(),
            config.heartbeat_interval(),
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let actor = SessionActor {
            shared: shared.clone(),
            reconciler: Reconciler::new(identity.peer_id),
            presence: PresenceTracker::new(&identity, now_millis()),
            pipeline: LocalEditPipeline::new(
                config.debounce_wait(),
                config.debounce_max_wait(),
                config.echo_grace(),
            ),
            cursor: CursorBroadcaster::new(config.cursor_throttle()),
            autosave: config.autosave.then(|| Autosaver::spawn(document_id, store)),
            config,
            channel,
            inbox: inbox_rx,
            statuses: Some(statuses),
            bag,
            tracked: None,
            heartbeat,
            fallback_content,
            status: ConnectionStatus::Connecting,
            selection: None,
            join_stamp: None,
            window: None,
            retry_at: None,
            attempts: 0,
            closed: false,
        };

        log::info!("Opening session for document {document_id} as {}", identity.peer_id);
        let task = tokio::spawn(actor.run());

        Ok(Self {
            shared,
            inbox: inbox_tx,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn document_id(&self) -> DocumentId {
        self.shared.document_id
    }

    pub fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    pub fn is_read_only(&self) -> bool {
        !self.shared.can_edit
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    /// Called by the edit surface on every local mutation.
    pub fn on_content_change(&self, content: Value) -> Result<(), SyncError> {
        if !self.shared.can_edit {
            return Err(SyncError::ReadOnly);
        }
        self.send(Command::ContentChanged(content))
    }

    /// The caller's current selection, restored after remote applies and
    /// attached to the next local state.
    pub fn set_selection(&self, selection: Option<Selection>) -> Result<(), SyncError> {
        self.send(Command::SelectionChanged(selection))
    }

    /// Pointer movement over the content surface. Throttled and lossy.
    pub fn move_cursor(&self, cursor: CursorPosition) -> Result<(), SyncError> {
        self.send(Command::CursorMoved(cursor))
    }

    /// Register a handler for content converged from the join or from peers.
    pub fn on_remote_content_applied<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AppliedContent) + Send + Sync + 'static,
    {
        let id = self.shared.next_handler.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.content_handlers).push((id, Arc::new(handler)));

        let weak = Arc::downgrade(&self.shared);
        Subscription::new(move || {
            if let Some(shared) = weak.upgrade() {
                lock(&shared.content_handlers).retain(|(hid, _)| *hid != id);
            }
        })
    }

    pub fn presence_snapshot(&self) -> HashMap<PeerId, PresenceRecord> {
        lock(&self.shared.presence).clone()
    }

    /// Last applied state, `None` before initialization and after teardown.
    pub fn document_state(&self) -> Option<DocumentState> {
        lock(&self.shared.state).clone()
    }

    pub fn phase(&self) -> Phase {
        *lock(&self.shared.phase)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        *lock(&self.shared.status)
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Tear the session down and wait for it. Idempotent.
    pub async fn dispose(&self) {
        self.shared.live.store(false, Ordering::Release);
        let (done_tx, done_rx) = oneshot::channel();
        if self.inbox.send(Command::Dispose(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        if !self.shared.is_live() {
            return Err(SyncError::SessionClosed);
        }
        self.inbox.send(command).map_err(|_| SyncError::SessionClosed)
    }
}

impl Drop for CollabSession {
    fn drop(&mut self) {
        if self.shared.live.swap(false, Ordering::AcqRel) {
            let (done_tx, _) = oneshot::channel();
            let _ = self.inbox.send(Command::Dispose(done_tx));
        }
    }
}

/// Channel handlers parse and forward into the inbox; nothing else.
fn register_handlers(
    channel: &dyn Channel,
    live: &Arc<AtomicBool>,
    inbox: &mpsc::UnboundedSender<Command>,
    bag: &mut DisposeBag,
) {
    for kind in EventKind::ALL {
        let event = kind.name();
        let live = live.clone();
        let inbox = inbox.clone();
        bag.push(channel.on(
            event,
            Arc::new(move |payload: &Value| {
                if !live.load(Ordering::Acquire) {
                    return;
                }
                match CollabMessage::parse(event, payload) {
                    Ok(message) => {
                        let _ = inbox.send(Command::Message(message));
                    }
                    Err(e) => log::warn!("Discarding malformed broadcast: {e}"),
                }
            }),
        ));
    }

    for kind in [PresenceKind::Sync, PresenceKind::Join, PresenceKind::Leave] {
        let live = live.clone();
        let inbox = inbox.clone();
        bag.push(channel.on_presence(
            kind,
            Arc::new(move |event: &PresenceEvent| {
                if live.load(Ordering::Acquire) {
                    let _ = inbox.send(Command::Presence(event.clone()));
                }
            }),
        ));
    }
}

// ───────────────────────────────────────────────────────────────────
// Actor
// ───────────────────────────────────────────────────────────────────

struct SessionActor {
    shared: Arc<Shared>,
    config: SessionConfig,
    channel: Arc<dyn Channel>,
    /// Present when `autosave` is on.
    autosave: Option<Autosaver>,
    inbox: mpsc::UnboundedReceiver<Command>,
    statuses: Option<StatusStream>,
    bag: DisposeBag,
    /// Latest presence registration; re-tracking reuses the same key.
    tracked: Option<Subscription>,
    reconciler: Reconciler,
    presence: PresenceTracker,
    pipeline: LocalEditPipeline,
    cursor: CursorBroadcaster,
    heartbeat: Interval,
    fallback_content: Option<Value>,
    status: ConnectionStatus,
    selection: Option<Selection>,
    /// Timestamp of our last successful `user:join`, to spot its echo.
    join_stamp: Option<u64>,
    window: Option<Instant>,
    retry_at: Option<Instant>,
    attempts: u32,
    closed: bool,
}

impl SessionActor {
    async fn run(mut self) {
        while !self.closed {
            let window = self.window;
            let retry_at = self.retry_at;
            let edits_due = self.pipeline.deadline();
            let cursor_due = self.cursor.deadline();
            let connected = self.status.is_connected();

            tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.teardown(),
                },
                status = next_status(&mut self.statuses) => self.on_status(status),
                _ = self.heartbeat.tick(), if connected => self.send_heartbeat(),
                _ = sleep_until(window) => self.close_window(),
                _ = sleep_until(retry_at) => self.retry_join(),
                _ = sleep_until(edits_due) => self.flush_edits(),
                _ = sleep_until(cursor_due) => self.flush_cursor(),
            }
        }
        if let Some(autosave) = self.autosave.take() {
            autosave.finish().await;
        }
    }

    fn document_id(&self) -> DocumentId {
        self.shared.document_id
    }

    fn peer_id(&self) -> PeerId {
        self.shared.peer_id
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ContentChanged(content) => self.pipeline.on_change(content, Instant::now()),
            Command::SelectionChanged(selection) => self.selection = selection,
            Command::CursorMoved(cursor) => self.move_cursor(cursor),
            Command::Message(message) => self.handle_message(message),
            Command::Presence(event) => self.handle_presence(event),
            Command::Dispose(done) => {
                self.teardown();
                let _ = done.send(());
            }
        }
    }

    // ── Connection ───────────────────────────────────────────────

    fn on_status(&mut self, status: Option<ConnectionStatus>) {
        let status = match status {
            Some(status) => status,
            None => {
                self.statuses = None;
                ConnectionStatus::Unsubscribed
            }
        };
        let previous = self.status;
        if status == previous {
            return;
        }
        self.status = status;
        *lock(&self.shared.status) = status;

        match status {
            ConnectionStatus::Subscribed => {
                if previous == ConnectionStatus::Disconnected {
                    log::info!("Reconnected to document {}, rejoining", self.document_id());
                } else {
                    log::info!("Subscribed to document {}", self.document_id());
                }
                self.shared.emit(SessionEvent::Connected);
                self.heartbeat.reset();
                self.track_local();
                self.start_join();
            }
            ConnectionStatus::Disconnected | ConnectionStatus::Unsubscribed => {
                log::warn!("Channel for document {} is {status:?}", self.document_id());
                self.shared.emit(SessionEvent::Reconnecting);
                self.cursor.clear();
                let closed = status == ConnectionStatus::Unsubscribed;
                if closed || self.reconciler.phase() == Phase::AwaitingPeerState {
                    let err = if closed { ChannelError::Closed } else { ChannelError::Disconnected };
                    self.join_failed(err.into());
                }
            }
            ConnectionStatus::Connecting => {}
        }
    }

    fn track_local(&mut self) {
        let record = self.presence.touch(now_millis()).clone();
        match self.channel.track(record) {
            Ok(subscription) => self.tracked = Some(subscription),
            Err(e) => log::warn!("Failed to track presence on document {}: {e}", self.document_id()),
        }
    }

    /// Renew our entry in the channel's presence table, then ping peers.
    fn send_heartbeat(&mut self) {
        let ping = self.presence.heartbeat(now_millis());
        self.track_local();
        if let Err(e) = self.broadcast(&ping) {
            log::debug!("Heartbeat not sent: {e}");
        }
    }

    fn broadcast(&self, message: &CollabMessage) -> Result<(), SyncError> {
        let envelope = message.to_envelope()?;
        self.channel.broadcast(&envelope.event, envelope.payload)?;
        Ok(())
    }

    // ── Join protocol ────────────────────────────────────────────

    /// Announce ourselves and open the collection window. A successful
    /// `user:join` broadcast is our self-join notification.
    fn start_join(&mut self) {
        self.retry_at = None;
        self.window = None;

        let now = now_millis();
        if let Err(e) = self.broadcast(&CollabMessage::user_join(self.peer_id(), now)) {
            self.join_failed(e);
            return;
        }
        self.join_stamp = Some(now);

        let request = self.reconciler.begin_join(now);
        self.publish_state();
        if let Err(e) = self.broadcast(&request) {
            self.join_failed(e);
            return;
        }
        log::debug!("Requested peer state for document {}", self.document_id());
        self.window = Some(Instant::now() + self.config.collection_window());
    }

    fn join_failed(&mut self, err: SyncError) {
        self.window = None;
        self.attempts += 1;
        if self.attempts > self.config.max_join_retries {
            log::error!(
                "Failed to join document {} after {} attempts: {err}",
                self.document_id(),
                self.attempts
            );
            self.shared.emit(SessionEvent::JoinFailed { attempts: self.attempts });
            self.teardown();
            return;
        }
        let delay = self.config.join_backoff(self.attempts);
        log::warn!(
            "Join attempt {} for document {} failed: {err}; retrying in {delay:?}",
            self.attempts,
            self.document_id()
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    fn retry_join(&mut self) {
        self.retry_at = None;
        if self.status.is_connected() {
            self.start_join();
        } else {
            self.join_failed(ChannelError::Disconnected.into());
        }
    }

    fn close_window(&mut self) {
        self.window = None;
        let resolution = self
            .reconciler
            .finish_join(self.fallback_content.clone(), now_millis());
        self.attempts = 0;
        self.publish_state();

        if resolution.bootstrapped {
            log::info!("No peers answered; document {} starts at version 0", self.document_id());
        } else {
            log::info!(
                "Initialized document {} at version {} ({} responses)",
                self.document_id(),
                resolution.resolved.version,
                resolution.responses
            );
        }
        for state in resolution.applied {
            self.apply_remote(state, false);
        }
        self.shared.emit(SessionEvent::Initialized {
            version: resolution.resolved.version,
            responses: resolution.responses,
            bootstrapped: resolution.bootstrapped,
        });

        self.resend_unsent();
        if let Some(content) = self.pipeline.flush() {
            self.emit_local(content);
        }
    }

    // ── Incoming ─────────────────────────────────────────────────

    fn handle_message(&mut self, message: CollabMessage) {
        match message {
            CollabMessage::UserJoin(stamp) => self.on_user_join(stamp),
            CollabMessage::StateRequest(stamp) => self.respond_to(&stamp),
            CollabMessage::StateResponse(state) => {
                let outcome = self.reconciler.handle_response(state);
                self.on_outcome(outcome, false);
            }
            CollabMessage::StateUpdate(state) => {
                let redundant = self.pipeline.is_redundant(&state.content, Instant::now());
                let outcome = self.reconciler.handle_update(state);
                self.on_outcome(outcome, redundant);
            }
            CollabMessage::Heartbeat(stamp) => {
                if stamp.peer_id != self.peer_id() && self.presence.record_heartbeat(&stamp) {
                    *lock(&self.shared.presence) = self.presence.snapshot();
                }
            }
        }
    }

    fn on_user_join(&mut self, stamp: PeerStamp) {
        if stamp.peer_id == self.peer_id() {
            if self.join_stamp != Some(stamp.timestamp) {
                log::debug!("Ignoring join from another session using peer id {}", stamp.peer_id);
            }
            return;
        }
        log::info!("Peer {} joined document {}", stamp.peer_id, self.document_id());
        self.respond_to(&stamp);
    }

    fn respond_to(&mut self, stamp: &PeerStamp) {
        let Some(snapshot) = self.reconciler.handle_request(stamp) else {
            return;
        };
        let version = snapshot.version;
        match self.broadcast(&CollabMessage::StateResponse(snapshot)) {
            Ok(()) => log::debug!("Sent version {version} to {}", stamp.peer_id),
            Err(e) => log::debug!("State response to {} not sent: {e}", stamp.peer_id),
        }
    }

    fn on_outcome(&mut self, outcome: UpdateOutcome, redundant: bool) {
        match outcome {
            UpdateOutcome::Applied(state) => self.apply_remote(state, redundant),
            UpdateOutcome::Queued => log::debug!(
                "Queued update until initialized ({} pending)",
                self.reconciler.pending_len()
            ),
            UpdateOutcome::Collected => log::debug!(
                "Collected state response ({} so far)",
                self.reconciler.collected_len()
            ),
            UpdateOutcome::Stale => log::debug!("Discarded stale update"),
            UpdateOutcome::Echo => log::debug!("Skipped echo of own update"),
        }
    }

    /// Install an applied state and hand it to the edit surface. A redundant
    /// echo of just-emitted content is adopted without notifying anyone.
    fn apply_remote(&mut self, state: DocumentState, silent: bool) {
        self.publish_state();
        if silent {
            log::debug!("Adopted version {} without reapplying identical content", state.version);
            return;
        }
        if !self.shared.is_live() {
            return;
        }

        let selection = restore_selection(self.selection, &state.content);
        self.selection = Some(selection);
        let applied = AppliedContent {
            state: state.clone(),
            selection,
        };
        let handlers: Vec<ContentHandler> = lock(&self.shared.content_handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(&applied);
        }
        self.shared.emit(SessionEvent::RemoteApplied(state));
    }

    fn handle_presence(&mut self, event: PresenceEvent) {
        if self.presence.handle(&event) {
            let snapshot = self.presence.snapshot();
            let peers = snapshot.len();
            *lock(&self.shared.presence) = snapshot;
            self.shared.emit(SessionEvent::PresenceChanged { peers });
        }
    }

    // ── Outgoing ─────────────────────────────────────────────────

    fn flush_edits(&mut self) {
        let Some(content) = self.pipeline.poll_due(Instant::now()) else {
            return;
        };
        if !self.reconciler.is_initialized() || !self.status.is_connected() {
            log::debug!("Holding local edit until joined");
            self.pipeline.hold(content);
            return;
        }
        self.emit_local(content);
    }

    fn emit_local(&mut self, content: Value) {
        if !self.shared.can_edit {
            log::warn!("Dropping local edit on read-only document {}", self.document_id());
            return;
        }
        let state = match self.reconciler.local_update(content, self.selection, now_millis()) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Local edit not applied: {e}");
                return;
            }
        };
        self.publish_state();

        match self.broadcast(&CollabMessage::StateUpdate(state.clone())) {
            Ok(()) => {
                self.pipeline.mark_emitted(&state, Instant::now());
                self.track_local();
                log::debug!("Emitted version {} of document {}", state.version, self.document_id());
            }
            Err(e) => {
                log::warn!("Version {} not sent ({e}); resending after rejoin", state.version);
                self.pipeline.mark_unsent(state.clone());
            }
        }

        if let Some(autosave) = &self.autosave {
            autosave.save(state.content.clone());
        }
    }

    fn resend_unsent(&mut self) {
        let Some(state) = self.pipeline.take_unsent() else {
            return;
        };
        if self.reconciler.current() != Some(&state) {
            log::debug!("Unsent version {} was superseded", state.version);
            return;
        }
        match self.broadcast(&CollabMessage::StateUpdate(state.clone())) {
            Ok(()) => self.pipeline.mark_emitted(&state, Instant::now()),
            Err(e) => {
                log::warn!("Resend of version {} failed: {e}", state.version);
                self.pipeline.mark_unsent(state);
            }
        }
    }

    fn move_cursor(&mut self, cursor: CursorPosition) {
        if !self.status.is_connected() {
            log::trace!("Dropping cursor update while disconnected");
            return;
        }
        if let Some(cursor) = self.cursor.update(cursor, Instant::now()) {
            self.publish_cursor(cursor);
        }
    }

    fn flush_cursor(&mut self) {
        if let Some(cursor) = self.cursor.poll_due(Instant::now()) {
            if self.status.is_connected() {
                self.publish_cursor(cursor);
            }
        }
    }

    fn publish_cursor(&mut self, cursor: CursorPosition) {
        let record = self.presence.set_cursor(cursor, now_millis()).clone();
        match self.channel.track(record) {
            Ok(subscription) => {
                self.tracked = Some(subscription);
                log::trace!("Published cursor ({}, {})", cursor.x, cursor.y);
            }
            Err(e) => log::trace!("Cursor not published: {e}"),
        }
    }

    // ── Shared view ──────────────────────────────────────────────

    fn publish_state(&self) {
        *lock(&self.shared.state) = self.reconciler.current().cloned();
        *lock(&self.shared.phase) = self.reconciler.phase();
    }

    fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shared.live.store(false, Ordering::Release);

        self.window = None;
        self.retry_at = None;
        self.pipeline.clear();
        self.cursor.clear();
        if let Some(tracked) = self.tracked.take() {
            tracked.dispose();
        }
        self.bag.dispose_all();
        self.channel.unsubscribe();
        self.statuses = None;

        self.reconciler.reset();
        self.presence.clear();
        self.publish_state();
        lock(&self.shared.presence).clear();
        lock(&self.shared.content_handlers).clear();
        *lock(&self.shared.status) = ConnectionStatus::Unsubscribed;

        log::info!("Closed session for document {}", self.document_id());
        self.shared.emit(SessionEvent::Closed);
    }
}

async fn next_status(statuses: &mut Option<StatusStream>) -> Option<ConnectionStatus> {
    match statuses {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
