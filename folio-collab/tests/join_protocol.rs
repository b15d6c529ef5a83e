//! Integration tests for the join protocol.
//!
//! Every test runs on paused tokio time, so collection windows, debounce
//! and retry backoff elapse deterministically.

use std::sync::{Arc, Mutex};

use folio_collab::channel::{Channel, MemoryChannel, MemoryHub};
use folio_collab::presence::PeerIdentity;
use folio_collab::reconciler::Phase;
use folio_collab::session::{AppliedContent, CollabSession, SessionConfig, SessionEvent};
use folio_collab::store::MemoryStore;
use folio_collab::ConnectionStatus;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep, timeout, Duration, Instant};
use uuid::Uuid;

fn config() -> SessionConfig {
    SessionConfig {
        collection_window_ms: 500,
        ..SessionConfig::default()
    }
}

async fn open_peer(
    hub: &MemoryHub,
    doc: Uuid,
    name: &str,
    store: Arc<MemoryStore>,
) -> (CollabSession, broadcast::Receiver<SessionEvent>) {
    let identity = PeerIdentity::new(Uuid::new_v4(), name);
    let session = CollabSession::initialize(doc, identity, store, hub, config())
        .await
        .unwrap();
    let events = session.events();
    (session, events)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

/// Like [`open_peer`], but keeps the endpoint so the test can cut it.
async fn open_on_channel(
    hub: &MemoryHub,
    doc: Uuid,
    name: &str,
    store: Arc<MemoryStore>,
) -> (CollabSession, broadcast::Receiver<SessionEvent>, Arc<MemoryChannel>) {
    let channel = hub.open(doc);
    let identity = PeerIdentity::new(Uuid::new_v4(), name);
    let session = CollabSession::initialize_with_channel(doc, identity, store, channel.clone(), config())
        .await
        .unwrap();
    let events = session.events();
    (session, events, channel)
}

async fn initialized(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    wait_for(events, |e| matches!(e, SessionEvent::Initialized { .. })).await
}

/// Let debounce and delivery run to completion.
async fn settle() {
    sleep(Duration::from_secs(3)).await;
}

fn record_applied(session: &CollabSession) -> Arc<Mutex<Vec<AppliedContent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    // Lives as long as the session; never disposed in these tests.
    let _sub = session.on_remote_content_applied(move |applied| {
        sink.lock().unwrap().push(applied.clone());
    });
    seen
}

#[tokio::test(start_paused = true)]
async fn test_solo_peer_bootstraps_after_window() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let started = Instant::now();
    let (session, mut events) = open_peer(&hub, doc, "Alice", Arc::new(MemoryStore::new())).await;
    let applied = record_applied(&session);

    let event = initialized(&mut events).await;
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(
        event,
        SessionEvent::Initialized { version: 0, responses: 0, bootstrapped: true }
    );

    let state = session.document_state().unwrap();
    assert_eq!(state.version, 0);
    assert_eq!(state.content, json!({ "type": "doc", "content": [] }));
    assert_eq!(state.author_id, session.peer_id());
    assert_eq!(session.phase(), Phase::Initialized);
    assert_eq!(applied.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_not_initialized_before_window_closes() {
    let hub = MemoryHub::with_defaults();
    let (session, _events) =
        open_peer(&hub, Uuid::new_v4(), "Alice", Arc::new(MemoryStore::new())).await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(session.phase(), Phase::AwaitingPeerState);
    assert!(session.document_state().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_solo_bootstrap_uses_stored_content() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::with_document(doc, json!({ "text": "saved" })));
    let (session, mut events) = open_peer(&hub, doc, "Alice", store).await;

    initialized(&mut events).await;
    let state = session.document_state().unwrap();
    assert_eq!(state.version, 0);
    assert_eq!(state.content, json!({ "text": "saved" }));
}

#[tokio::test(start_paused = true)]
async fn test_hello_world_scenario() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());

    let (a, mut a_events) = open_peer(&hub, doc, "A", store.clone()).await;
    initialized(&mut a_events).await;
    a.on_content_change(json!({ "text": "hello" })).unwrap();
    settle().await;
    assert_eq!(a.document_state().unwrap().version, 1);

    let (b, mut b_events) = open_peer(&hub, doc, "B", store.clone()).await;
    let b_applied = record_applied(&b);
    let event = initialized(&mut b_events).await;
    assert!(matches!(
        event,
        SessionEvent::Initialized { version: 1, bootstrapped: false, .. }
    ));
    let b_state = b.document_state().unwrap();
    assert_eq!(b_state.version, 1);
    assert_eq!(b_state.content, json!({ "text": "hello" }));
    // The empty fallback never reached B's editor.
    assert!(b_applied.lock().unwrap().iter().all(|a| a.state.version >= 1));

    b.on_content_change(json!({ "text": "hello world" })).unwrap();
    settle().await;

    let a_state = a.document_state().unwrap();
    let b_state = b.document_state().unwrap();
    assert_eq!(a_state.version, 2);
    assert_eq!(a_state.content, json!({ "text": "hello world" }));
    assert_eq!(a_state, b_state);
    assert_eq!(store.get(doc), Some(json!({ "text": "hello world" })));
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_catches_up_to_latest_version() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());

    let (a, mut a_events) = open_peer(&hub, doc, "A", store.clone()).await;
    initialized(&mut a_events).await;
    let (b, mut b_events) = open_peer(&hub, doc, "B", store.clone()).await;
    initialized(&mut b_events).await;

    for text in ["one", "two", "three"] {
        a.on_content_change(json!({ "text": text })).unwrap();
        settle().await;
    }
    assert_eq!(b.document_state().unwrap().version, 3);

    let (c, mut c_events) = open_peer(&hub, doc, "C", store).await;
    let event = initialized(&mut c_events).await;
    assert!(matches!(
        event,
        SessionEvent::Initialized { version: 3, bootstrapped: false, .. }
    ));
    assert_eq!(c.document_state(), a.document_state());
}

#[tokio::test(start_paused = true)]
async fn test_edits_before_initialization_are_held() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());

    let (a, mut a_events) = open_peer(&hub, doc, "A", store.clone()).await;
    initialized(&mut a_events).await;

    let (b, mut b_events) = open_peer(&hub, doc, "B", store).await;
    b.on_content_change(json!({ "text": "early" })).unwrap();
    initialized(&mut b_events).await;
    settle().await;

    // Emitted on top of the joined state, not instead of it.
    let expected = json!({ "text": "early" });
    assert_eq!(b.document_state().unwrap().version, 1);
    assert_eq!(a.document_state().unwrap().content, expected);
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_after_reconnect_catches_up() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());

    let (a, mut a_events) = open_peer(&hub, doc, "A", store.clone()).await;
    initialized(&mut a_events).await;

    let b_channel = hub.open(doc);
    let b = CollabSession::initialize_with_channel(
        doc,
        PeerIdentity::new(Uuid::new_v4(), "B"),
        store,
        b_channel.clone(),
        config(),
    )
    .await
    .unwrap();
    let mut b_events = b.events();
    initialized(&mut b_events).await;

    b_channel.disconnect();
    wait_for(&mut b_events, |e| *e == SessionEvent::Reconnecting).await;
    assert_eq!(b.connection_status(), ConnectionStatus::Disconnected);

    // Missed by B while the transport is down.
    a.on_content_change(json!({ "text": "while you were away" })).unwrap();
    settle().await;
    assert_eq!(b.document_state().unwrap().version, 0);

    b_channel.reconnect();
    wait_for(&mut b_events, |e| *e == SessionEvent::Connected).await;
    let event = initialized(&mut b_events).await;
    assert!(matches!(event, SessionEvent::Initialized { version: 1, .. }));
    assert_eq!(b.document_state(), a.document_state());
}

#[tokio::test(start_paused = true)]
async fn test_edits_while_disconnected_sent_after_rejoin() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());

    let (a, mut a_events) = open_peer(&hub, doc, "A", store.clone()).await;
    initialized(&mut a_events).await;

    let b_channel = hub.open(doc);
    let b = CollabSession::initialize_with_channel(
        doc,
        PeerIdentity::new(Uuid::new_v4(), "B"),
        store,
        b_channel.clone(),
        config(),
    )
    .await
    .unwrap();
    let mut b_events = b.events();
    initialized(&mut b_events).await;

    b_channel.disconnect();
    wait_for(&mut b_events, |e| *e == SessionEvent::Reconnecting).await;
    b.on_content_change(json!({ "text": "offline edit" })).unwrap();
    settle().await;
    assert_eq!(a.document_state().unwrap().version, 0);

    b_channel.reconnect();
    initialized(&mut b_events).await;
    settle().await;

    let a_state = a.document_state().unwrap();
    assert_eq!(a_state.content, json!({ "text": "offline edit" }));
    assert_eq!(a_state.version, 1);
    assert_eq!(b.document_state(), Some(a_state));
}

#[tokio::test(start_paused = true)]
async fn test_join_fails_after_retries() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let channel = hub.open(doc);
    let session = CollabSession::initialize_with_channel(
        doc,
        PeerIdentity::new(Uuid::new_v4(), "A"),
        Arc::new(MemoryStore::new()),
        channel.clone(),
        config(),
    )
    .await
    .unwrap();
    let mut events = session.events();
    wait_for(&mut events, |e| *e == SessionEvent::Connected).await;

    // Transport dies mid-collection and never comes back.
    channel.disconnect();
    let event = wait_for(&mut events, |e| matches!(e, SessionEvent::JoinFailed { .. })).await;
    assert_eq!(event, SessionEvent::JoinFailed { attempts: 4 });

    wait_for(&mut events, |e| *e == SessionEvent::Closed).await;
    assert!(!session.is_live());
    assert_eq!(session.connection_status(), ConnectionStatus::Unsubscribed);
    assert_eq!(channel.status(), ConnectionStatus::Unsubscribed);
    assert!(session.on_content_change(json!({})).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_responder_answers_join_without_request() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());

    let (a, mut a_events) = open_peer(&hub, doc, "A", store).await;
    initialized(&mut a_events).await;
    a.on_content_change(json!({ "text": "v1" })).unwrap();
    settle().await;

    // A raw endpoint announces a join but never sends state:request.
    let raw = hub.open(doc);
    let (tx, mut responses) = tokio::sync::mpsc::unbounded_channel();
    let _sub = raw.on(
        "state:response",
        Arc::new(move |payload: &serde_json::Value| {
            let _ = tx.send(payload.clone());
        }),
    );
    let mut statuses = raw.subscribe();
    while let Some(status) = futures_util::StreamExt::next(&mut statuses).await {
        if status == ConnectionStatus::Subscribed {
            break;
        }
    }
    raw.broadcast("user:join", json!({ "peerId": Uuid::new_v4(), "timestamp": 1 }))
        .unwrap();

    let payload = timeout(Duration::from_secs(5), responses.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payload["version"], json!(1));
    assert_eq!(payload["content"], json!({ "text": "v1" }));
}

#[tokio::test(start_paused = true)]
async fn test_peers_rejoining_together_converge() {
    let hub = MemoryHub::with_defaults();
    let doc = Uuid::new_v4();
    let store = Arc::new(MemoryStore::new());

    let (a, mut a_events, a_channel) = open_on_channel(&hub, doc, "A", store.clone()).await;
    initialized(&mut a_events).await;
    let (b, mut b_events, b_channel) = open_on_channel(&hub, doc, "B", store).await;
    initialized(&mut b_events).await;

    a_channel.disconnect();
    wait_for(&mut a_events, |e| *e == SessionEvent::Reconnecting).await;

    // A misses this one.
    b.on_content_change(json!({ "text": "B while A away" })).unwrap();
    settle().await;
    assert_eq!(b.document_state().unwrap().version, 1);
    assert_eq!(a.document_state().unwrap().version, 0);

    b_channel.disconnect();
    wait_for(&mut b_events, |e| *e == SessionEvent::Reconnecting).await;

    // Both come back at the same instant and rejoin against each other.
    a_channel.reconnect();
    b_channel.reconnect();
    initialized(&mut a_events).await;
    initialized(&mut b_events).await;
    settle().await;

    let a_state = a.document_state().unwrap();
    assert_eq!(a_state.version, 1);
    assert_eq!(a_state.content, json!({ "text": "B while A away" }));
    assert_eq!(Some(a_state), b.document_state());
}
