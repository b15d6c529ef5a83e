//! Folio Sim: runs several editing peers against one in-process hub.
//!
//! Usage: `folio-sim [session-config.json]`. Set `RUST_LOG=info` (or
//! `debug`) to watch the join protocol and the update flow.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use folio_collab::channel::MemoryHub;
use folio_collab::presence::{CursorPosition, PeerIdentity};
use folio_collab::session::{CollabSession, SessionConfig, SessionEvent};
use folio_collab::state::Selection;
use folio_collab::store::MemoryStore;
use log::{info, warn};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const PEERS: [&str; 3] = ["Ada", "Grace", "Linus"];
const ROUNDS: usize = 5;

fn load_config() -> Result<SessionConfig, Box<dyn Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            let config = serde_json::from_str(&raw)?;
            info!("Loaded session config from {path}");
            Ok(config)
        }
        None => Ok(SessionConfig::default()),
    }
}

async fn join(
    hub: &MemoryHub,
    store: Arc<MemoryStore>,
    document_id: Uuid,
    name: &str,
    config: &SessionConfig,
) -> Result<CollabSession, Box<dyn Error>> {
    let identity = PeerIdentity::new(Uuid::new_v4(), name);
    let session =
        CollabSession::initialize(document_id, identity, store, hub, config.clone()).await?;
    let mut events = session.events();
    let wait = config.collection_window() * 4 + Duration::from_secs(1);
    let initialized = timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Initialized { version, responses, bootstrapped }) => {
                    return Some((version, responses, bootstrapped))
                }
                Ok(SessionEvent::JoinFailed { .. }) | Err(RecvError::Closed) => return None,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    })
    .await;

    match initialized {
        Ok(Some((version, responses, bootstrapped))) => {
            info!("{name} initialized at v{version} ({responses} responses, bootstrapped: {bootstrapped})");
            Ok(session)
        }
        _ => Err(format!("{name} failed to join document {document_id}").into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = load_config()?;
    let hub = MemoryHub::with_defaults();
    let document_id = Uuid::new_v4();
    let store = Arc::new(MemoryStore::with_document(
        document_id,
        json!({ "type": "doc", "content": [{ "type": "paragraph", "content": [{ "type": "text", "text": "Draft" }] }] }),
    ));

    info!("Simulating {} peers on document {document_id}", PEERS.len());

    let mut sessions = Vec::new();
    for name in PEERS {
        sessions.push(join(&hub, store.clone(), document_id, name, &config).await?);
    }

    let edit_gap = config.debounce_wait() + Duration::from_millis(50);
    for round in 0..ROUNDS {
        for (i, session) in sessions.iter().enumerate() {
            if (round + i) % 2 != 0 {
                continue;
            }
            let text = format!("{} wrote round {round}", PEERS[i]);
            let caret = text.chars().count();
            session.set_selection(Some(Selection::caret(caret)))?;
            session.on_content_change(json!({ "type": "doc", "content": [{ "type": "paragraph", "content": [{ "type": "text", "text": text }] }] }))?;
            for step in 0..5 {
                session.move_cursor(CursorPosition::new(10.0 * step as f32, 20.0 * i as f32))?;
            }
        }
        sleep(edit_gap).await;
    }
    sleep(config.collection_window()).await;

    let states: Vec<_> = sessions.iter().map(|s| s.document_state()).collect();
    let converged = states.windows(2).all(|w| w[0] == w[1]);
    match states.first().and_then(|s| s.as_ref()) {
        Some(state) if converged => info!(
            "Converged at v{} by {} ({} positions)",
            state.version,
            state.author_id,
            state.content_size()
        ),
        _ => warn!("Peers diverged: {states:?}"),
    }

    for (name, session) in PEERS.iter().zip(&sessions) {
        info!("{name} sees {} peers present", session.presence_snapshot().len());
    }
    if let Some(stats) = hub.stats(document_id) {
        info!(
            "Hub: {} sent, {} dropped, {} endpoints, {} tracked",
            stats.messages_sent, stats.messages_dropped, stats.active_endpoints, stats.tracked_peers
        );
    }
    info!("Store saved {} times", store.save_count());

    for session in &sessions {
        session.dispose().await;
    }
    hub.remove_if_empty(document_id);

    if !converged {
        return Err("peers did not converge".into());
    }
    Ok(())
}
