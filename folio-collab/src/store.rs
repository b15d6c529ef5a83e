//! Document persistence collaborator.
//!
//! The sync core only needs three things from storage: the content to
//! bootstrap from when nobody else is online, a place to save content after
//! local edits, and a permission check. [`MemoryStore`] backs tests and the
//! simulator; [`FileStore`] keeps one JSON file per document.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

use crate::channel::DocumentId;
use crate::lock;
use crate::state::PeerId;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("permission denied for document {0}")]
    PermissionDenied(DocumentId),
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Persistence and permission collaborator.
///
/// Calls may block. Sessions never call `save` on their own task; they go
/// through an [`Autosaver`].
pub trait DocumentStore: Send + Sync {
    /// Stored content, or `None` for a document that has never been saved.
    fn load(&self, document_id: DocumentId) -> Result<Option<Value>, StoreError>;

    fn save(&self, document_id: DocumentId, content: &Value) -> Result<(), StoreError>;

    fn can_edit(&self, peer_id: PeerId, document_id: DocumentId) -> bool;
}

// ───────────────────────────────────────────────────────────────────
// In-memory store
// ───────────────────────────────────────────────────────────────────

/// Process-local store. Every peer may edit unless explicitly denied.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, Value>>,
    read_only: Mutex<HashSet<(PeerId, DocumentId)>>,
    saves: Mutex<u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document_id: DocumentId, content: Value) -> Self {
        let store = Self::new();
        lock(&store.documents).insert(document_id, content);
        store
    }

    /// Revoke edit permission for one peer on one document.
    pub fn deny_edit(&self, peer_id: PeerId, document_id: DocumentId) {
        lock(&self.read_only).insert((peer_id, document_id));
    }

    pub fn get(&self, document_id: DocumentId) -> Option<Value> {
        lock(&self.documents).get(&document_id).cloned()
    }

    pub fn save_count(&self) -> u64 {
        *lock(&self.saves)
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, document_id: DocumentId) -> Result<Option<Value>, StoreError> {
        Ok(self.get(document_id))
    }

    fn save(&self, document_id: DocumentId, content: &Value) -> Result<(), StoreError> {
        lock(&self.documents).insert(document_id, content.clone());
        *lock(&self.saves) += 1;
        Ok(())
    }

    fn can_edit(&self, peer_id: PeerId, document_id: DocumentId) -> bool {
        !lock(&self.read_only).contains(&(peer_id, document_id))
    }
}

// ───────────────────────────────────────────────────────────────────
// File store
// ───────────────────────────────────────────────────────────────────

/// One `<document-id>.json` file per document under a root directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    writable: bool,
}

impl FileStore {
    /// Open (and create if missing) a writable store.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, writable: true })
    }

    /// Open a store whose documents nobody may edit.
    pub fn open_read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writable: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, document_id: DocumentId) -> PathBuf {
        self.root.join(format!("{document_id}.json"))
    }
}

impl DocumentStore for FileStore {
    fn load(&self, document_id: DocumentId) -> Result<Option<Value>, StoreError> {
        let bytes = match fs::read(self.path_for(document_id)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn save(&self, document_id: DocumentId, content: &Value) -> Result<(), StoreError> {
        if !self.writable {
            return Err(StoreError::PermissionDenied(document_id));
        }
        let bytes =
            serde_json::to_vec(content).map_err(|e| StoreError::Serialization(e.to_string()))?;
        // Write then rename so readers never see a torn file.
        let path = self.path_for(document_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        log::debug!("Saved document {document_id} to {}", path.display());
        Ok(())
    }

    fn can_edit(&self, _peer_id: PeerId, _document_id: DocumentId) -> bool {
        self.writable
    }
}

// ───────────────────────────────────────────────────────────────────
// Background saves
// ───────────────────────────────────────────────────────────────────

/// Saves one document's content off the caller's task.
///
/// Saves run one at a time on the blocking pool, in queue order. Content
/// queued while a save is in flight is coalesced so only the newest lands.
pub struct Autosaver {
    queue: mpsc::UnboundedSender<Value>,
    worker: JoinHandle<()>,
}

impl Autosaver {
    /// Start the worker. Must be called from within a tokio runtime.
    pub fn spawn(document_id: DocumentId, store: Arc<dyn DocumentStore>) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_autosave(document_id, store, rx));
        Self { queue, worker }
    }

    /// Queue content for saving. Never blocks.
    pub fn save(&self, content: Value) {
        if self.queue.send(content).is_err() {
            log::warn!("Autosave worker is gone; content not saved");
        }
    }

    /// Stop accepting content and wait for queued saves to land.
    pub async fn finish(self) {
        drop(self.queue);
        if let Err(e) = self.worker.await {
            log::error!("Autosave worker failed: {e}");
        }
    }
}

async fn run_autosave(
    document_id: DocumentId,
    store: Arc<dyn DocumentStore>,
    mut rx: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(mut content) = rx.recv().await {
        while let Ok(newer) = rx.try_recv() {
            content = newer;
        }
        let store = store.clone();
        match task::spawn_blocking(move || store.save(document_id, &content)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("Autosave of document {document_id} failed: {e}"),
            Err(e) => log::error!("Autosave of document {document_id} panicked: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        let doc = Uuid::new_v4();
        assert_eq!(store.load(doc).unwrap(), None);

        store.save(doc, &json!({ "text": "a" })).unwrap();
        assert_eq!(store.load(doc).unwrap(), Some(json!({ "text": "a" })));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_memory_store_permissions() {
        let doc = Uuid::new_v4();
        let store = MemoryStore::with_document(doc, json!({}));
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.deny_edit(bob, doc);

        assert!(store.can_edit(alice, doc));
        assert!(!store.can_edit(bob, doc));
        assert!(store.can_edit(bob, Uuid::new_v4()));
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        let content = json!({ "type": "doc", "content": [{ "type": "paragraph" }] });

        {
            let store = FileStore::open(dir.path()).unwrap();
            assert_eq!(store.load(doc).unwrap(), None);
            store.save(doc, &content).unwrap();
        }

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load(doc).unwrap(), Some(content));
        assert!(!dir.path().join(format!("{doc}.json.tmp")).exists());
    }

    #[test]
    fn test_file_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        fs::write(dir.path().join(format!("{doc}.json")), b"{not json").unwrap();

        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(store.load(doc), Err(StoreError::Serialization(_))));
    }

    #[test]
    fn test_file_store_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Uuid::new_v4();
        let store = FileStore::open_read_only(dir.path());
        assert!(!store.can_edit(Uuid::new_v4(), doc));
        assert_eq!(store.save(doc, &json!({})), Err(StoreError::PermissionDenied(doc)));
    }

    #[tokio::test]
    async fn test_autosaver_flushes_latest_on_finish() {
        let store = Arc::new(MemoryStore::new());
        let doc = Uuid::new_v4();
        let saver = Autosaver::spawn(doc, store.clone());
        for i in 0..3 {
            saver.save(json!({ "text": format!("draft {i}") }));
        }
        saver.finish().await;

        assert_eq!(store.get(doc), Some(json!({ "text": "draft 2" })));
        assert!((1..=3).contains(&store.save_count()));
    }

    /// Store whose saves take a while, as a slow disk would.
    struct SlowStore {
        inner: MemoryStore,
        delay: std::time::Duration,
    }

    impl DocumentStore for SlowStore {
        fn load(&self, document_id: DocumentId) -> Result<Option<Value>, StoreError> {
            self.inner.load(document_id)
        }

        fn save(&self, document_id: DocumentId, content: &Value) -> Result<(), StoreError> {
            std::thread::sleep(self.delay);
            self.inner.save(document_id, content)
        }

        fn can_edit(&self, peer_id: PeerId, document_id: DocumentId) -> bool {
            self.inner.can_edit(peer_id, document_id)
        }
    }

    #[tokio::test]
    async fn test_autosaver_does_not_block_caller() {
        let delay = std::time::Duration::from_millis(200);
        let store = Arc::new(SlowStore {
            inner: MemoryStore::new(),
            delay,
        });
        let doc = Uuid::new_v4();
        let saver = Autosaver::spawn(doc, store.clone());

        let started = std::time::Instant::now();
        saver.save(json!({ "text": "one" }));
        tokio::task::yield_now().await;
        saver.save(json!({ "text": "two" }));
        assert!(started.elapsed() < delay);

        saver.finish().await;
        assert_eq!(store.inner.get(doc), Some(json!({ "text": "two" })));
    }
}
