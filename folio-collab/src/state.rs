//! Versioned document snapshots and their last-writer-wins ordering.
//!
//! A [`DocumentState`] is the unit every peer exchanges: the whole content
//! tree plus the metadata needed to pick a winner between candidates.
//!
//! Ordering is total:
//! ```text
//! version  ──►  last_modified  ──►  author_id
//! (primary)     (tie-break)         (final tie-break)
//! ```
//! Every peer evaluates the same comparison, so every peer picks the same
//! winner regardless of arrival order.
//!
//! Known limitation: concurrent edits at the same version are not merged.
//! The winning tree replaces the other one wholesale.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Identity of one connected editing session.
pub type PeerId = Uuid;

/// Node types that occupy a single position and never carry children.
const LEAF_NODES: &[&str] = &["hardBreak", "horizontalRule", "image"];

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A `{from, to}` range into the content's linear addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub from: usize,
    pub to: usize,
}

impl Selection {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    /// Collapsed selection (a caret) at `pos`.
    pub fn caret(pos: usize) -> Self {
        Self { from: pos, to: pos }
    }

    /// Whether this range is addressable in content of `size` positions.
    pub fn fits(&self, size: usize) -> bool {
        self.from <= self.to && self.to <= size
    }
}

/// Versioned, timestamped snapshot of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentState {
    /// Primary ordering key. Never decreases for an applied state.
    pub version: u64,
    /// Opaque content tree, replaced as a unit.
    pub content: Value,
    /// Milliseconds since epoch; breaks version ties.
    pub last_modified: u64,
    /// Peer that produced this state; breaks residual ties.
    pub author_id: PeerId,
    /// Author's selection when the state was produced. Not used for ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
}

impl DocumentState {
    /// The version-0 state a solo peer bootstraps into.
    pub fn initial(author_id: PeerId, content: Option<Value>, now_ms: u64) -> Self {
        Self {
            version: 0,
            content: content.unwrap_or_else(empty_content),
            last_modified: now_ms,
            author_id,
            selection: None,
        }
    }

    /// Total last-writer-wins order over `(version, last_modified, author_id)`.
    pub fn precedence(&self, other: &Self) -> Ordering {
        self.version
            .cmp(&other.version)
            .then(self.last_modified.cmp(&other.last_modified))
            .then(self.author_id.cmp(&other.author_id))
    }

    /// Whether this state strictly wins over `other`.
    pub fn supersedes(&self, other: &Self) -> bool {
        self.precedence(other) == Ordering::Greater
    }

    /// Number of addressable positions in this state's content.
    pub fn content_size(&self) -> usize {
        content_size(&self.content)
    }
}

/// The empty document tree.
pub fn empty_content() -> Value {
    json!({ "type": "doc", "content": [] })
}

/// Pick the winning candidate: highest version, then latest `last_modified`,
/// then highest `author_id`. Returns `None` for an empty set.
pub fn resolve_conflicts<I>(candidates: I) -> Option<DocumentState>
where
    I: IntoIterator<Item = DocumentState>,
{
    candidates.into_iter().max_by(|a, b| a.precedence(b))
}

/// Linear size of a content tree.
///
/// Text contributes one position per character, leaf nodes one position,
/// other nodes two (open + close) plus their children. The root only
/// contributes its children.
pub fn content_size(content: &Value) -> usize {
    match content {
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                return text.chars().count();
            }
            match map.get("content") {
                Some(Value::Array(children)) => children.iter().map(node_size).sum(),
                _ => 0,
            }
        }
        Value::String(text) => text.chars().count(),
        _ => 0,
    }
}

fn node_size(node: &Value) -> usize {
    let Value::Object(map) = node else {
        return 0;
    };
    if let Some(Value::String(text)) = map.get("text") {
        return text.chars().count();
    }
    let is_leaf = map
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|ty| LEAF_NODES.contains(&ty));
    if is_leaf {
        return 1;
    }
    let children = match map.get("content") {
        Some(Value::Array(children)) => children.iter().map(node_size).sum(),
        _ => 0,
    };
    2 + children
}

/// Keep `previous` if it still addresses `content`, otherwise place a caret
/// at end-of-content.
pub fn restore_selection(previous: Option<Selection>, content: &Value) -> Selection {
    let size = content_size(content);
    match previous {
        Some(sel) if sel.fits(size) => sel,
        _ => Selection::caret(size),
    }
}
