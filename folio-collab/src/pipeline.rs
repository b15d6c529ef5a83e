//! Local edit pipeline: turns a stream of fine-grained editor mutations into
//! coarse `state:update` emissions.
//!
//! ```text
//! on_change ──► Debouncer ──(quiet for `wait`, or `max_wait` since first)──► emit
//!                   ▲                                                       │
//!                   └──── hold() while not initialized / disconnected ◄─────┘
//! ```
//!
//! After an emission the [`EchoGuard`] stays armed for a short grace period.
//! A remote update carrying exactly the content we just emitted is then
//! recognised as redundant and adopted without touching the editor.

use serde_json::Value;
use tokio::time::{Duration, Instant};

use crate::state::DocumentState;

// ───────────────────────────────────────────────────────────────────
// Debouncer
// ───────────────────────────────────────────────────────────────────

/// Single owned debounce timer with a latency bound.
#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    wait: Duration,
    max_wait: Duration,
    pending: Option<T>,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
}

impl<T> Debouncer<T> {
    pub fn new(wait: Duration, max_wait: Duration) -> Self {
        Self {
            wait,
            max_wait: max_wait.max(wait),
            pending: None,
            first_at: None,
            last_at: None,
        }
    }

    /// Replace the pending value and restart the quiet period. The max-wait
    /// bound keeps counting from the first change of the burst.
    pub fn schedule(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        self.last_at = Some(now);
        self.first_at.get_or_insert(now);
    }

    /// When the pending value is due. `None` when idle or held.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref()?;
        let last = self.last_at?;
        let first = self.first_at?;
        Some((last + self.wait).min(first + self.max_wait))
    }

    /// Take the pending value if its deadline has passed.
    pub fn poll_due(&mut self, now: Instant) -> Option<T> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Take the pending value immediately.
    pub fn flush(&mut self) -> Option<T> {
        self.first_at = None;
        self.last_at = None;
        self.pending.take()
    }

    /// Park a value with no deadline. The next `schedule` replaces it and
    /// restarts the timers; `flush` releases it.
    pub fn hold(&mut self, value: T) {
        self.pending = Some(value);
        self.first_at = None;
        self.last_at = None;
    }

    pub fn cancel(&mut self) {
        self.flush();
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

// ───────────────────────────────────────────────────────────────────
// Echo guard
// ───────────────────────────────────────────────────────────────────

/// Remembers the last emitted content for a short grace period.
#[derive(Debug, Clone)]
pub struct EchoGuard {
    grace: Duration,
    armed: Option<(Value, Instant)>,
}

impl EchoGuard {
    pub fn new(grace: Duration) -> Self {
        Self { grace, armed: None }
    }

    pub fn arm(&mut self, content: Value, now: Instant) {
        self.armed = Some((content, now));
    }

    /// Whether `content` repeats what was emitted within the grace period.
    pub fn is_redundant(&self, content: &Value, now: Instant) -> bool {
        match &self.armed {
            Some((emitted, at)) => now.duration_since(*at) <= self.grace && emitted == content,
            None => false,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }
}

// ───────────────────────────────────────────────────────────────────
// Pipeline
// ───────────────────────────────────────────────────────────────────

/// Debounced local edits, the echo guard and a slot for a state whose
/// broadcast failed.
#[derive(Debug, Clone)]
pub struct LocalEditPipeline {
    debouncer: Debouncer<Value>,
    echo: EchoGuard,
    unsent: Option<DocumentState>,
    emitted: u64,
}

impl LocalEditPipeline {
    pub fn new(wait: Duration, max_wait: Duration, echo_grace: Duration) -> Self {
        Self {
            debouncer: Debouncer::new(wait, max_wait),
            echo: EchoGuard::new(echo_grace),
            unsent: None,
            emitted: 0,
        }
    }

    /// Record a local mutation. Only the latest content of a burst survives.
    pub fn on_change(&mut self, content: Value, now: Instant) {
        self.debouncer.schedule(content, now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    pub fn poll_due(&mut self, now: Instant) -> Option<Value> {
        self.debouncer.poll_due(now)
    }

    /// Keep content that could not be emitted yet.
    pub fn hold(&mut self, content: Value) {
        self.debouncer.hold(content);
    }

    pub fn flush(&mut self) -> Option<Value> {
        self.debouncer.flush()
    }

    pub fn has_pending(&self) -> bool {
        self.debouncer.is_pending()
    }

    /// Note a successful local emission and arm the echo guard.
    pub fn mark_emitted(&mut self, state: &DocumentState, now: Instant) {
        self.emitted += 1;
        self.unsent = None;
        self.echo.arm(state.content.clone(), now);
    }

    /// Keep a state whose broadcast failed for re-broadcast after rejoin.
    pub fn mark_unsent(&mut self, state: DocumentState) {
        self.unsent = Some(state);
    }

    pub fn take_unsent(&mut self) -> Option<DocumentState> {
        self.unsent.take()
    }

    pub fn is_redundant(&self, content: &Value, now: Instant) -> bool {
        self.echo.is_redundant(content, now)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn clear(&mut self) {
        self.debouncer.cancel();
        self.echo.disarm();
        self.unsent = None;
    }
}
