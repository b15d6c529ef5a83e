//! Throttled re-publication of the local pointer and selection.
//!
//! Cursor data rides on the presence record (`Channel::track`), never on a
//! broadcast of its own. Publication is best-effort and lossy: while the
//! throttle interval is running only the latest position is kept, and it
//! goes out as a trailing update once the interval has elapsed.

use tokio::time::{Duration, Instant};

use crate::presence::CursorPosition;

/// Rate limiter for cursor publication with a trailing update.
#[derive(Debug, Clone)]
pub struct CursorBroadcaster {
    interval: Duration,
    last_publish: Option<Instant>,
    pending: Option<CursorPosition>,
    published: u64,
    coalesced: u64,
}

impl CursorBroadcaster {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_publish: None,
            pending: None,
            published: 0,
            coalesced: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record a new position. Returns the position to publish now, or `None`
    /// if throttled (the position is kept for the trailing publish).
    pub fn update(&mut self, cursor: CursorPosition, now: Instant) -> Option<CursorPosition> {
        let throttled = self
            .last_publish
            .is_some_and(|last| now.duration_since(last) < self.interval);
        if throttled {
            if self.pending.replace(cursor).is_some() {
                self.coalesced += 1;
            }
            return None;
        }
        self.pending = None;
        self.mark_published(now);
        Some(cursor)
    }

    /// When the trailing position is due, if one is waiting.
    pub fn deadline(&self) -> Option<Instant> {
        match (self.pending, self.last_publish) {
            (Some(_), Some(last)) => Some(last + self.interval),
            (Some(_), None) => Some(Instant::now()),
            _ => None,
        }
    }

    /// Take the trailing position if its deadline has passed.
    pub fn poll_due(&mut self, now: Instant) -> Option<CursorPosition> {
        let due = self.deadline().is_some_and(|deadline| now >= deadline);
        if !due {
            return None;
        }
        let cursor = self.pending.take()?;
        self.mark_published(now);
        Some(cursor)
    }

    /// Drop any trailing position (used while disconnected).
    pub fn clear(&mut self) {
        self.pending = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Positions published so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Positions overwritten before they could be published.
    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    fn mark_published(&mut self, now: Instant) {
        self.last_publish = Some(now);
        self.published += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_first_update_publishes_immediately() {
        let base = Instant::now();
        let mut cursor = CursorBroadcaster::new(Duration::from_millis(100));
        let pos = CursorPosition::new(1.0, 2.0);
        assert_eq!(cursor.update(pos, base), Some(pos));
        assert_eq!(cursor.deadline(), None);
        assert_eq!(cursor.published(), 1);
    }

    #[test]
    fn test_burst_is_throttled_with_trailing_update() {
        let base = Instant::now();
        let mut cursor = CursorBroadcaster::new(Duration::from_millis(100));
        cursor.update(CursorPosition::new(0.0, 0.0), base);

        assert_eq!(cursor.update(CursorPosition::new(1.0, 0.0), at(base, 20)), None);
        assert_eq!(cursor.update(CursorPosition::new(2.0, 0.0), at(base, 40)), None);
        assert_eq!(cursor.coalesced(), 1);
        assert_eq!(cursor.deadline(), Some(at(base, 100)));

        // Not yet due.
        assert_eq!(cursor.poll_due(at(base, 99)), None);
        // Only the latest position goes out.
        assert_eq!(cursor.poll_due(at(base, 100)), Some(CursorPosition::new(2.0, 0.0)));
        assert!(!cursor.has_pending());
        assert_eq!(cursor.published(), 2);
    }

    #[test]
    fn test_update_after_interval_publishes_directly() {
        let base = Instant::now();
        let mut cursor = CursorBroadcaster::new(Duration::from_millis(50));
        cursor.update(CursorPosition::new(0.0, 0.0), base);
        let pos = CursorPosition::new(5.0, 5.0);
        assert_eq!(cursor.update(pos, at(base, 60)), Some(pos));
    }

    #[test]
    fn test_clear_drops_trailing() {
        let base = Instant::now();
        let mut cursor = CursorBroadcaster::new(Duration::from_millis(100));
        cursor.update(CursorPosition::new(0.0, 0.0), base);
        cursor.update(CursorPosition::new(1.0, 1.0), at(base, 10));
        cursor.clear();
        assert_eq!(cursor.deadline(), None);
        assert_eq!(cursor.poll_due(at(base, 500)), None);
    }
}
