//! Short-lived cache of observed workflow statuses.
//!
//! Several status queries for the same workflow often arrive within a few
//! milliseconds of each other. The cache answers those from memory for a
//! short TTL. It is owned by whoever polls (no process-wide singleton) and
//! reads time through a [`Clock`] so tests can drive expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::status::WorkflowStatus;
use super::types::WorkflowId;

/// Default lifetime of a cached status.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_millis(1000);

/// Source of monotonic time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// TTL cache of workflow statuses keyed by workflow id.
pub struct StatusCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<WorkflowId, (WorkflowStatus, Instant)>>,
}

impl StatusCache {
    /// Create a cache using the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Create a cache reading time from `clock`.
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The cached status, if it is younger than the TTL.
    pub fn get(&self, id: &WorkflowId) -> Option<WorkflowStatus> {
        let entries = self.entries.lock().ok()?;
        let (status, at) = entries.get(id)?;
        (self.clock.now().saturating_duration_since(*at) < self.ttl).then(|| status.clone())
    }

    /// Record a freshly observed status.
    pub fn put(&self, id: WorkflowId, status: WorkflowStatus) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(id, (status, self.clock.now()));
        }
    }

    /// Drop the entry for `id` so the next read goes to storage.
    pub fn invalidate(&self, id: &WorkflowId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(id);
        }
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_TTL)
    }
}

impl std::fmt::Debug for StatusCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeClock;

    #[test]
    fn test_entry_expires_after_ttl() {
        let clock = Arc::new(FakeClock::new());
        let cache = StatusCache::with_clock(Duration::from_millis(1000), clock.clone());
        let id = WorkflowId::new();

        cache.put(id, WorkflowStatus::Running);
        assert_eq!(cache.get(&id), Some(WorkflowStatus::Running));

        clock.advance(Duration::from_millis(999));
        assert_eq!(cache.get(&id), Some(WorkflowStatus::Running));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&id), None);
    }

    #[test]
    fn test_entries_are_keyed_by_workflow() {
        let cache = StatusCache::default();
        let a = WorkflowId::new();
        let b = WorkflowId::new();

        cache.put(a, WorkflowStatus::Finished);
        assert_eq!(cache.get(&a), Some(WorkflowStatus::Finished));
        assert_eq!(cache.get(&b), None);
    }

    #[test]
    fn test_invalidate() {
        let cache = StatusCache::default();
        let id = WorkflowId::new();
        cache.put(id, WorkflowStatus::Failed);
        cache.invalidate(&id);
        assert_eq!(cache.get(&id), None);
    }
}
