//! Keyed reader-writer lock registry.
//!
//! Locks are identified by qualified resource ids and only exist while held.
//! Acquisition never waits: a conflicting request fails immediately.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::warn;

/// Read or write access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Shared access; any number of readers may hold it.
    Read,
    /// Exclusive access.
    Write,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer
    }

    fn try_take(&mut self, kind: LockKind) -> bool {
        match kind {
            LockKind::Read if !self.writer => {
                self.readers += 1;
                true
            }
            LockKind::Write if self.is_free() => {
                self.writer = true;
                true
            }
            _ => false,
        }
    }
}

/// Process-wide registry of named reader-writer locks.
///
/// Each check-and-take runs under the map shard lock of its key, so two
/// concurrent write requests for the same id can never both succeed.
#[derive(Debug, Default)]
pub struct LockRegistry {
    entries: DashMap<String, LockState>,
}

impl LockRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take a lock without blocking.
    pub fn try_acquire(&self, id: &str, kind: LockKind) -> bool {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut entry) => entry.get_mut().try_take(kind),
            Entry::Vacant(entry) => {
                let mut state = LockState::default();
                let taken = state.try_take(kind);
                entry.insert(state);
                taken
            }
        }
    }

    /// Release a lock taken with [`try_acquire`](Self::try_acquire).
    pub fn release(&self, id: &str, kind: LockKind) {
        let Entry::Occupied(mut entry) = self.entries.entry(id.to_string()) else {
            warn!(lock = id, ?kind, "Released a lock that is not held");
            return;
        };

        let state = entry.get_mut();
        match kind {
            LockKind::Read => state.readers = state.readers.saturating_sub(1),
            LockKind::Write => state.writer = false,
        }
        if state.is_free() {
            entry.remove();
        }
    }

    /// Returns true if any lock is held on `id`.
    pub fn is_locked(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns true if a write lock is held on `id`.
    pub fn is_write_locked(&self, id: &str) -> bool {
        self.entries.get(id).is_some_and(|state| state.writer)
    }

    /// Number of read locks held on `id`.
    pub fn reader_count(&self, id: &str) -> usize {
        self.entries.get(id).map_or(0, |state| state.readers)
    }

    /// Number of ids with at least one lock held.
    pub fn held_count(&self) -> usize {
        self.entries.len()
    }
}
