//! Chain locks: a resource lock plus read locks on its ancestor folders.
//!
//! Acquisition order is fixed for every caller: ancestors root-most first,
//! then the target. Acquisition is all-or-nothing and non-blocking. Release
//! happens in exactly reverse order when the guard is dropped.

use std::iter;
use std::sync::Arc;

use tracing::debug;

use super::registry::{LockKind, LockRegistry};

/// Acquires chain locks against a shared [`LockRegistry`].
#[derive(Debug, Clone, Default)]
pub struct ChainLockManager {
    registry: Arc<LockRegistry>,
}

impl ChainLockManager {
    /// Creates a manager with its own registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager sharing an existing registry.
    pub fn with_registry(registry: Arc<LockRegistry>) -> Self {
        Self { registry }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    /// Try to lock `resource_id` with `kind` and every id in `ancestor_ids`
    /// (root-most first) for reading.
    ///
    /// Never blocks. If any lock in the chain is unavailable, the locks taken
    /// so far are released and a disabled guard is returned.
    pub fn acquire(
        &self,
        resource_id: &str,
        kind: LockKind,
        ancestor_ids: &[String],
    ) -> ChainLockGuard {
        let mut held: Vec<(String, LockKind)> = Vec::with_capacity(ancestor_ids.len() + 1);

        let requests = ancestor_ids
            .iter()
            .map(|id| (id.as_str(), LockKind::Read))
            .chain(iter::once((resource_id, kind)));

        for (id, lock_kind) in requests {
            if self.registry.try_acquire(id, lock_kind) {
                held.push((id.to_string(), lock_kind));
                continue;
            }

            debug!(
                resource = resource_id,
                contended = id,
                kind = ?lock_kind,
                "Chain lock unavailable, rolling back"
            );
            while let Some((taken, taken_kind)) = held.pop() {
                self.registry.release(&taken, taken_kind);
            }
            return ChainLockGuard {
                registry: Arc::clone(&self.registry),
                resource_id: resource_id.to_string(),
                kind,
                held,
                enabled: false,
            };
        }

        debug!(resource = resource_id, ?kind, locks = held.len(), "Chain lock acquired");
        ChainLockGuard {
            registry: Arc::clone(&self.registry),
            resource_id: resource_id.to_string(),
            kind,
            held,
            enabled: true,
        }
    }
}

/// Scoped chain lock.
///
/// A disabled guard holds nothing; the protected operation must not run.
/// Dropping either kind of guard is always safe.
#[derive(Debug)]
#[must_use = "the chain lock is released as soon as the guard is dropped"]
pub struct ChainLockGuard {
    registry: Arc<LockRegistry>,
    resource_id: String,
    kind: LockKind,
    held: Vec<(String, LockKind)>,
    enabled: bool,
}

impl ChainLockGuard {
    /// Whether the whole chain was acquired.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Qualified id of the locked resource.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Lock kind requested for the resource itself.
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Number of locks currently held by this guard.
    pub fn lock_count(&self) -> usize {
        self.held.len()
    }
}

impl Drop for ChainLockGuard {
    fn drop(&mut self) {
        while let Some((id, kind)) = self.held.pop() {
            self.registry.release(&id, kind);
        }
    }
}
