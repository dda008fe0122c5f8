//! Hierarchical resource locking.
//!
//! Structural changes (delete, move, overwrite) must not race with reads,
//! writes or transfers on the same resource or anything below it. Every
//! operation locks its target plus the read locks of the target's ancestor
//! chain, so a write lock on a folder excludes all activity inside it.

pub mod chain;
pub mod registry;

pub use chain::{ChainLockGuard, ChainLockManager};
pub use registry::{LockKind, LockRegistry};
