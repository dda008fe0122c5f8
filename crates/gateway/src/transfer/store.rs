//! Keyed storage for transfer sessions.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

/// Associative store `transfer_id -> session`.
///
/// Each entry carries its own mutex; every mutation of a session happens
/// under it. The store itself gives no ordering guarantees beyond lookup.
pub trait TransferStore<T>: Send + Sync {
    /// Insert a session, replacing any previous one with the same id.
    fn add(&self, transfer_id: String, session: T);

    fn get(&self, transfer_id: &str) -> Option<Arc<Mutex<T>>>;

    fn remove(&self, transfer_id: &str) -> Option<Arc<Mutex<T>>>;

    /// Snapshot of all stored ids.
    fn transfer_ids(&self) -> Vec<String>;

    fn len(&self) -> usize {
        self.transfer_ids().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local store backed by a concurrent map.
#[derive(Debug)]
pub struct InMemoryTransferStore<T> {
    sessions: DashMap<String, Arc<Mutex<T>>>,
}

impl<T> Default for InMemoryTransferStore<T> {
    fn default() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

impl<T> InMemoryTransferStore<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Send> TransferStore<T> for InMemoryTransferStore<T> {
    fn add(&self, transfer_id: String, session: T) {
        self.sessions.insert(transfer_id, Arc::new(Mutex::new(session)));
    }

    fn get(&self, transfer_id: &str) -> Option<Arc<Mutex<T>>> {
        self.sessions.get(transfer_id).map(|entry| Arc::clone(entry.value()))
    }

    fn remove(&self, transfer_id: &str) -> Option<Arc<Mutex<T>>> {
        self.sessions.remove(transfer_id).map(|(_, session)| session)
    }

    fn transfer_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let store = InMemoryTransferStore::new();
        assert!(store.is_empty());

        store.add("t1".to_string(), 1u32);
        store.add("t2".to_string(), 2u32);
        assert_eq!(store.len(), 2);

        let entry = store.get("t1").unwrap();
        *entry.lock().unwrap() += 10;
        assert_eq!(*store.get("t1").unwrap().lock().unwrap(), 11);

        let removed = store.remove("t1").unwrap();
        assert_eq!(*removed.lock().unwrap(), 11);
        assert!(store.get("t1").is_none());
        assert!(store.remove("t1").is_none());

        assert_eq!(store.transfer_ids(), vec!["t2".to_string()]);
    }

    #[test]
    fn test_removed_entry_outlives_store_slot() {
        let store = InMemoryTransferStore::new();
        store.add("t".to_string(), String::from("session"));
        let held = store.get("t").unwrap();
        store.remove("t");
        assert_eq!(held.lock().unwrap().as_str(), "session");
    }
}
