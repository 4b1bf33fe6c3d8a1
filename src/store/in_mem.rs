//! Implementation of an in-memory checkpoint store.

use std::collections::HashMap;
use std::collections::HashSet;

use parking_lot::Mutex;

use super::StoragePort;
#[cfg(test)]
use crate::callback::storage_callback;
use crate::callback::StorageCallback;
use crate::errors::StorageError;
use crate::identity::ActorIdentity;
use crate::identity::StateBytes;

/// A checkpoint store with all data in memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    db: Mutex<HashMap<ActorIdentity, StateBytes>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.db.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.lock().is_empty()
    }
}

impl StoragePort for InMemoryStorage {
    fn save(&self, identity: &ActorIdentity, state: StateBytes, callback: StorageCallback) {
        let len = state.len();
        self.db.lock().insert(identity.clone(), state);
        tracing::trace!("Stored {len} bytes for {identity}");
        callback.success(identity.to_string());
    }

    fn fetch(&self, identity: &ActorIdentity) -> Result<Option<StateBytes>, StorageError> {
        Ok(self.db.lock().get(identity).cloned())
    }

    fn list_stored_identities(&self) -> Result<HashSet<ActorIdentity>, StorageError> {
        Ok(self.db.lock().keys().cloned().collect())
    }
}

#[test]
fn save_overwrites_previous_checkpoint() {
    let storage = InMemoryStorage::new();
    let id = ActorIdentity::new("Counter", "k1");

    let (callback, handle) = storage_callback(id.clone());
    storage.save(&id, StateBytes(vec![1]), callback);
    assert!(handle.wait().is_success());

    let (callback, handle) = storage_callback(id.clone());
    storage.save(&id, StateBytes(vec![2]), callback);
    assert!(handle.wait().is_success());

    assert_eq!(storage.fetch(&id).unwrap(), Some(StateBytes(vec![2])));
    assert_eq!(storage.len(), 1);
}

#[test]
fn fetch_missing_is_none() {
    let storage = InMemoryStorage::new();
    let found = storage.fetch(&ActorIdentity::new("Counter", "k1")).unwrap();
    assert_eq!(found, None);
    assert!(storage.is_empty());
}

#[test]
fn list_returns_all_identities() {
    let storage = InMemoryStorage::new();
    for key in ["a", "b"] {
        let id = ActorIdentity::new("Counter", key);
        let (callback, _handle) = storage_callback(id.clone());
        storage.save(&id, StateBytes(vec![0]), callback);
    }
    let found = storage.list_stored_identities().unwrap();
    let expected: HashSet<_> = [
        ActorIdentity::new("Counter", "a"),
        ActorIdentity::new("Counter", "b"),
    ]
    .into_iter()
    .collect();
    assert_eq!(found, expected);
}
