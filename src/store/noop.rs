//! A checkpoint store which does nothing.

use std::collections::HashSet;

use super::StoragePort;
#[cfg(test)]
use crate::callback::storage_callback;
use crate::callback::StorageCallback;
use crate::errors::StorageError;
use crate::identity::ActorIdentity;
use crate::identity::StateBytes;

/// Saves are dropped and reads are the same as an empty store.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl StoragePort for NoopStorage {
    fn save(&self, identity: &ActorIdentity, _state: StateBytes, callback: StorageCallback) {
        callback.success(format!("{identity} discarded; checkpointing is disabled"));
    }

    fn fetch(&self, _identity: &ActorIdentity) -> Result<Option<StateBytes>, StorageError> {
        Ok(None)
    }

    fn list_stored_identities(&self) -> Result<HashSet<ActorIdentity>, StorageError> {
        Ok(HashSet::new())
    }
}

#[test]
fn noop_store_forgets_everything() {
    let id = ActorIdentity::new("Counter", "k1");
    let (callback, handle) = storage_callback(id.clone());
    NoopStorage.save(&id, StateBytes(vec![1, 2, 3]), callback);
    assert!(handle.wait().is_success());
    assert_eq!(NoopStorage.fetch(&id).unwrap(), None);
    assert!(NoopStorage.list_stored_identities().unwrap().is_empty());
}
