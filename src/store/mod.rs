//! Storage backends for checkpoints.
//!
//! A backend is anything implementing [`StoragePort`]. It holds at
//! most one checkpoint per [`ActorIdentity`]; saving again replaces
//! the previous one. Saves report through the [`StorageCallback`]
//! they are handed, rather than a return value, so backends are free
//! to complete them asynchronously.
//!
//! There are 3 backends here: [`in_mem::InMemoryStorage`] for tests
//! and single process use, [`sqlite::SqliteStorage`] for durable
//! local storage and [`noop::NoopStorage`] for when checkpointing is
//! disabled.

use std::collections::HashSet;

use crate::callback::StorageCallback;
use crate::errors::StorageError;
use crate::identity::ActorIdentity;
use crate::identity::StateBytes;

pub mod in_mem;
pub mod noop;
pub mod sqlite;

pub trait StoragePort: Send + Sync + 'static {
    /// Persist `state` as the checkpoint for `identity` and report
    /// the outcome through `callback`.
    fn save(&self, identity: &ActorIdentity, state: StateBytes, callback: StorageCallback);

    /// The last checkpoint of `identity`, or `None` if there is none.
    fn fetch(&self, identity: &ActorIdentity) -> Result<Option<StateBytes>, StorageError>;

    fn list_stored_identities(&self) -> Result<HashSet<ActorIdentity>, StorageError>;
}
