use std::panic::Location;

use thiserror::Error;

use crate::identity::ActorIdentity;

/// Errors surfaced by the checkpointing facade.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpointing collaborators are not ready yet")]
    NotReady,

    #[error("no event dispatcher configured; cannot recover {0}")]
    NoDispatcher(ActorIdentity),

    #[error("cannot serialize state of {identity}: {reason}")]
    Serialization {
        identity: ActorIdentity,
        reason: String,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot start checkpointing workers: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors from a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("sqlite migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
}

impl StorageError {
    /// Build a [`StorageError::Backend`] whose message is prefixed with
    /// the location it was raised from.
    #[track_caller]
    pub fn backend(msg: impl AsRef<str>) -> Self {
        let caller = Location::caller();
        Self::Backend(prepend_caller(caller, msg.as_ref()))
    }
}

/// Errors from the serialization side of the actor lock protocol.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("gave up waiting for processing of {identity} to finish after {attempts} attempts")]
    RetryBudgetExhausted {
        identity: ActorIdentity,
        attempts: u32,
    },

    #[error("lock wait for {0} cancelled by shutdown")]
    Cancelled(ActorIdentity),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid checkpointing config: {0}")]
    Invalid(String),

    #[error("cannot parse checkpointing config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot read checkpointing config: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot dispatch on stream {stream}: {reason}")]
    Rejected { stream: String, reason: String },
}

/// Prepend '({caller}) ' to the message
fn prepend_caller(caller: &Location, msg: &str) -> String {
    format!("({caller}) {msg}")
}

/// Prepend the name of the current thread to each line,
/// if present.
pub(crate) fn prepend_tname(msg: String) -> String {
    let tname = std::thread::current()
        .name()
        .unwrap_or("unnamed-thread")
        .to_string();
    msg.lines()
        .map(|line| format!("<{tname}> {line}\n"))
        .collect()
}

#[test]
fn backend_error_carries_location() {
    let err = StorageError::backend("disk on fire");
    let msg = err.to_string();
    assert!(msg.contains("errors.rs"), "{msg}");
    assert!(msg.ends_with("disk on fire"), "{msg}");
}

#[test]
fn prepend_tname_prefixes_every_line() {
    let found = std::thread::Builder::new()
        .name("worker-7".into())
        .spawn(|| prepend_tname("one\ntwo".to_string()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(found, "<worker-7> one\n<worker-7> two\n");
}
