//! Use [SQLite](https://sqlite.org/index.html) to store checkpoints.
//!
//! One row per actor identity; saving again upserts the row. The DB
//! file and tables will automatically be created if there's no
//! previous checkpoint data.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite_migration::Migrations;
use rusqlite_migration::M;

use super::StoragePort;
#[cfg(test)]
use crate::callback::storage_callback;
use crate::callback::StorageCallback;
use crate::errors::StorageError;
use crate::identity::ActorIdentity;
use crate::identity::StateBytes;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE ckpts ( \
         saved_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP, \
         prototype TEXT NOT NULL, \
         actor_key TEXT NOT NULL, \
         state BLOB NOT NULL, \
         PRIMARY KEY (prototype, actor_key) \
         ) STRICT",
    )])
}

/// Wrapper around an SQLite DB connection with methods for our
/// checkpoint operations.
///
/// The connection is behind a mutex so store and fetch workers can
/// share one backend.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        tracing::info!("Opened checkpoint DB at {path:?}");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, StorageError> {
        setup_conn(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn upsert(&self, identity: &ActorIdentity, state: &StateBytes) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ckpts (prototype, actor_key, state) \
             VALUES (?1, ?2, ?3) \
             ON CONFLICT (prototype, actor_key) DO UPDATE \
             SET state = excluded.state, saved_at = CURRENT_TIMESTAMP",
            (identity.prototype(), identity.key(), state.as_slice()),
        )?;
        Ok(())
    }
}

/// Setup our connection-level pragmas. Run this on each connection.
fn setup_conn(conn: &mut Connection) -> Result<(), StorageError> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // These are recommended by Litestream.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_row| Ok(()))?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    migrations().to_latest(conn)?;
    Ok(())
}

impl StoragePort for SqliteStorage {
    #[tracing::instrument(name = "SqliteStorage.save", level = "trace", skip_all)]
    fn save(&self, identity: &ActorIdentity, state: StateBytes, callback: StorageCallback) {
        match self.upsert(identity, &state) {
            Ok(()) => {
                tracing::trace!("Wrote {} bytes for {identity}", state.len());
                callback.success(identity.to_string());
            }
            Err(err) => {
                tracing::error!("Cannot write checkpoint for {identity}: {err}");
                callback.failure(format!("{identity} : {err}"));
            }
        }
    }

    fn fetch(&self, identity: &ActorIdentity) -> Result<Option<StateBytes>, StorageError> {
        let conn = self.conn.lock();
        let state = conn
            .query_row(
                "SELECT state FROM ckpts WHERE prototype = ?1 AND actor_key = ?2",
                (identity.prototype(), identity.key()),
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(state.map(StateBytes))
    }

    fn list_stored_identities(&self) -> Result<HashSet<ActorIdentity>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT prototype, actor_key FROM ckpts")?;
        let rows = stmt.query_map((), |row| {
            Ok(ActorIdentity::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })?;
        let mut identities = HashSet::new();
        for identity in rows {
            identities.insert(identity?);
        }
        Ok(identities)
    }
}

#[test]
fn migrations_valid() -> rusqlite_migration::Result<()> {
    migrations().validate()
}

#[test]
fn sqlite_save_then_fetch() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let id = ActorIdentity::new("Counter", "k1");

    let (callback, handle) = storage_callback(id.clone());
    storage.save(&id, StateBytes(b"first".to_vec()), callback);
    assert!(handle.wait().is_success());

    let (callback, handle) = storage_callback(id.clone());
    storage.save(&id, StateBytes(b"second".to_vec()), callback);
    assert!(handle.wait().is_success());

    let found = storage.fetch(&id).unwrap();
    assert_eq!(found, Some(StateBytes(b"second".to_vec())));
}

#[test]
fn sqlite_fetch_missing_is_none() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let found = storage.fetch(&ActorIdentity::new("Counter", "k1")).unwrap();
    assert_eq!(found, None);
}

#[test]
fn sqlite_keeps_prototypes_apart() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let counter = ActorIdentity::new("Counter", "k1");
    let averager = ActorIdentity::new("Averager", "k1");
    for (id, state) in [(&counter, b"c"), (&averager, b"a")] {
        let (callback, handle) = storage_callback(id.clone());
        storage.save(id, StateBytes(state.to_vec()), callback);
        assert!(handle.wait().is_success());
    }

    assert_eq!(
        storage.fetch(&counter).unwrap(),
        Some(StateBytes(b"c".to_vec()))
    );
    let expected: HashSet<_> = [counter, averager].into_iter().collect();
    assert_eq!(storage.list_stored_identities().unwrap(), expected);
}

#[test]
fn sqlite_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.sqlite3");
    let id = ActorIdentity::new("Counter", "k1");
    {
        let storage = SqliteStorage::open(&path).unwrap();
        let (callback, handle) = storage_callback(id.clone());
        storage.save(&id, StateBytes(vec![4, 2]), callback);
        assert!(handle.wait().is_success());
    }
    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.fetch(&id).unwrap(), Some(StateBytes(vec![4, 2])));
}
