//! The work run on each checkpointing worker pool.
//!
//! A save is split in two tasks linked by a one-shot channel: a
//! [`SerializeTask`] snapshots the actor under its serialization
//! permit and sends the bytes on, and a [`StoreTask`] waits for them
//! and hands them to the storage backend. A fetch is a single
//! [`FetchTask`] whose caller waits on the reply with a timeout.

use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;

use crate::actor::ActorRef;
use crate::actor::Serializer;
use crate::callback::StorageCallback;
use crate::errors::CheckpointError;
use crate::errors::StorageError;
use crate::identity::ActorIdentity;
use crate::identity::HolderId;
use crate::identity::StateBytes;
use crate::locks::ActorLockRegistry;
use crate::metrics::CheckpointMetrics;
use crate::pool::panic_message;
use crate::pool::Task;
use crate::store::StoragePort;
use crate::with_timer;

pub(crate) type Snapshot = Result<StateBytes, CheckpointError>;

pub(crate) type Fetched = Result<Option<StateBytes>, StorageError>;

pub(crate) struct SerializeTask {
    pub(crate) actor: ActorRef,
    pub(crate) identity: ActorIdentity,
    pub(crate) registry: Arc<ActorLockRegistry>,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) downstream: Sender<Snapshot>,
    pub(crate) metrics: Arc<CheckpointMetrics>,
}

impl Task for SerializeTask {
    #[tracing::instrument(name = "SerializeTask.run", level = "trace", skip_all)]
    fn run(self) {
        let snapshot = with_timer!(
            self.metrics.serialize_duration,
            [],
            snapshot(
                &self.registry,
                self.serializer.as_ref(),
                &self.actor,
                &self.identity,
            )
        );
        if let Err(err) = &snapshot {
            tracing::error!("Cannot serialize {}: {err}", self.identity);
        }
        // The store task may already have given up.
        let _ = self.downstream.send(snapshot);
    }
}

/// Serialize `actor` while holding its serialization permit.
///
/// The permit is released on every path out, including a panicking
/// serializer.
fn snapshot(
    registry: &ActorLockRegistry,
    serializer: &dyn Serializer,
    actor: &ActorRef,
    identity: &ActorIdentity,
) -> Snapshot {
    let permit = registry.acquire_for_serialization(identity, &HolderId::of(actor))?;
    let snapshot = catch_unwind(AssertUnwindSafe(|| serializer.serialize(actor.as_ref())))
        .unwrap_or_else(|panic| {
            Err(CheckpointError::Serialization {
                identity: identity.clone(),
                reason: format!("serializer panicked: {}", panic_message(&*panic)),
            })
        });
    drop(permit);
    snapshot
}

pub(crate) struct StoreTask {
    pub(crate) identity: ActorIdentity,
    pub(crate) upstream: Receiver<Snapshot>,
    pub(crate) callback: StorageCallback,
    pub(crate) storage: Arc<dyn StoragePort>,
    pub(crate) max_wait: Option<Duration>,
    pub(crate) metrics: Arc<CheckpointMetrics>,
}

impl StoreTask {
    fn wait_upstream(&self) -> Result<Snapshot, String> {
        match self.max_wait {
            Some(max_wait) => self.upstream.recv_timeout(max_wait).map_err(|err| match err {
                RecvTimeoutError::Timeout => {
                    format!("gave up waiting {max_wait:?} for the snapshot")
                }
                RecvTimeoutError::Disconnected => "snapshot was abandoned".to_string(),
            }),
            None => self
                .upstream
                .recv()
                .map_err(|_| "snapshot was abandoned".to_string()),
        }
    }
}

impl Task for StoreTask {
    #[tracing::instrument(name = "StoreTask.run", level = "trace", skip_all)]
    fn run(self) {
        match self.wait_upstream() {
            Ok(Ok(state)) => {
                let Self {
                    identity,
                    callback,
                    storage,
                    metrics,
                    ..
                } = self;
                with_timer!(
                    metrics.store_duration,
                    [],
                    storage.save(&identity, state, callback)
                );
            }
            Ok(Err(err)) => self.callback.failure(format!("{} : {err}", self.identity)),
            Err(reason) => self.callback.failure(format!("{} : {reason}", self.identity)),
        }
    }
}

pub(crate) struct FetchTask {
    pub(crate) identity: ActorIdentity,
    pub(crate) storage: Arc<dyn StoragePort>,
    pub(crate) reply: Sender<Fetched>,
}

impl Task for FetchTask {
    #[tracing::instrument(name = "FetchTask.run", level = "trace", skip_all)]
    fn run(self) {
        let fetched = self.storage.fetch(&self.identity);
        if self.reply.send(fetched).is_err() {
            tracing::debug!(
                "Discarding late fetch result for {}; caller stopped waiting",
                self.identity
            );
        }
    }
}

#[cfg(test)]
struct Fixed(Result<Vec<u8>, &'static str>);

#[cfg(test)]
impl crate::actor::Actor for Fixed {
    fn identity(&self) -> ActorIdentity {
        ActorIdentity::new("Fixed", "k1")
    }

    fn snapshot_state(&self) -> Result<StateBytes, CheckpointError> {
        self.0
            .clone()
            .map(StateBytes)
            .map_err(|reason| CheckpointError::Serialization {
                identity: self.identity(),
                reason: reason.to_string(),
            })
    }
}

#[cfg(test)]
fn serialize_task(actor: ActorRef) -> (SerializeTask, Receiver<Snapshot>) {
    let (downstream, upstream) = crossbeam_channel::bounded(1);
    let task = SerializeTask {
        identity: actor.identity(),
        actor,
        registry: Arc::new(ActorLockRegistry::new(Duration::from_millis(10), None)),
        serializer: Arc::new(crate::actor::SnapshotSerializer),
        downstream,
        metrics: Arc::new(CheckpointMetrics::new()),
    };
    (task, upstream)
}

#[test]
fn serialize_task_sends_snapshot() {
    let (task, upstream) = serialize_task(Arc::new(Fixed(Ok(vec![7]))));
    task.run();
    assert_eq!(upstream.recv().unwrap().unwrap(), StateBytes(vec![7]));
}

#[test]
fn store_task_fails_callback_on_upstream_error() {
    let (task, upstream) = serialize_task(Arc::new(Fixed(Err("bad state"))));
    let identity = task.identity.clone();
    let (callback, handle) = crate::callback::storage_callback(identity.clone());
    let storage = Arc::new(crate::store::in_mem::InMemoryStorage::new());
    let store = StoreTask {
        identity,
        upstream,
        callback,
        storage: storage.clone(),
        max_wait: None,
        metrics: Arc::new(CheckpointMetrics::new()),
    };
    task.run();
    store.run();

    let found = handle.wait();
    assert!(!found.is_success());
    assert!(found.message.contains("bad state"), "{}", found.message);
    assert!(storage.is_empty());
}

#[test]
fn store_task_gives_up_after_max_wait() {
    let identity = ActorIdentity::new("Fixed", "k1");
    let (_downstream, upstream) = crossbeam_channel::bounded(1);
    let (callback, handle) = crate::callback::storage_callback(identity.clone());
    let store = StoreTask {
        identity,
        upstream,
        callback,
        storage: Arc::new(crate::store::noop::NoopStorage),
        max_wait: Some(Duration::from_millis(10)),
        metrics: Arc::new(CheckpointMetrics::new()),
    };
    store.run();

    let found = handle.wait();
    assert!(!found.is_success());
    assert!(found.message.contains("gave up waiting"), "{}", found.message);
}
