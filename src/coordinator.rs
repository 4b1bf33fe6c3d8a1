//! The checkpointing facade used by the processing engine.
//!
//! A [`CheckpointCoordinator`] owns the actor lock registry and the
//! three stage pools. Its collaborators arrive separately, once the
//! runtime has them: the serializer, the storage backend and the
//! cluster topology. Until all three are set, saves fail immediately
//! and fetches wait.
//!
//! Nothing on the save path ever blocks the caller. A full stage
//! queue fails the save through its handle instead.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::actor::ActorRef;
use crate::actor::Serializer;
use crate::breaker::FetchBreaker;
use crate::callback::storage_callback;
use crate::callback::CheckpointHandle;
use crate::config::CheckpointingConfig;
use crate::errors::CheckpointError;
use crate::identity::ActorIdentity;
use crate::identity::HolderId;
use crate::identity::PartitionCount;
use crate::identity::PartitionIndex;
use crate::identity::StateBytes;
use crate::locks::AcquireOutcome;
use crate::locks::ActorLockRegistry;
use crate::metrics::CheckpointMetrics;
use crate::metrics::Stage;
use crate::pool::Rejection;
use crate::pool::Task;
use crate::pool::WorkerPool;
use crate::recovery::recovery_stream_name;
use crate::recovery::EventDispatcher;
use crate::recovery::RecoveryEvent;
use crate::stages::FetchTask;
use crate::stages::SerializeTask;
use crate::stages::StoreTask;
use crate::store::StoragePort;

#[derive(Default)]
struct Collaborators {
    serializer: Option<Arc<dyn Serializer>>,
    storage: Option<Arc<dyn StoragePort>>,
    partitions: Option<PartitionCount>,
}

/// Everything needed to run a checkpoint operation.
struct Ready {
    serializer: Arc<dyn Serializer>,
    storage: Arc<dyn StoragePort>,
}

impl Collaborators {
    fn ready(&self) -> Option<Ready> {
        match (&self.serializer, &self.storage, &self.partitions) {
            (Some(serializer), Some(storage), Some(_partitions)) => Some(Ready {
                serializer: serializer.clone(),
                storage: storage.clone(),
            }),
            _ => None,
        }
    }
}

pub struct CheckpointCoordinator {
    config: CheckpointingConfig,
    registry: Arc<ActorLockRegistry>,
    collaborators: Mutex<Collaborators>,
    collaborators_changed: Condvar,
    dispatcher: Mutex<Option<Arc<dyn EventDispatcher>>>,
    breaker: FetchBreaker,
    metrics: Arc<CheckpointMetrics>,
    // Drop order matters: serialization drains before the store
    // tasks waiting on it.
    serialization: WorkerPool<SerializeTask>,
    storage: WorkerPool<StoreTask>,
    fetching: WorkerPool<FetchTask>,
}

impl CheckpointCoordinator {
    pub fn new(config: CheckpointingConfig) -> Result<Self, CheckpointError> {
        config.validate()?;
        let registry = Arc::new(ActorLockRegistry::new(
            config.max_lock_wait(),
            config.serialization_max_lock_retries,
        ));
        let breaker = FetchBreaker::new(
            config.fetching_max_consecutive_failures_before_disabling,
            config.fetching_disabled_duration(),
        );
        let serialization =
            WorkerPool::new("serialization", 1, config.serialization_max_outstanding_requests)?;
        let storage = WorkerPool::new(
            "storage",
            config.storage_max_threads,
            config.storage_max_outstanding_requests,
        )?;
        let fetching = WorkerPool::new(
            "fetching",
            config.fetching_max_threads,
            config.fetching_queue_size,
        )?;
        tracing::info!("Checkpointing started with {config:?}");
        Ok(Self {
            config,
            registry,
            collaborators: Mutex::new(Collaborators::default()),
            collaborators_changed: Condvar::new(),
            dispatcher: Mutex::new(None),
            breaker,
            metrics: Arc::new(CheckpointMetrics::new()),
            serialization,
            storage,
            fetching,
        })
    }

    pub fn config(&self) -> &CheckpointingConfig {
        &self.config
    }

    fn update_collaborators(&self, f: impl FnOnce(&mut Collaborators)) {
        let mut collaborators = self.collaborators.lock();
        f(&mut collaborators);
        if collaborators.ready().is_some() {
            tracing::debug!("Checkpointing collaborators ready");
        }
        self.collaborators_changed.notify_all();
    }

    pub fn set_serializer(&self, serializer: Arc<dyn Serializer>) {
        self.update_collaborators(|c| c.serializer = Some(serializer));
    }

    pub fn set_storage(&self, storage: Arc<dyn StoragePort>) {
        self.update_collaborators(|c| c.storage = Some(storage));
    }

    pub fn set_topology(&self, partitions: PartitionCount) {
        self.update_collaborators(|c| c.partitions = Some(partitions));
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn EventDispatcher>) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    pub fn is_ready(&self) -> bool {
        self.collaborators.lock().ready().is_some()
    }

    /// Block until serializer, storage and topology are all set, or
    /// `timeout` passes. Returns whether the coordinator is ready.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut collaborators = self.collaborators.lock();
        while collaborators.ready().is_none() {
            if self
                .collaborators_changed
                .wait_until(&mut collaborators, deadline)
                .timed_out()
            {
                return collaborators.ready().is_some();
            }
        }
        true
    }

    fn block_until_ready(&self) -> Ready {
        let mut collaborators = self.collaborators.lock();
        loop {
            if let Some(ready) = collaborators.ready() {
                return ready;
            }
            tracing::trace!("Waiting for checkpointing collaborators");
            self.collaborators_changed.wait(&mut collaborators);
        }
    }

    /// Which partition `identity` belongs to, once topology is known.
    pub fn partition_of(&self, identity: &ActorIdentity) -> Option<PartitionIndex> {
        let partitions = self.collaborators.lock().partitions;
        partitions.map(|count| identity.partition(count))
    }

    /// Checkpoint `actor` in the background.
    ///
    /// Returns right away. The handle resolves once the state is
    /// stored, or with a failure if it was dropped anywhere along the
    /// way.
    #[tracing::instrument(name = "CheckpointCoordinator.save", level = "trace", skip_all)]
    pub fn save(&self, actor: &ActorRef) -> CheckpointHandle {
        let identity = actor.identity();
        let (callback, handle) = storage_callback(identity.clone());
        let ready = self.collaborators.lock().ready();
        let ready = match ready {
            Some(ready) => ready,
            None => {
                callback.failure(format!("{identity} : {}", CheckpointError::NotReady));
                return handle;
            }
        };
        self.maybe_sweep();

        let (downstream, upstream) = crossbeam_channel::bounded(1);
        let serialize = SerializeTask {
            actor: actor.clone(),
            identity: identity.clone(),
            registry: self.registry.clone(),
            serializer: ready.serializer,
            downstream,
            metrics: self.metrics.clone(),
        };
        if let Err((rejection, _serialize)) = self.serialization.try_submit(serialize) {
            self.metrics.dropped(Stage::Serialization);
            callback.failure(rejection_message(&self.serialization, rejection, &identity));
            return handle;
        }
        self.metrics.queued(Stage::Serialization);

        let store = StoreTask {
            identity: identity.clone(),
            upstream,
            callback,
            storage: ready.storage,
            max_wait: self.config.storage_upstream_max_wait(),
            metrics: self.metrics.clone(),
        };
        if let Err((rejection, store)) = self.storage.try_submit(store) {
            self.metrics.dropped(Stage::Storage);
            store
                .callback
                .failure(rejection_message(&self.storage, rejection, &identity));
            return handle;
        }
        self.metrics.queued(Stage::Storage);
        handle
    }

    /// Load the latest checkpoint of `identity`.
    ///
    /// Waits for the coordinator to be ready, then at most
    /// `fetching_max_wait_ms` for storage. Returns `None` if nothing
    /// is stored, the fetch failed or timed out, or fetching is
    /// disabled after repeated failures.
    #[tracing::instrument(name = "CheckpointCoordinator.fetch", level = "trace", skip_all)]
    pub fn fetch(&self, identity: &ActorIdentity) -> Option<StateBytes> {
        let ready = self.block_until_ready();
        if !self.breaker.allow() {
            tracing::debug!("Checkpoint fetching is disabled; not fetching {identity}");
            self.metrics.fetch_short_circuited();
            return None;
        }

        let (reply, fetched) = crossbeam_channel::bounded(1);
        let task = FetchTask {
            identity: identity.clone(),
            storage: ready.storage,
            reply,
        };
        if let Err((rejection, _task)) = self.fetching.try_submit(task) {
            self.metrics.dropped(Stage::Fetching);
            tracing::warn!("{}", rejection_message(&self.fetching, rejection, identity));
            self.fetch_failed();
            return None;
        }
        self.metrics.queued(Stage::Fetching);

        let max_wait = self.config.fetching_max_wait();
        match fetched.recv_timeout(max_wait) {
            Ok(Ok(state)) => {
                self.breaker.record_success();
                self.metrics.fetched();
                state
            }
            Ok(Err(err)) => {
                tracing::error!("Cannot fetch checkpoint of {identity}: {err}");
                self.fetch_failed();
                None
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Fetching checkpoint of {identity} timed out after {max_wait:?}");
                self.fetch_failed();
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                tracing::error!("Fetching checkpoint of {identity} was abandoned");
                self.fetch_failed();
                None
            }
        }
    }

    fn fetch_failed(&self) {
        self.metrics.fetch_failed();
        self.breaker.record_failure();
    }

    /// Every identity with a stored checkpoint.
    pub fn stored_identities(&self) -> Result<HashSet<ActorIdentity>, CheckpointError> {
        let ready = self.block_until_ready();
        Ok(ready.storage.list_stored_identities()?)
    }

    /// Ask the application to restore `identity` by dispatching a
    /// [`RecoveryEvent`] on its prototype's recovery stream.
    pub fn initiate_recovery(&self, identity: &ActorIdentity) -> Result<(), CheckpointError> {
        let dispatcher = self
            .dispatcher
            .lock()
            .clone()
            .ok_or_else(|| CheckpointError::NoDispatcher(identity.clone()))?;
        let stream = recovery_stream_name(identity);
        tracing::info!("Initiating recovery of {identity} on {stream}");
        dispatcher.dispatch(&stream, RecoveryEvent::new(identity.clone()))?;
        Ok(())
    }

    /// Call before mutating `actor`.
    ///
    /// Waits for an in-flight snapshot of this actor instance, but
    /// never longer than the max lock time.
    pub fn acquire_for_processing(&self, actor: &ActorRef) -> AcquireOutcome {
        self.maybe_sweep();
        self.registry
            .acquire_for_processing(&actor.identity(), &HolderId::of(actor))
    }

    /// Call once done mutating `actor`.
    pub fn release_from_processing(&self, actor: &ActorRef) {
        self.registry
            .release_from_processing(&actor.identity(), &HolderId::of(actor));
    }

    /// Drop actor locks that are not in use. Returns how many.
    pub fn sweep_idle_locks(&self) -> usize {
        self.registry.sweep_idle()
    }

    fn maybe_sweep(&self) {
        if self.registry.len() > self.config.lock_sweep_threshold {
            self.registry.sweep_idle();
        }
    }
}

impl Drop for CheckpointCoordinator {
    fn drop(&mut self) {
        tracing::debug!("Shutting down checkpointing");
        self.registry.cancel();
    }
}

fn rejection_message<T: Task>(
    pool: &WorkerPool<T>,
    rejection: Rejection,
    identity: &ActorIdentity,
) -> String {
    match rejection {
        Rejection::QueueFull => format!(
            "{identity} : checkpointing {} queue is full \
             (remaining capacity 0, size {}, max capacity {})",
            pool.name(),
            pool.queued(),
            pool.capacity()
        ),
        Rejection::ShutDown => {
            format!("{identity} : checkpointing {} is shut down", pool.name())
        }
    }
}

#[cfg(test)]
use std::sync::atomic::AtomicBool;
#[cfg(test)]
use std::sync::atomic::AtomicU64;
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(test)]
use std::sync::atomic::Ordering;

#[cfg(test)]
use crate::actor::Actor;
#[cfg(test)]
use crate::actor::SnapshotSerializer;
#[cfg(test)]
use crate::callback::StorageCallback;
#[cfg(test)]
use crate::errors::DispatchError;
#[cfg(test)]
use crate::errors::StorageError;
#[cfg(test)]
use crate::store::in_mem::InMemoryStorage;
#[cfg(test)]
use crate::store::sqlite::SqliteStorage;

#[cfg(test)]
fn ready_coordinator(
    config: CheckpointingConfig,
    storage: Arc<dyn StoragePort>,
) -> CheckpointCoordinator {
    let coordinator = CheckpointCoordinator::new(config).unwrap();
    coordinator.set_serializer(Arc::new(SnapshotSerializer));
    coordinator.set_storage(storage);
    coordinator.set_topology(PartitionCount::new(4).unwrap());
    coordinator
}

/// Keeps a count, snapshotted as JSON.
#[cfg(test)]
struct Counter {
    key: String,
    count: AtomicU64,
}

#[cfg(test)]
impl Counter {
    fn new(key: &str, count: u64) -> ActorRef {
        Arc::new(Self {
            key: key.to_string(),
            count: AtomicU64::new(count),
        })
    }
}

#[cfg(test)]
impl Actor for Counter {
    fn identity(&self) -> ActorIdentity {
        ActorIdentity::new("Counter", &self.key)
    }

    fn snapshot_state(&self) -> Result<StateBytes, CheckpointError> {
        serde_json::to_vec(&self.count.load(Ordering::SeqCst))
            .map(StateBytes)
            .map_err(|err| CheckpointError::Serialization {
                identity: self.identity(),
                reason: err.to_string(),
            })
    }
}

/// Actor whose snapshot does whatever the test needs.
#[cfg(test)]
struct Scripted<F> {
    key: String,
    on_snapshot: F,
}

#[cfg(test)]
fn scripted<F>(key: &str, on_snapshot: F) -> ActorRef
where
    F: Fn() -> Result<StateBytes, CheckpointError> + Send + Sync + 'static,
{
    Arc::new(Scripted {
        key: key.to_string(),
        on_snapshot,
    })
}

#[cfg(test)]
impl<F> Actor for Scripted<F>
where
    F: Fn() -> Result<StateBytes, CheckpointError> + Send + Sync + 'static,
{
    fn identity(&self) -> ActorIdentity {
        ActorIdentity::new("Scripted", &self.key)
    }

    fn snapshot_state(&self) -> Result<StateBytes, CheckpointError> {
        (self.on_snapshot)()
    }
}

/// Snapshot that signals it started, then waits for the gate to
/// close.
#[cfg(test)]
fn blocking_actor(key: &str) -> (ActorRef, crossbeam_channel::Receiver<()>, crossbeam_channel::Sender<()>) {
    let (started_tx, started_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
    let actor = scripted(key, move || {
        let _ = started_tx.send(());
        let _ = gate_rx.recv();
        Ok(StateBytes(vec![1]))
    });
    (actor, started_rx, gate_tx)
}

/// Backend whose fetches go through a supplied function and count
/// calls.
#[cfg(test)]
struct ScriptedFetch<F> {
    calls: AtomicUsize,
    on_fetch: F,
}

#[cfg(test)]
impl<F> StoragePort for ScriptedFetch<F>
where
    F: Fn() -> Result<Option<StateBytes>, StorageError> + Send + Sync + 'static,
{
    fn save(&self, _identity: &ActorIdentity, _state: StateBytes, callback: StorageCallback) {
        callback.success("ok");
    }

    fn fetch(&self, _identity: &ActorIdentity) -> Result<Option<StateBytes>, StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.on_fetch)()
    }

    fn list_stored_identities(&self) -> Result<HashSet<ActorIdentity>, StorageError> {
        Ok(HashSet::new())
    }
}

#[cfg(test)]
const WAIT: Duration = Duration::from_secs(5);

#[test]
fn round_trip_through_memory() {
    let coordinator = ready_coordinator(
        CheckpointingConfig::default(),
        Arc::new(InMemoryStorage::new()),
    );
    let actor = Counter::new("k1", 42);

    let result = coordinator.save(&actor).wait();
    assert!(result.is_success(), "{result}");

    let found = coordinator.fetch(&actor.identity()).unwrap();
    let count: u64 = serde_json::from_slice(found.as_slice()).unwrap();
    assert_eq!(count, 42);
}

#[test]
fn round_trip_through_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(SqliteStorage::open(dir.path().join("ckpts.sqlite3")).unwrap());
    let coordinator = ready_coordinator(CheckpointingConfig::default(), storage);
    let actor = Counter::new("k1", 7);

    assert!(coordinator.save(&actor).wait().is_success());
    let found = coordinator.fetch(&actor.identity()).unwrap();
    assert_eq!(found.as_slice(), b"7");

    let expected: HashSet<_> = [actor.identity()].into_iter().collect();
    assert_eq!(coordinator.stored_identities().unwrap(), expected);
}

#[test]
fn fetch_of_unknown_actor_is_none() {
    let coordinator = ready_coordinator(
        CheckpointingConfig::default(),
        Arc::new(InMemoryStorage::new()),
    );
    assert_eq!(coordinator.fetch(&ActorIdentity::new("Counter", "nope")), None);
    assert_eq!(coordinator.breaker.consecutive_failures(), 0);
}

#[test]
fn save_before_ready_fails_immediately() {
    let coordinator = CheckpointCoordinator::new(CheckpointingConfig::default()).unwrap();
    coordinator.set_serializer(Arc::new(SnapshotSerializer));
    coordinator.set_storage(Arc::new(InMemoryStorage::new()));

    let mut handle = coordinator.save(&Counter::new("k1", 1));
    let found = handle.try_result().cloned().unwrap();
    assert!(!found.is_success());
    assert!(found.message.contains("not ready"), "{}", found.message);
    assert!(!coordinator.is_ready());
    assert_eq!(coordinator.partition_of(&ActorIdentity::new("Counter", "k1")), None);
}

#[test]
fn fetch_waits_until_ready() {
    let coordinator = Arc::new(CheckpointCoordinator::new(CheckpointingConfig::default()).unwrap());
    assert!(!coordinator.wait_ready(Duration::from_millis(10)));

    let setter = {
        let coordinator = coordinator.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            coordinator.set_serializer(Arc::new(SnapshotSerializer));
            coordinator.set_storage(Arc::new(InMemoryStorage::new()));
            coordinator.set_topology(PartitionCount::new(2).unwrap());
        })
    };

    let start = Instant::now();
    assert_eq!(coordinator.fetch(&ActorIdentity::new("Counter", "k1")), None);
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(coordinator.wait_ready(Duration::ZERO));
    setter.join().unwrap();

    let identity = ActorIdentity::new("Counter", "k1");
    assert_eq!(
        coordinator.partition_of(&identity),
        Some(identity.partition(PartitionCount::new(2).unwrap()))
    );
}

#[test]
fn snapshots_happen_in_submission_order() {
    let coordinator = ready_coordinator(
        CheckpointingConfig::default(),
        Arc::new(InMemoryStorage::new()),
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    let keys: Vec<String> = (0..20).map(|i| format!("k{i}")).collect();
    let handles: Vec<_> = keys
        .iter()
        .map(|key| {
            let order = order.clone();
            let recorded = key.clone();
            let actor = scripted(key, move || {
                order.lock().push(recorded.clone());
                Ok(StateBytes(vec![0]))
            });
            coordinator.save(&actor)
        })
        .collect();
    for handle in handles {
        assert!(handle.wait().is_success());
    }
    assert_eq!(*order.lock(), keys);
}

#[test]
fn full_serialization_queue_fails_fast() {
    let config = CheckpointingConfig {
        serialization_max_outstanding_requests: 2,
        ..Default::default()
    };
    let coordinator = ready_coordinator(config, Arc::new(InMemoryStorage::new()));

    // Occupy the serialize worker.
    let (blocker, started, gate) = blocking_actor("blocker");
    let blocked = coordinator.save(&blocker);
    started.recv_timeout(WAIT).unwrap();

    let queued: Vec<_> = ["a", "b"]
        .iter()
        .map(|key| coordinator.save(&Counter::new(key, 1)))
        .collect();

    let mut rejected = coordinator.save(&Counter::new("c", 1));
    let found = rejected.try_result().cloned().unwrap();
    assert!(!found.is_success());
    assert!(found.message.contains("serialization queue is full"), "{}", found.message);
    assert!(found.message.contains("max capacity 2"), "{}", found.message);

    drop(gate);
    assert!(blocked.wait().is_success());
    for handle in queued {
        assert!(handle.wait().is_success());
    }
}

#[test]
fn full_storage_queue_fails_fast() {
    /// Backend whose saves wait for the gate to close.
    struct Stuck {
        entered: crossbeam_channel::Sender<()>,
        gate: crossbeam_channel::Receiver<()>,
    }

    impl StoragePort for Stuck {
        fn save(&self, _identity: &ActorIdentity, _state: StateBytes, callback: StorageCallback) {
            let _ = self.entered.send(());
            let _ = self.gate.recv();
            callback.success("stored late");
        }

        fn fetch(&self, _identity: &ActorIdentity) -> Result<Option<StateBytes>, StorageError> {
            Ok(None)
        }

        fn list_stored_identities(&self) -> Result<HashSet<ActorIdentity>, StorageError> {
            Ok(HashSet::new())
        }
    }

    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
    let config = CheckpointingConfig {
        storage_max_threads: 1,
        storage_max_outstanding_requests: 1,
        ..Default::default()
    };
    let coordinator = ready_coordinator(
        config,
        Arc::new(Stuck {
            entered: entered_tx,
            gate: gate_rx,
        }),
    );

    let first = coordinator.save(&Counter::new("a", 1));
    entered_rx.recv_timeout(WAIT).unwrap();
    let second = coordinator.save(&Counter::new("b", 1));

    let mut rejected = coordinator.save(&Counter::new("c", 1));
    let found = rejected.try_result().cloned().unwrap();
    assert!(!found.is_success());
    assert!(found.message.contains("storage queue is full"), "{}", found.message);

    drop(gate_tx);
    assert!(first.wait().is_success());
    assert!(second.wait().is_success());
}

#[test]
fn breaker_skips_storage_until_cooldown() {
    let storage = Arc::new(ScriptedFetch {
        calls: AtomicUsize::new(0),
        on_fetch: || Err(StorageError::backend("storage unreachable")),
    });
    let config = CheckpointingConfig {
        fetching_max_consecutive_failures_before_disabling: 3,
        fetching_disabled_duration_ms: 200,
        ..Default::default()
    };
    let coordinator = ready_coordinator(config, storage.clone());
    let identity = ActorIdentity::new("Counter", "k1");

    for _ in 0..3 {
        assert_eq!(coordinator.fetch(&identity), None);
    }
    assert_eq!(storage.calls.load(Ordering::SeqCst), 3);

    // Open: no I/O.
    assert_eq!(coordinator.fetch(&identity), None);
    assert_eq!(storage.calls.load(Ordering::SeqCst), 3);

    std::thread::sleep(Duration::from_millis(250));
    assert_eq!(coordinator.fetch(&identity), None);
    assert_eq!(storage.calls.load(Ordering::SeqCst), 4);
    assert_eq!(coordinator.breaker.consecutive_failures(), 1);
}

#[test]
fn slow_fetch_times_out() {
    let storage = Arc::new(ScriptedFetch {
        calls: AtomicUsize::new(0),
        on_fetch: || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Some(StateBytes(vec![1])))
        },
    });
    let config = CheckpointingConfig {
        fetching_max_wait_ms: 50,
        ..Default::default()
    };
    let coordinator = ready_coordinator(config, storage);

    let start = Instant::now();
    assert_eq!(coordinator.fetch(&ActorIdentity::new("Counter", "k1")), None);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(50), "{waited:?}");
    assert!(waited < Duration::from_millis(400), "{waited:?}");
    assert_eq!(coordinator.breaker.consecutive_failures(), 1);
}

#[test]
fn failed_snapshot_releases_lock() {
    let coordinator = ready_coordinator(
        CheckpointingConfig::default(),
        Arc::new(InMemoryStorage::new()),
    );
    let actor = scripted("k1", || {
        Err(CheckpointError::Serialization {
            identity: ActorIdentity::new("Scripted", "k1"),
            reason: "unserializable".to_string(),
        })
    });

    let found = coordinator.save(&actor).wait();
    assert!(!found.is_success());
    assert!(found.message.contains("unserializable"), "{}", found.message);

    let start = Instant::now();
    assert_eq!(coordinator.acquire_for_processing(&actor), AcquireOutcome::Clean);
    assert!(start.elapsed() < Duration::from_millis(500));
    coordinator.release_from_processing(&actor);
}

#[test]
fn panicking_snapshot_releases_lock() {
    let coordinator = ready_coordinator(
        CheckpointingConfig::default(),
        Arc::new(InMemoryStorage::new()),
    );
    let actor = scripted("k1", || panic!("snapshot exploded"));

    let found = coordinator.save(&actor).wait();
    assert!(!found.is_success());
    assert!(found.message.contains("snapshot exploded"), "{}", found.message);

    let start = Instant::now();
    assert_eq!(coordinator.acquire_for_processing(&actor), AcquireOutcome::Clean);
    assert!(start.elapsed() < Duration::from_millis(500));

    // The serialize worker survived.
    assert!(coordinator.save(&Counter::new("k2", 1)).wait().is_success());
}

#[test]
fn snapshots_never_see_partial_updates() {
    /// Two fields that processing always keeps equal.
    struct Pair {
        a: AtomicU64,
        b: AtomicU64,
    }

    impl Actor for Pair {
        fn identity(&self) -> ActorIdentity {
            ActorIdentity::new("Pair", "k1")
        }

        fn snapshot_state(&self) -> Result<StateBytes, CheckpointError> {
            let a = self.a.load(Ordering::SeqCst);
            let b = self.b.load(Ordering::SeqCst);
            if a == b {
                Ok(StateBytes(a.to_be_bytes().to_vec()))
            } else {
                Err(CheckpointError::Serialization {
                    identity: self.identity(),
                    reason: format!("torn snapshot: {a} != {b}"),
                })
            }
        }
    }

    let coordinator = Arc::new(ready_coordinator(
        CheckpointingConfig::default(),
        Arc::new(InMemoryStorage::new()),
    ));
    let pair = Arc::new(Pair {
        a: AtomicU64::new(0),
        b: AtomicU64::new(0),
    });
    let actor: ActorRef = pair.clone();
    let done = Arc::new(AtomicBool::new(false));

    let processor = {
        let coordinator = coordinator.clone();
        let actor = actor.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut i = 0;
            while !done.load(Ordering::SeqCst) {
                i += 1;
                assert_eq!(coordinator.acquire_for_processing(&actor), AcquireOutcome::Clean);
                pair.a.store(i, Ordering::SeqCst);
                std::thread::sleep(Duration::from_micros(fastrand::u64(0..200)));
                pair.b.store(i, Ordering::SeqCst);
                coordinator.release_from_processing(&actor);
            }
        })
    };

    for _ in 0..50 {
        let result = coordinator.save(&actor).wait();
        assert!(result.is_success(), "{result}");
        std::thread::sleep(Duration::from_micros(fastrand::u64(0..500)));
    }
    done.store(true, Ordering::SeqCst);
    processor.join().unwrap();
}

#[test]
fn processing_overrides_slow_snapshot() {
    let config = CheckpointingConfig {
        max_serialization_lock_time_ms: 50,
        ..Default::default()
    };
    let coordinator = ready_coordinator(config, Arc::new(InMemoryStorage::new()));
    let (actor, started, gate) = blocking_actor("k1");

    let handle = coordinator.save(&actor);
    started.recv_timeout(WAIT).unwrap();

    let start = Instant::now();
    assert_eq!(
        coordinator.acquire_for_processing(&actor),
        AcquireOutcome::Overridden
    );
    assert!(start.elapsed() >= Duration::from_millis(50));
    coordinator.release_from_processing(&actor);

    drop(gate);
    assert!(handle.wait().is_success());
}

#[test]
fn shutdown_cancels_waiting_serialization() {
    let config = CheckpointingConfig {
        max_serialization_lock_time_ms: 20,
        ..Default::default()
    };
    let coordinator = ready_coordinator(config, Arc::new(InMemoryStorage::new()));
    let actor = Counter::new("k1", 1);

    // Processing never finishes, so serialization keeps retrying.
    coordinator.acquire_for_processing(&actor);
    let handle = coordinator.save(&actor);
    std::thread::sleep(Duration::from_millis(50));
    drop(coordinator);

    let found = handle.wait_timeout(WAIT).unwrap();
    assert!(!found.is_success());
    assert!(found.message.contains("cancelled"), "{}", found.message);
}

#[test]
fn recovery_goes_to_prototype_stream() {
    struct Recording(Mutex<Vec<(String, RecoveryEvent)>>);

    impl EventDispatcher for Recording {
        fn dispatch(&self, stream_name: &str, event: RecoveryEvent) -> Result<(), DispatchError> {
            self.0.lock().push((stream_name.to_string(), event));
            Ok(())
        }
    }

    let coordinator = CheckpointCoordinator::new(CheckpointingConfig::default()).unwrap();
    let identity = ActorIdentity::new("Counter", "k1");
    assert!(matches!(
        coordinator.initiate_recovery(&identity),
        Err(CheckpointError::NoDispatcher(_))
    ));

    let dispatcher = Arc::new(Recording(Mutex::new(Vec::new())));
    coordinator.set_dispatcher(dispatcher.clone());
    coordinator.initiate_recovery(&identity).unwrap();

    let sent = dispatcher.0.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "Counter_recovery");
    assert_eq!(sent[0].1.identity, identity);
}

#[test]
fn idle_locks_get_swept() {
    let config = CheckpointingConfig {
        lock_sweep_threshold: 2,
        ..Default::default()
    };
    let coordinator = ready_coordinator(config, Arc::new(InMemoryStorage::new()));
    for i in 0..10 {
        let actor = Counter::new(&format!("k{i}"), 0);
        coordinator.acquire_for_processing(&actor);
        coordinator.release_from_processing(&actor);
    }
    assert!(coordinator.registry.len() <= 3);

    let busy = Counter::new("busy", 0);
    coordinator.acquire_for_processing(&busy);
    coordinator.sweep_idle_locks();
    assert_eq!(coordinator.registry.len(), 1);
}

#[test]
fn full_fetch_queue_counts_as_failure() {
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
    let storage = Arc::new(ScriptedFetch {
        calls: AtomicUsize::new(0),
        on_fetch: move || {
            let _ = entered_tx.send(());
            let _ = gate_rx.recv();
            Ok(None)
        },
    });
    let config = CheckpointingConfig {
        fetching_max_threads: 1,
        fetching_queue_size: 1,
        fetching_max_wait_ms: 5000,
        ..Default::default()
    };
    let coordinator = Arc::new(ready_coordinator(config, storage.clone()));
    let fetch_in_background = |key: &'static str| {
        let coordinator = coordinator.clone();
        std::thread::spawn(move || coordinator.fetch(&ActorIdentity::new("Counter", key)))
    };

    let running = fetch_in_background("a");
    entered_rx.recv_timeout(WAIT).unwrap();
    let waiting = fetch_in_background("b");
    let deadline = Instant::now() + WAIT;
    while coordinator.fetching.queued() < 1 {
        assert!(Instant::now() < deadline, "second fetch never queued");
        std::thread::sleep(Duration::from_millis(1));
    }

    let start = Instant::now();
    assert_eq!(coordinator.fetch(&ActorIdentity::new("Counter", "c")), None);
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(coordinator.breaker.consecutive_failures(), 1);
    assert_eq!(storage.calls.load(Ordering::SeqCst), 1);

    drop(gate_tx);
    assert_eq!(running.join().unwrap(), None);
    assert_eq!(waiting.join().unwrap(), None);
    assert_eq!(coordinator.breaker.consecutive_failures(), 0);
}

#[test]
fn saves_of_one_actor_are_stored_in_order() {
    /// Backend that records every stored count.
    #[derive(Default)]
    struct Recording(Mutex<Vec<u64>>);

    impl StoragePort for Recording {
        fn save(&self, _identity: &ActorIdentity, state: StateBytes, callback: StorageCallback) {
            match serde_json::from_slice(state.as_slice()) {
                Ok(count) => {
                    self.0.lock().push(count);
                    callback.success("recorded");
                }
                Err(err) => callback.failure(err.to_string()),
            }
        }

        fn fetch(&self, _identity: &ActorIdentity) -> Result<Option<StateBytes>, StorageError> {
            Ok(None)
        }

        fn list_stored_identities(&self) -> Result<HashSet<ActorIdentity>, StorageError> {
            Ok(HashSet::new())
        }
    }

    let storage = Arc::new(Recording::default());
    let config = CheckpointingConfig {
        storage_max_threads: 1,
        ..Default::default()
    };
    let coordinator = ready_coordinator(config, storage.clone());
    let count = Arc::new(AtomicU64::new(0));
    let actor = {
        let count = count.clone();
        scripted("k1", move || {
            let next = count.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(StateBytes(next.to_string().into_bytes()))
        })
    };

    let handles: Vec<_> = (0..20).map(|_| coordinator.save(&actor)).collect();
    for handle in handles {
        let result = handle.wait();
        assert!(result.is_success(), "{result}");
    }
    let stored = storage.0.lock();
    assert_eq!(stored.len(), 20);
    assert!(stored.windows(2).all(|pair| pair[0] < pair[1]), "{stored:?}");
}
