//! Mutual exclusion between event processing and serialization.
//!
//! Each actor identity gets an [`ActorLock`] that tracks which actor
//! instance is currently being processed and which is currently
//! being serialized. The two sides are deliberately asymmetric:
//!
//! - The processing thread is latency critical. If it finds its actor
//!   being serialized it waits at most the configured max lock wait,
//!   then clears the serializing slot and proceeds anyway. The
//!   snapshot in flight may then be torn; that is logged as an error
//!   and reported as [`AcquireOutcome::Overridden`].
//!
//! - The serialization side must never snapshot mid-mutation, so it
//!   waits in slices of the max lock wait and retries until the
//!   processing slot is released. It only gives up if a retry budget
//!   is configured and exhausted, or the registry is cancelled.
//!
//! Locks are created lazily and live in a concurrent map. They are
//! not evicted implicitly; call [`ActorLockRegistry::sweep_idle`] to
//! drop locks nobody holds or references.
//!
//! A slot whose holder instance was dropped without releasing it is
//! treated as empty.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::errors::LockError;
use crate::identity::ActorIdentity;
use crate::identity::HolderId;

#[derive(Debug, Default)]
struct Slots {
    processing: Option<HolderId>,
    serializing: Option<HolderId>,
}

impl Slots {
    fn clear_dead(&mut self) {
        if self.processing.as_ref().is_some_and(|h| !h.is_alive()) {
            self.processing = None;
        }
        if self.serializing.as_ref().is_some_and(|h| !h.is_alive()) {
            self.serializing = None;
        }
    }

    fn is_idle(&mut self) -> bool {
        self.clear_dead();
        self.processing.is_none() && self.serializing.is_none()
    }
}

fn holds(slot: &Option<HolderId>, holder: &HolderId) -> bool {
    slot.as_ref() == Some(holder)
}

/// Synchronization record for a single actor identity.
#[derive(Debug, Default)]
pub(crate) struct ActorLock {
    slots: Mutex<Slots>,
    processing_finished: Condvar,
    serializing_finished: Condvar,
}

/// How the processing side got its permit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// No serialization was in the way, or it finished in time.
    Clean,
    /// Serialization did not finish within the max lock wait and its
    /// slot was forcibly cleared. A snapshot taken concurrently may
    /// not be consistent.
    Overridden,
}

#[derive(Debug)]
pub struct ActorLockRegistry {
    locks: DashMap<ActorIdentity, Arc<ActorLock>>,
    max_lock_wait: Duration,
    max_serialization_retries: Option<u32>,
    cancelled: AtomicBool,
}

impl ActorLockRegistry {
    pub fn new(max_lock_wait: Duration, max_serialization_retries: Option<u32>) -> Self {
        Self {
            locks: DashMap::new(),
            max_lock_wait,
            max_serialization_retries,
            cancelled: AtomicBool::new(false),
        }
    }

    fn lock_for(&self, identity: &ActorIdentity) -> Arc<ActorLock> {
        if let Some(lock) = self.existing_lock(identity) {
            return lock;
        }
        self.locks.entry(identity.clone()).or_default().clone()
    }

    fn existing_lock(&self, identity: &ActorIdentity) -> Option<Arc<ActorLock>> {
        self.locks.get(identity).map(|lock| lock.clone())
    }

    /// Mark `holder` as being processed.
    ///
    /// Blocks only if `holder` is currently being serialized.
    pub fn acquire_for_processing(
        &self,
        identity: &ActorIdentity,
        holder: &HolderId,
    ) -> AcquireOutcome {
        let lock = self.lock_for(identity);
        let mut slots = lock.slots.lock();
        slots.clear_dead();
        let mut outcome = AcquireOutcome::Clean;
        if holds(&slots.serializing, holder) {
            tracing::trace!("Processing of {identity} waits for serialization to finish");
            let deadline = Instant::now() + self.max_lock_wait;
            while holds(&slots.serializing, holder) {
                if lock
                    .serializing_finished
                    .wait_until(&mut slots, deadline)
                    .timed_out()
                    && holds(&slots.serializing, holder)
                {
                    tracing::error!(
                        "Could not acquire permit for processing {identity} after {:?}; \
                         proceeding anyway, but checkpoint may contain inconsistent state",
                        self.max_lock_wait
                    );
                    slots.serializing = None;
                    outcome = AcquireOutcome::Overridden;
                }
            }
        }
        slots.processing = Some(holder.clone());
        outcome
    }

    pub fn release_from_processing(&self, identity: &ActorIdentity, holder: &HolderId) {
        let released = self.existing_lock(identity).is_some_and(|lock| {
            let mut slots = lock.slots.lock();
            if holds(&slots.processing, holder) {
                slots.processing = None;
                lock.processing_finished.notify_all();
                true
            } else {
                false
            }
        });
        if !released {
            tracing::warn!(
                "Cannot release {identity} from processing: it is not in processing state"
            );
        }
    }

    /// Mark `holder` as being serialized, waiting for any processing
    /// of it to finish first.
    ///
    /// The returned permit releases the serializing slot when
    /// dropped.
    pub fn acquire_for_serialization(
        &self,
        identity: &ActorIdentity,
        holder: &HolderId,
    ) -> Result<SerializationPermit, LockError> {
        let lock = self.lock_for(identity);
        {
            let mut slots = lock.slots.lock();
            slots.clear_dead();
            let mut attempts = 0u32;
            while holds(&slots.processing, holder) {
                if self.cancelled.load(Ordering::Acquire) {
                    return Err(LockError::Cancelled(identity.clone()));
                }
                if let Some(budget) = self.max_serialization_retries {
                    if attempts >= budget {
                        return Err(LockError::RetryBudgetExhausted {
                            identity: identity.clone(),
                            attempts,
                        });
                    }
                }
                tracing::trace!("Serialization of {identity} waits for processing to finish");
                if lock
                    .processing_finished
                    .wait_for(&mut slots, self.max_lock_wait)
                    .timed_out()
                {
                    attempts += 1;
                    tracing::debug!(
                        "Still waiting on processing of {identity} before serializing; attempt {attempts}"
                    );
                }
            }
            slots.serializing = Some(holder.clone());
        }
        Ok(SerializationPermit {
            identity: identity.clone(),
            holder: holder.clone(),
            lock,
        })
    }

    pub fn release_from_serialization(&self, identity: &ActorIdentity, holder: &HolderId) {
        if let Some(lock) = self.existing_lock(identity) {
            release_serializing(&lock, holder);
        }
    }

    /// Wake any serialization waits and make them fail instead of
    /// retrying.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let locks: Vec<_> = self.locks.iter().map(|lock| lock.value().clone()).collect();
        for lock in locks {
            // Waiters check the flag under this mutex.
            let _slots = lock.slots.lock();
            lock.processing_finished.notify_all();
        }
    }

    /// Number of actor locks currently held in the registry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Drop locks with both slots empty that nobody else references.
    ///
    /// Returns how many were removed.
    pub fn sweep_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_identity, lock| Arc::strong_count(lock) > 1 || !lock.slots.lock().is_idle());
        let removed = before.saturating_sub(self.locks.len());
        tracing::debug!("Swept {removed} idle actor locks");
        removed
    }

    #[cfg(test)]
    fn slots_of(&self, identity: &ActorIdentity) -> (Option<HolderId>, Option<HolderId>) {
        match self.existing_lock(identity) {
            Some(lock) => {
                let mut slots = lock.slots.lock();
                slots.clear_dead();
                (slots.processing.clone(), slots.serializing.clone())
            }
            None => (None, None),
        }
    }
}

fn release_serializing(lock: &ActorLock, holder: &HolderId) {
    let mut slots = lock.slots.lock();
    if holds(&slots.serializing, holder) {
        slots.serializing = None;
        lock.serializing_finished.notify_all();
    }
}

/// Proof that an actor instance holds the serializing slot.
///
/// Dropping it releases the slot, so it is released on every exit
/// path of a snapshot, including panics.
#[derive(Debug)]
pub struct SerializationPermit {
    identity: ActorIdentity,
    holder: HolderId,
    lock: Arc<ActorLock>,
}

impl SerializationPermit {
    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }
}

impl Drop for SerializationPermit {
    fn drop(&mut self) {
        release_serializing(&self.lock, &self.holder);
    }
}

#[cfg(test)]
fn test_registry(wait_ms: u64) -> Arc<ActorLockRegistry> {
    Arc::new(ActorLockRegistry::new(Duration::from_millis(wait_ms), None))
}

#[test]
fn uncontended_acquires_do_not_block() {
    let registry = test_registry(1000);
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    let start = Instant::now();
    assert_eq!(
        registry.acquire_for_processing(&id, &holder),
        AcquireOutcome::Clean
    );
    registry.release_from_processing(&id, &holder);
    let permit = registry.acquire_for_serialization(&id, &holder).unwrap();
    drop(permit);
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(registry.slots_of(&id), (None, None));
}

#[test]
fn serialization_waits_for_processing_release() {
    let registry = test_registry(20);
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    registry.acquire_for_processing(&id, &holder);

    let (tx, rx) = crossbeam_channel::bounded(1);
    let waiter = {
        let registry = registry.clone();
        let id = id.clone();
        let holder = holder.clone();
        std::thread::spawn(move || {
            let permit = registry.acquire_for_serialization(&id, &holder).unwrap();
            tx.send(Instant::now()).unwrap();
            drop(permit);
        })
    };

    // Several retry slices pass without serialization starting.
    std::thread::sleep(Duration::from_millis(100));
    assert!(rx.try_recv().is_err());

    let released_at = Instant::now();
    registry.release_from_processing(&id, &holder);
    let acquired_at = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(acquired_at >= released_at);
    waiter.join().unwrap();
}

#[test]
fn processing_overrides_stale_serialization() {
    let registry = test_registry(50);
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    let permit = registry.acquire_for_serialization(&id, &holder).unwrap();

    let start = Instant::now();
    let outcome = registry.acquire_for_processing(&id, &holder);
    let waited = start.elapsed();

    assert_eq!(outcome, AcquireOutcome::Overridden);
    assert!(waited >= Duration::from_millis(50), "{waited:?}");
    assert!(waited < Duration::from_millis(500), "{waited:?}");
    assert_eq!(registry.slots_of(&id), (Some(holder.clone()), None));

    // Late release of the overridden permit must not clobber the
    // processing slot.
    drop(permit);
    assert_eq!(registry.slots_of(&id), (Some(holder), None));
}

#[test]
fn processing_waits_for_serialization_to_finish() {
    let registry = test_registry(1000);
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    let permit = registry.acquire_for_serialization(&id, &holder).unwrap();
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        drop(permit);
    });

    let outcome = registry.acquire_for_processing(&id, &holder);
    assert_eq!(outcome, AcquireOutcome::Clean);
    releaser.join().unwrap();
}

#[test]
fn other_instances_do_not_block() {
    let registry = test_registry(1000);
    let id = ActorIdentity::new("Counter", "k1");
    let old_actor = Arc::new(1);
    let new_actor = Arc::new(2);
    let old = HolderId::of(&old_actor);
    let new = HolderId::of(&new_actor);

    let _permit = registry.acquire_for_serialization(&id, &old).unwrap();
    let start = Instant::now();
    assert_eq!(
        registry.acquire_for_processing(&id, &new),
        AcquireOutcome::Clean
    );
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(registry.slots_of(&id), (Some(new), Some(old)));
}

#[test]
fn locks_are_keyed_by_full_identity() {
    let registry = test_registry(1000);
    let counter = ActorIdentity::new("Counter", "k1");
    let averager = ActorIdentity::new("Averager", "k1");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    registry.acquire_for_processing(&counter, &holder);
    registry.acquire_for_processing(&averager, &HolderId::of(&Arc::new(())));
    assert_eq!(registry.slots_of(&averager), (None, None));
    assert_eq!(registry.slots_of(&counter), (Some(holder), None));
    assert_eq!(registry.len(), 2);
}

#[test]
fn release_by_non_holder_is_a_noop() {
    let registry = test_registry(1000);
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(1);
    let other = Arc::new(2);
    let holder = HolderId::of(&actor);
    let stranger = HolderId::of(&other);

    registry.acquire_for_processing(&id, &holder);
    registry.release_from_processing(&id, &stranger);
    assert_eq!(registry.slots_of(&id), (Some(holder), None));
}

#[test]
fn release_of_unknown_identity_adds_no_lock() {
    let registry = test_registry(1000);
    let actor = Arc::new(());
    registry.release_from_processing(&ActorIdentity::new("Counter", "k1"), &HolderId::of(&actor));
    assert!(registry.is_empty());
}

#[test]
fn dropped_holder_does_not_block_new_instance() {
    let registry = test_registry(10);
    let id = ActorIdentity::new("Counter", "k1");

    // The old instance dies mid-processing, never releasing.
    let old_actor = Arc::new(1u64);
    registry.acquire_for_processing(&id, &HolderId::of(&old_actor));
    drop(old_actor);

    let new_actor = Arc::new(2u64);
    let new = HolderId::of(&new_actor);
    let start = Instant::now();
    let permit = registry.acquire_for_serialization(&id, &new).unwrap();
    drop(permit);
    assert_eq!(
        registry.acquire_for_processing(&id, &new),
        AcquireOutcome::Clean
    );
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(registry.slots_of(&id), (Some(new.clone()), None));

    registry.release_from_processing(&id, &new);
    assert_eq!(registry.sweep_idle(), 1);
}

#[test]
fn dead_slot_is_swept() {
    let registry = test_registry(1000);
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(());
    registry.acquire_for_processing(&id, &HolderId::of(&actor));
    assert_eq!(registry.sweep_idle(), 0);
    drop(actor);
    assert_eq!(registry.sweep_idle(), 1);
}

#[test]
fn retry_budget_bounds_serialization_wait() {
    let registry = Arc::new(ActorLockRegistry::new(Duration::from_millis(10), Some(3)));
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    registry.acquire_for_processing(&id, &holder);
    let found = registry.acquire_for_serialization(&id, &holder);
    assert!(matches!(
        found,
        Err(LockError::RetryBudgetExhausted { attempts: 3, .. })
    ));
    assert_eq!(registry.slots_of(&id), (Some(holder), None));
}

#[test]
fn cancel_wakes_serialization_wait() {
    let registry = test_registry(10_000);
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    registry.acquire_for_processing(&id, &holder);
    let waiter = {
        let registry = registry.clone();
        let id = id.clone();
        let holder = holder.clone();
        std::thread::spawn(move || {
            registry
                .acquire_for_serialization(&id, &holder)
                .map(drop)
        })
    };
    std::thread::sleep(Duration::from_millis(30));
    let start = Instant::now();
    registry.cancel();
    let found = waiter.join().unwrap();
    assert!(matches!(found, Err(LockError::Cancelled(_))));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn sweep_keeps_busy_and_referenced_locks() {
    let registry = test_registry(1000);
    let busy = ActorIdentity::new("Counter", "busy");
    let held = ActorIdentity::new("Counter", "held");
    let idle = ActorIdentity::new("Counter", "idle");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    registry.acquire_for_processing(&busy, &holder);
    let permit = registry.acquire_for_serialization(&held, &holder).unwrap();
    registry.acquire_for_processing(&idle, &holder);
    registry.release_from_processing(&idle, &holder);
    assert_eq!(registry.len(), 3);

    assert_eq!(registry.sweep_idle(), 1);
    assert_eq!(registry.len(), 2);

    drop(permit);
    registry.release_from_processing(&busy, &holder);
    assert_eq!(registry.sweep_idle(), 2);
    assert!(registry.is_empty());
}

#[test]
fn explicit_serialization_release_wakes_processing() {
    let registry = test_registry(1000);
    let id = ActorIdentity::new("Counter", "k1");
    let actor = Arc::new(());
    let holder = HolderId::of(&actor);

    let permit = registry.acquire_for_serialization(&id, &holder).unwrap();
    assert_eq!(permit.identity(), &id);
    registry.release_from_serialization(&id, &holder);
    assert_eq!(registry.slots_of(&id), (None, None));

    let start = Instant::now();
    assert_eq!(
        registry.acquire_for_processing(&id, &holder),
        AcquireOutcome::Clean
    );
    assert!(start.elapsed() < Duration::from_millis(100));
    drop(permit);
    assert_eq!(registry.slots_of(&id), (Some(holder), None));
}
