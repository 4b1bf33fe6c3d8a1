//! Checkpointing for actor-style stream processors.
//!
//! Stateful actors are periodically snapshotted and written to a
//! pluggable storage backend, so they can be restored after a crash.
//! The [`CheckpointCoordinator`] is the entry point:
//!
//! - The processing engine brackets each mutation of an actor with
//!   [`CheckpointCoordinator::acquire_for_processing`] and
//!   [`CheckpointCoordinator::release_from_processing`]. Snapshots of
//!   that actor never interleave with a mutation.
//!
//! - [`CheckpointCoordinator::save`] queues a snapshot and returns a
//!   [`CheckpointHandle`] immediately. Snapshots run on a single
//!   serialize worker in submission order and are then handed to the
//!   store workers. Every queue is bounded; when one is full the save
//!   is dropped and its handle reports a failure.
//!
//! - [`CheckpointCoordinator::fetch`] loads the latest checkpoint with
//!   a timeout. Repeated fetch failures disable fetching for a
//!   cooldown period so a broken backend does not stall recovery.
//!
//! Storage backends implement [`StoragePort`]; see the [`store`]
//! module for the ones that ship with this crate.

pub mod actor;
mod breaker;
pub mod callback;
pub mod config;
mod coordinator;
pub mod errors;
pub mod identity;
pub mod locks;
pub mod metrics;
mod pool;
pub mod recovery;
mod stages;
pub mod store;
pub mod tracing;

pub use actor::Actor;
pub use actor::ActorRef;
pub use actor::Serializer;
pub use actor::SnapshotSerializer;
pub use callback::CheckpointHandle;
pub use callback::StorageCallback;
pub use callback::StorageResult;
pub use callback::StorageResultCode;
pub use config::CheckpointingConfig;
pub use coordinator::CheckpointCoordinator;
pub use errors::CheckpointError;
pub use identity::ActorIdentity;
pub use identity::PartitionCount;
pub use identity::PartitionIndex;
pub use identity::StateBytes;
pub use locks::AcquireOutcome;
pub use recovery::EventDispatcher;
pub use recovery::RecoveryEvent;
pub use store::StoragePort;
