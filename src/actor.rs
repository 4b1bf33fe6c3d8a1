//! What the checkpointing machinery needs from stateful actors.

use std::sync::Arc;

use crate::errors::CheckpointError;
use crate::identity::ActorIdentity;
use crate::identity::StateBytes;

/// A unit of mutable, checkpointable processing state.
///
/// Actors are shared between the processing thread and the
/// serialize stage, so any mutation must go through interior
/// mutability. The processing engine brackets every mutation with
/// [`crate::CheckpointCoordinator::acquire_for_processing`] and
/// [`crate::CheckpointCoordinator::release_from_processing`]; the
/// serialize stage only calls [`Actor::snapshot_state`] while no
/// mutation is in progress.
pub trait Actor: Send + Sync + 'static {
    fn identity(&self) -> ActorIdentity;

    fn snapshot_state(&self) -> Result<StateBytes, CheckpointError>;
}

pub type ActorRef = Arc<dyn Actor>;

/// Turns an actor into checkpoint bytes.
pub trait Serializer: Send + Sync + 'static {
    fn serialize(&self, actor: &dyn Actor) -> Result<StateBytes, CheckpointError>;
}

/// Uses each actor's own [`Actor::snapshot_state`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotSerializer;

impl Serializer for SnapshotSerializer {
    fn serialize(&self, actor: &dyn Actor) -> Result<StateBytes, CheckpointError> {
        actor.snapshot_state()
    }
}
