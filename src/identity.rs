//! Keys and payloads that name and carry checkpointed state.

use std::fmt;
use std::hash::Hash;
use std::hash::Hasher;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Weak;

use seahash::SeaHasher;
use serde::Deserialize;
use serde::Serialize;

/// Names a stateful actor for checkpointing purposes.
///
/// Locks and storage records are keyed off the whole `(prototype,
/// key)` pair, so two prototypes that happen to share an instance key
/// never contend or overwrite each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorIdentity {
    prototype: String,
    key: String,
}

impl ActorIdentity {
    pub fn new(prototype: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            prototype: prototype.into(),
            key: key.into(),
        }
    }

    pub fn prototype(&self) -> &str {
        &self.prototype
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Which partition of `count` this actor's checkpoints belong to.
    pub fn partition(&self, count: PartitionCount) -> PartitionIndex {
        let mut hasher = SeaHasher::new();
        hasher.write(self.to_string().as_bytes());
        // Count is never zero; see `PartitionCount::new`.
        PartitionIndex((hasher.finish() % count.0 as u64) as usize)
    }
}

/// Canonical `[prototype];[key]` representation, used as a stable
/// storage key by backends.
impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}];[{}]", self.prototype, self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdentityError(String);

impl fmt::Display for ParseIdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a `[prototype];[key]` identity: {:?}", self.0)
    }
}

impl std::error::Error for ParseIdentityError {}

impl FromStr for ActorIdentity {
    type Err = ParseIdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .and_then(|inner| inner.split_once("];["))
            .map(|(prototype, key)| Self::new(prototype, key))
            .ok_or_else(|| ParseIdentityError(s.to_string()))
    }
}

/// Serialized actor state.
///
/// The checkpointing machinery only deals in bytes; the wire format
/// is up to the [`crate::Serializer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBytes(pub Vec<u8>);

impl StateBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for StateBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Identifies one live actor *instance*.
///
/// Processing and serializing roles on an actor lock are held by a
/// specific instance, so a recreated actor with the same identity is
/// a different holder.
///
/// Holds a weak reference to the instance. That keeps its allocation
/// from being reused while the holder sits in a lock slot, and lets
/// the lock tell when the instance is gone.
#[derive(Clone)]
pub struct HolderId(Arc<dyn Instance>);

trait Instance: Send + Sync {
    fn addr(&self) -> usize;

    fn is_alive(&self) -> bool;
}

impl<T: ?Sized + Send + Sync> Instance for Weak<T> {
    fn addr(&self) -> usize {
        self.as_ptr() as *const () as usize
    }

    fn is_alive(&self) -> bool {
        self.strong_count() > 0
    }
}

impl HolderId {
    pub fn of<T: ?Sized + Send + Sync + 'static>(instance: &Arc<T>) -> Self {
        Self(Arc::new(Arc::downgrade(instance)))
    }

    /// Whether the instance has not been dropped yet.
    pub fn is_alive(&self) -> bool {
        self.0.is_alive()
    }
}

impl PartialEq for HolderId {
    fn eq(&self, other: &Self) -> bool {
        self.0.addr() == other.0.addr()
    }
}

impl Eq for HolderId {}

impl std::hash::Hash for HolderId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.addr().hash(state);
    }
}

impl fmt::Debug for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HolderId")
            .field(&format_args!("{:#x}", self.0.addr()))
            .field(&self.is_alive())
            .finish()
    }
}

/// IDs a specific partition.
///
/// The inner value will be less than the [`PartitionCount`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionIndex(pub usize);

/// Total number of partitions in the cluster.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCount(usize);

impl PartitionCount {
    /// Returns `None` for zero, which means topology is not known yet.
    pub fn new(count: usize) -> Option<Self> {
        (count > 0).then_some(Self(count))
    }

    pub fn get(&self) -> usize {
        self.0
    }

    /// Return an iter of all partitions.
    pub fn iter(&self) -> impl Iterator<Item = PartitionIndex> {
        (0..self.0).map(PartitionIndex)
    }
}

#[test]
fn identity_display_round_trips() {
    let id = ActorIdentity::new("WordCounter", "apple");
    let found: ActorIdentity = id.to_string().parse().unwrap();
    assert_eq!(found, id);
    assert_eq!(id.to_string(), "[WordCounter];[apple]");
}

#[test]
fn identity_parse_allows_empty_components() {
    let found: ActorIdentity = "[];[]".parse().unwrap();
    assert_eq!(found, ActorIdentity::new("", ""));
}

#[test]
fn identity_parse_rejects_garbage() {
    assert!("WordCounter/apple".parse::<ActorIdentity>().is_err());
    assert!("[WordCounter][apple]".parse::<ActorIdentity>().is_err());
}

#[test]
fn identity_distinguishes_prototypes() {
    let a = ActorIdentity::new("Counter", "k1");
    let b = ActorIdentity::new("Averager", "k1");
    assert_ne!(a, b);
}

#[test]
fn identity_serde_tokens() {
    use serde_test::{assert_tokens, Token};

    let id = ActorIdentity::new("Counter", "k1");
    assert_tokens(
        &id,
        &[
            Token::Struct {
                name: "ActorIdentity",
                len: 2,
            },
            Token::Str("prototype"),
            Token::Str("Counter"),
            Token::Str("key"),
            Token::Str("k1"),
            Token::StructEnd,
        ],
    );
}

#[test]
fn partition_is_stable_and_in_range() {
    let count = PartitionCount::new(4).unwrap();
    let id = ActorIdentity::new("Counter", "k1");
    let first = id.partition(count);
    assert!(first.0 < 4);
    assert_eq!(id.partition(count), first);
    assert_eq!(count.iter().count(), 4);
}

#[test]
fn zero_partitions_is_not_a_topology() {
    assert_eq!(PartitionCount::new(0), None);
}

#[test]
fn holder_ids_follow_instances() {
    let a = Arc::new(1u8);
    let b = Arc::new(1u8);
    assert_eq!(HolderId::of(&a), HolderId::of(&a.clone()));
    assert_ne!(HolderId::of(&a), HolderId::of(&b));
}

#[test]
fn dropped_instance_address_is_not_reused_while_held() {
    let old = HolderId::of(&Arc::new(1u64));
    let new = HolderId::of(&Arc::new(2u64));
    assert!(!old.is_alive());
    assert!(!new.is_alive());
    assert_ne!(old, new);
}
