use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use statekeeper::store::in_mem::InMemoryStorage;
use statekeeper::{
    Actor, ActorIdentity, ActorRef, CheckpointCoordinator, CheckpointError, CheckpointingConfig,
    PartitionCount, SnapshotSerializer, StateBytes,
};

struct Blob {
    key: String,
    state: Vec<u8>,
}

impl Actor for Blob {
    fn identity(&self) -> ActorIdentity {
        ActorIdentity::new("Blob", &self.key)
    }

    fn snapshot_state(&self) -> Result<StateBytes, CheckpointError> {
        Ok(StateBytes(self.state.clone()))
    }
}

fn coordinator() -> CheckpointCoordinator {
    let coordinator = CheckpointCoordinator::new(CheckpointingConfig::default())
        .expect("coordinator should start");
    coordinator.set_serializer(Arc::new(SnapshotSerializer));
    coordinator.set_storage(Arc::new(InMemoryStorage::new()));
    coordinator.set_topology(PartitionCount::new(1).expect("non-zero partitions"));
    coordinator
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let coordinator = coordinator();

    let mut group = c.benchmark_group("checkpoint");
    for size in [64, 4096, 65536] {
        let actor: ActorRef = Arc::new(Blob {
            key: format!("k{size}"),
            state: vec![0xAB; size],
        });
        group.bench_function(BenchmarkId::new("save", size), |b| {
            b.iter(|| assert!(coordinator.save(&actor).wait().is_success()));
        });
        group.bench_function(BenchmarkId::new("fetch", size), |b| {
            b.iter(|| assert!(coordinator.fetch(&actor.identity()).is_some()));
        });
        group.bench_function(BenchmarkId::new("process", size), |b| {
            b.iter(|| {
                coordinator.acquire_for_processing(&actor);
                coordinator.release_from_processing(&actor);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
