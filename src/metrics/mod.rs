use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::metrics::Histogram;
use opentelemetry::metrics::MetricsError;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::Aggregation;
use opentelemetry_sdk::metrics::Instrument;
use opentelemetry_sdk::metrics::MeterProvider;
use opentelemetry_sdk::metrics::Stream;
use prometheus::default_registry;

#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
///
/// Until this is called, checkpointing metrics go to the no-op
/// global provider.
pub fn initialize_metrics() -> Result<(), MetricsError> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace("statekeeper")
        .build()?;

    // Create a global MeterProvider
    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(opentelemetry_sdk::metrics::new_view(
            Instrument::new().name("*duration*"), // Must match histogram name
            Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                boundaries: vec![
                    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5,
                    5.0, 7.5, 10.0,
                ],
                record_min_max: true,
            }),
        )?)
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// The checkpointing stage a metric is about.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Stage {
    Serialization,
    Storage,
    Fetching,
}

impl Stage {
    fn label(self) -> [KeyValue; 1] {
        let name = match self {
            Stage::Serialization => "serialization",
            Stage::Storage => "storage",
            Stage::Fetching => "fetching",
        };
        [KeyValue::new("stage", name)]
    }
}

/// Instruments the coordinator reports to.
pub(crate) struct CheckpointMetrics {
    queued: Counter<u64>,
    dropped: Counter<u64>,
    fetched: Counter<u64>,
    fetch_failed: Counter<u64>,
    fetch_short_circuited: Counter<u64>,
    pub(crate) serialize_duration: Histogram<f64>,
    pub(crate) store_duration: Histogram<f64>,
}

impl CheckpointMetrics {
    pub(crate) fn new() -> Self {
        let meter = global::meter("statekeeper");
        Self {
            queued: meter
                .u64_counter("checkpoint_tasks_queued")
                .with_description("Tasks accepted by a checkpointing stage queue")
                .init(),
            dropped: meter
                .u64_counter("checkpoint_tasks_dropped")
                .with_description("Tasks rejected because a checkpointing stage queue was full")
                .init(),
            fetched: meter
                .u64_counter("checkpoint_fetched")
                .with_description("Checkpoint fetches that completed")
                .init(),
            fetch_failed: meter
                .u64_counter("checkpoint_fetch_failed")
                .with_description("Checkpoint fetches that failed or timed out")
                .init(),
            fetch_short_circuited: meter
                .u64_counter("checkpoint_fetch_short_circuited")
                .with_description("Checkpoint fetches skipped while fetching was disabled")
                .init(),
            serialize_duration: meter
                .f64_histogram("checkpoint_serialize_duration_seconds")
                .with_description("Time spent snapshotting actor state, lock wait included")
                .init(),
            store_duration: meter
                .f64_histogram("checkpoint_store_duration_seconds")
                .with_description("Time spent handing checkpoint bytes to the storage backend")
                .init(),
        }
    }

    pub(crate) fn queued(&self, stage: Stage) {
        self.queued.add(1, &stage.label());
    }

    pub(crate) fn dropped(&self, stage: Stage) {
        self.dropped.add(1, &stage.label());
    }

    pub(crate) fn fetched(&self) {
        self.fetched.add(1, &[]);
    }

    pub(crate) fn fetch_failed(&self) {
        self.fetch_failed.add(1, &[]);
    }

    pub(crate) fn fetch_short_circuited(&self) {
        self.fetch_short_circuited.add(1, &[]);
    }
}

#[test]
fn metrics_initialize() {
    assert!(initialize_metrics().is_ok());
    let metrics = CheckpointMetrics::new();
    metrics.queued(Stage::Serialization);
    metrics.dropped(Stage::Storage);
    metrics.fetched();
    with_timer!(metrics.serialize_duration, [], ());
}
