//! Checkpointing configuration.
//!
//! Every option has a default, so an empty JSON object is a valid
//! config. Durations are given in milliseconds.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointingConfig {
    /// Capacity of the serialize stage queue. The serialize stage
    /// always runs a single worker so snapshots happen in submission
    /// order.
    pub serialization_max_outstanding_requests: usize,
    pub storage_max_threads: usize,
    pub storage_max_outstanding_requests: usize,
    /// How long a store task waits for its snapshot. Unbounded when
    /// unset.
    pub storage_upstream_max_wait_ms: Option<u64>,
    pub fetching_max_threads: usize,
    pub fetching_queue_size: usize,
    pub fetching_max_wait_ms: u64,
    pub fetching_max_consecutive_failures_before_disabling: u32,
    pub fetching_disabled_duration_ms: u64,
    /// Longest the processing thread waits on an in-flight
    /// serialization before overriding it. Also the slice the
    /// serialization side waits between retries.
    pub max_serialization_lock_time_ms: u64,
    /// Retries allowed on the serialization side. Unbounded when
    /// unset.
    pub serialization_max_lock_retries: Option<u32>,
    /// Sweep idle actor locks once the registry holds more than this
    /// many.
    pub lock_sweep_threshold: usize,
}

impl Default for CheckpointingConfig {
    fn default() -> Self {
        Self {
            serialization_max_outstanding_requests: 1000,
            storage_max_threads: 1,
            storage_max_outstanding_requests: 1000,
            storage_upstream_max_wait_ms: None,
            fetching_max_threads: 1,
            fetching_queue_size: 100,
            fetching_max_wait_ms: 1000,
            fetching_max_consecutive_failures_before_disabling: 10,
            fetching_disabled_duration_ms: 600_000,
            max_serialization_lock_time_ms: 1000,
            serialization_max_lock_retries: None,
            lock_sweep_threshold: 10_000,
        }
    }
}

impl CheckpointingConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            (
                "serialization_max_outstanding_requests",
                self.serialization_max_outstanding_requests,
            ),
            ("storage_max_threads", self.storage_max_threads),
            (
                "storage_max_outstanding_requests",
                self.storage_max_outstanding_requests,
            ),
            ("fetching_max_threads", self.fetching_max_threads),
            ("fetching_queue_size", self.fetching_queue_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.fetching_max_consecutive_failures_before_disabling == 0 {
            return Err(ConfigError::Invalid(
                "fetching_max_consecutive_failures_before_disabling must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn max_lock_wait(&self) -> Duration {
        Duration::from_millis(self.max_serialization_lock_time_ms)
    }

    pub(crate) fn fetching_max_wait(&self) -> Duration {
        Duration::from_millis(self.fetching_max_wait_ms)
    }

    pub(crate) fn fetching_disabled_duration(&self) -> Duration {
        Duration::from_millis(self.fetching_disabled_duration_ms)
    }

    pub(crate) fn storage_upstream_max_wait(&self) -> Option<Duration> {
        self.storage_upstream_max_wait_ms.map(Duration::from_millis)
    }
}

#[test]
fn empty_json_is_defaults() {
    let found = CheckpointingConfig::from_json("{}").unwrap();
    assert_eq!(found, CheckpointingConfig::default());
}

#[test]
fn json_overrides_selected_fields() {
    let found = CheckpointingConfig::from_json(
        r#"{"fetching_max_wait_ms": 250, "storage_max_threads": 4, "storage_upstream_max_wait_ms": 5000}"#,
    )
    .unwrap();
    assert_eq!(found.fetching_max_wait(), Duration::from_millis(250));
    assert_eq!(found.storage_max_threads, 4);
    assert_eq!(
        found.storage_upstream_max_wait(),
        Some(Duration::from_secs(5))
    );
    assert_eq!(found.fetching_queue_size, 100);
}

#[test]
fn unknown_fields_are_rejected() {
    let found = CheckpointingConfig::from_json(r#"{"fetch_wait": 1}"#);
    assert!(matches!(found, Err(ConfigError::Parse(_))));
}

#[test]
fn zero_capacity_is_invalid() {
    let found = CheckpointingConfig::from_json(r#"{"fetching_queue_size": 0}"#);
    assert!(matches!(found, Err(ConfigError::Invalid(_))));
}

#[test]
fn zero_threshold_is_invalid() {
    let found = CheckpointingConfig::from_json(
        r#"{"fetching_max_consecutive_failures_before_disabling": 0}"#,
    );
    assert!(matches!(found, Err(ConfigError::Invalid(_))));
}

#[test]
fn config_loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpointing.json");
    fs::write(&path, r#"{"lock_sweep_threshold": 12}"#).unwrap();
    let found = CheckpointingConfig::from_path(&path).unwrap();
    assert_eq!(found.lock_sweep_threshold, 12);
}
