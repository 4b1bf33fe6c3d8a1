//! Single-shot reporting of checkpoint save results.
//!
//! [`storage_callback`] creates a connected pair: the
//! [`StorageCallback`] travels down the save pipeline, the
//! [`CheckpointHandle`] stays with whoever asked for the checkpoint.
//! Completing the callback consumes it, so it can only ever report
//! once. A callback dropped without reporting resolves the handle as
//! a failure, so the handle always resolves exactly once.

use std::fmt;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use crossbeam_channel::Receiver;
use crossbeam_channel::RecvTimeoutError;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;

use crate::identity::ActorIdentity;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StorageResultCode {
    Success,
    Failure,
}

/// Outcome of one checkpoint save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageResult {
    pub identity: ActorIdentity,
    pub code: StorageResultCode,
    pub message: String,
    pub completed_at: DateTime<Utc>,
}

impl StorageResult {
    pub fn is_success(&self) -> bool {
        self.code == StorageResultCode::Success
    }
}

impl fmt::Display for StorageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} for {} at {}: {}",
            self.code,
            self.identity,
            self.completed_at.to_rfc3339(),
            self.message
        )
    }
}

/// Create a connected callback and handle for one checkpoint of
/// `identity`.
pub fn storage_callback(identity: ActorIdentity) -> (StorageCallback, CheckpointHandle) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let callback = StorageCallback {
        identity: identity.clone(),
        tx: Some(tx),
    };
    let handle = CheckpointHandle {
        identity,
        rx,
        result: None,
    };
    (callback, handle)
}

/// Reports the result of storing exactly one checkpoint.
///
/// Passed by value to the storage backend, which must call
/// [`StorageCallback::success`] or [`StorageCallback::failure`].
#[derive(Debug)]
pub struct StorageCallback {
    identity: ActorIdentity,
    tx: Option<Sender<StorageResult>>,
}

impl StorageCallback {
    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    pub fn success(self, message: impl Into<String>) {
        self.complete(StorageResultCode::Success, message.into());
    }

    pub fn failure(self, message: impl Into<String>) {
        self.complete(StorageResultCode::Failure, message.into());
    }

    pub fn complete(mut self, code: StorageResultCode, message: String) {
        self.report(code, message);
    }

    fn report(&mut self, code: StorageResultCode, message: String) {
        if let Some(tx) = self.tx.take() {
            let result = StorageResult {
                identity: self.identity.clone(),
                code,
                message,
                completed_at: Utc::now(),
            };
            match result.code {
                StorageResultCode::Success => tracing::debug!("Checkpoint stored: {result}"),
                StorageResultCode::Failure => tracing::warn!("Checkpoint not stored: {result}"),
            }
            // Nobody waiting on the handle is fine.
            let _ = tx.send(result);
        }
    }
}

impl Drop for StorageCallback {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.report(
                StorageResultCode::Failure,
                "storage callback dropped without a result".to_string(),
            );
        }
    }
}

/// The caller's side of a checkpoint save.
#[derive(Debug)]
pub struct CheckpointHandle {
    identity: ActorIdentity,
    rx: Receiver<StorageResult>,
    result: Option<StorageResult>,
}

impl CheckpointHandle {
    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    /// The result, if the save already finished.
    pub fn try_result(&mut self) -> Option<&StorageResult> {
        if self.result.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.result = Some(result),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.result = Some(self.lost()),
            }
        }
        self.result.as_ref()
    }

    /// Block until the save finishes.
    pub fn wait(mut self) -> StorageResult {
        if let Some(result) = self.result.take() {
            return result;
        }
        self.rx.recv().unwrap_or_else(|_| self.lost())
    }

    /// Block until the save finishes or `timeout` elapses, in which
    /// case the handle is given back.
    pub fn wait_timeout(mut self, timeout: Duration) -> Result<StorageResult, Self> {
        if let Some(result) = self.result.take() {
            return Ok(result);
        }
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(self.lost()),
        }
    }

    fn lost(&self) -> StorageResult {
        StorageResult {
            identity: self.identity.clone(),
            code: StorageResultCode::Failure,
            message: "storage callback lost".to_string(),
            completed_at: Utc::now(),
        }
    }
}

#[test]
fn success_reaches_handle() {
    let id = ActorIdentity::new("Counter", "k1");
    let (callback, handle) = storage_callback(id.clone());
    callback.success("stored");
    let found = handle.wait();
    assert!(found.is_success());
    assert_eq!(found.identity, id);
    assert_eq!(found.message, "stored");
}

#[test]
fn dropped_callback_reports_failure() {
    let (callback, handle) = storage_callback(ActorIdentity::new("Counter", "k1"));
    drop(callback);
    let found = handle.wait_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(found.code, StorageResultCode::Failure);
    assert!(found.message.contains("dropped"));
}

#[test]
fn pending_handle_times_out_and_comes_back() {
    let (callback, handle) = storage_callback(ActorIdentity::new("Counter", "k1"));
    let mut handle = handle.wait_timeout(Duration::from_millis(10)).unwrap_err();
    assert!(handle.try_result().is_none());

    std::thread::spawn(move || callback.failure("disk full"))
        .join()
        .unwrap();
    let found = handle.try_result().cloned().unwrap();
    assert_eq!(found.code, StorageResultCode::Failure);
    assert_eq!(handle.wait().message, "disk full");
}

#[test]
fn completing_after_handle_dropped_is_fine() {
    let (callback, handle) = storage_callback(ActorIdentity::new("Counter", "k1"));
    drop(handle);
    callback.success("nobody listens");
}
