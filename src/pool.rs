//! Fixed-size worker pools fed by bounded queues.
//!
//! Submitting never blocks: when the queue is full the task is handed
//! straight back to the caller, which decides how to report the
//! rejection. Each worker is a named OS thread, so log lines and
//! panics can be attributed to a stage.

use std::any::Any;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;

use crate::errors::prepend_tname;

/// A unit of work run by a [`WorkerPool`].
pub(crate) trait Task: Send + 'static {
    fn run(self);
}

/// Why a task was handed back by [`WorkerPool::try_submit`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Rejection {
    QueueFull,
    ShutDown,
}

pub(crate) struct WorkerPool<T: Task> {
    name: &'static str,
    capacity: usize,
    tx: Option<Sender<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Task> WorkerPool<T> {
    /// Spawn `threads` workers named `checkpointing-{name}-{n}` that
    /// pull from a queue of `capacity` pending tasks.
    pub(crate) fn new(name: &'static str, threads: usize, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let workers = (0..threads)
            .map(|n| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("checkpointing-{name}-{n}"))
                    .spawn(move || worker_main(name, rx))
            })
            .collect::<std::io::Result<Vec<_>>>()?;
        tracing::debug!(
            "Started checkpointing {name} pool with {threads} threads and queue capacity {capacity}"
        );
        Ok(Self {
            name,
            capacity,
            tx: Some(tx),
            workers,
        })
    }

    pub(crate) fn try_submit(&self, task: T) -> Result<(), (Rejection, T)> {
        match &self.tx {
            Some(tx) => tx.try_send(task).map_err(|err| match err {
                TrySendError::Full(task) => (Rejection::QueueFull, task),
                TrySendError::Disconnected(task) => (Rejection::ShutDown, task),
            }),
            None => Err((Rejection::ShutDown, task)),
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks waiting in the queue, not counting ones being run.
    pub(crate) fn queued(&self) -> usize {
        self.tx.as_ref().map_or(0, |tx| tx.len())
    }

    /// Stop accepting tasks, let the workers drain the queue, and wait
    /// for them.
    pub(crate) fn shutdown(&mut self) {
        if self.tx.take().is_none() {
            return;
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Checkpointing {} worker died", self.name);
            }
        }
        tracing::debug!("Stopped checkpointing {} pool", self.name);
    }
}

impl<T: Task> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_main<T: Task>(name: &'static str, rx: Receiver<T>) {
    while let Ok(task) = rx.recv() {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task.run())) {
            let msg = panic_message(&*panic);
            tracing::error!(
                "{}",
                prepend_tname(format!("Cannot execute checkpointing {name} operation: {msg}"))
            );
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
struct FnTask(Box<dyn FnOnce() + Send>);

#[cfg(test)]
impl Task for FnTask {
    fn run(self) {
        (self.0)()
    }
}

#[cfg(test)]
fn fn_task(f: impl FnOnce() + Send + 'static) -> FnTask {
    FnTask(Box::new(f))
}

#[cfg(test)]
fn submit(pool: &WorkerPool<FnTask>, f: impl FnOnce() + Send + 'static) {
    pool.try_submit(fn_task(f))
        .map_err(|(rejection, _)| rejection)
        .unwrap();
}

#[test]
fn tasks_run_on_named_threads() {
    let pool = WorkerPool::new("test", 1, 4).unwrap();
    let (tx, rx) = crossbeam_channel::bounded(1);
    submit(&pool, move || {
        tx.send(std::thread::current().name().map(String::from))
            .unwrap()
    });
    let found = rx
        .recv_timeout(std::time::Duration::from_secs(1))
        .unwrap();
    assert_eq!(found.as_deref(), Some("checkpointing-test-0"));
}

#[test]
fn full_queue_hands_task_back() {
    let pool = WorkerPool::new("test", 1, 1).unwrap();
    let (started_tx, started_rx) = crossbeam_channel::bounded(1);
    let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);

    // Occupy the only worker.
    submit(&pool, move || {
        started_tx.send(()).unwrap();
        let _ = gate_rx.recv();
    });
    started_rx
        .recv_timeout(std::time::Duration::from_secs(1))
        .unwrap();

    // Fill the queue.
    submit(&pool, || {});
    assert_eq!(pool.queued(), 1);

    let found = pool.try_submit(fn_task(|| {}));
    assert!(matches!(found, Err((Rejection::QueueFull, _))));
    assert_eq!(pool.capacity(), 1);
    assert_eq!(pool.name(), "test");

    drop(gate_tx);
}

#[test]
fn panicking_task_does_not_kill_worker() {
    let pool = WorkerPool::new("test", 1, 4).unwrap();
    submit(&pool, || panic!("boom"));
    let (tx, rx) = crossbeam_channel::bounded(1);
    submit(&pool, move || tx.send(()).unwrap());
    assert!(rx.recv_timeout(std::time::Duration::from_secs(1)).is_ok());
}

#[test]
fn shutdown_drains_queue_then_rejects() {
    let mut pool = WorkerPool::new("test", 2, 8).unwrap();
    let (tx, rx) = crossbeam_channel::unbounded();
    for i in 0..5 {
        let tx = tx.clone();
        submit(&pool, move || tx.send(i).unwrap());
    }
    pool.shutdown();
    drop(tx);
    assert_eq!(rx.iter().count(), 5);

    let found = pool.try_submit(fn_task(|| {}));
    assert!(matches!(found, Err((Rejection::ShutDown, _))));
}
