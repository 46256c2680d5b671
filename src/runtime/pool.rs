//! Bounded pool of worker threads for connection tasks.
//!
//! A fixed number of workers take tasks from a shared queue; when every
//! worker is busy, new tasks wait in the queue. Each running task is
//! registered with its cancellation token so the pool can stop them all.

use crate::runtime::CancelToken;
use crossbeam::channel::{self, Receiver, Sender};
use slab::Slab;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Task {
    cancel: CancelToken,
    job: Job,
}

/// The pool no longer accepts tasks.
#[derive(Debug, Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Cancellation tokens of the tasks currently running.
///
/// Slab slots give O(1) insert and remove as tasks start and finish.
#[derive(Default)]
struct TaskRegistry {
    running: Slab<CancelToken>,
    /// Set by `shutdown_now`: queued tasks are dropped instead of run.
    discard_queued: bool,
}

impl TaskRegistry {
    fn insert(&mut self, cancel: CancelToken) -> Option<usize> {
        if self.discard_queued {
            return None;
        }
        Some(self.running.insert(cancel))
    }

    fn remove(&mut self, key: usize) {
        if self.running.contains(key) {
            self.running.remove(key);
        }
    }

    fn cancel_all(&mut self) -> usize {
        self.discard_queued = true;
        for (_, token) in self.running.iter() {
            token.cancel();
        }
        self.running.len()
    }
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    registry: Arc<Mutex<TaskRegistry>>,
    size: usize,
}

impl WorkerPool {
    /// Start `size` workers (at least one).
    pub fn new(size: usize) -> std::io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = channel::unbounded::<Task>();
        let registry = Arc::new(Mutex::new(TaskRegistry::default()));

        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let receiver = receiver.clone();
            let registry = Arc::clone(&registry);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, receiver, registry))?;
            workers.push(handle);
        }

        info!(workers = size, "Worker pool started");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            registry,
            size,
        })
    }

    /// Queue a task. `cancel` is signalled if the pool is stopped while the
    /// task runs.
    pub fn execute<F>(&self, cancel: CancelToken, job: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = lock(&self.sender);
        let sender = sender.as_ref().ok_or(PoolClosed)?;
        sender
            .send(Task {
                cancel,
                job: Box::new(job),
            })
            .map_err(|_| PoolClosed)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tasks currently running.
    pub fn active(&self) -> usize {
        lock(&self.registry).running.len()
    }

    /// Stop taking tasks, let queued and running tasks finish, join workers.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        self.join_workers();
        info!("Worker pool shut down");
    }

    /// Cancel running tasks, drop queued ones, join workers.
    pub fn shutdown_now(&self) {
        lock(&self.sender).take();
        let cancelled = lock(&self.registry).cancel_all();
        debug!(cancelled, "Cancelled running tasks");
        self.join_workers();
        info!("Worker pool shut down immediately");
    }

    fn join_workers(&self) {
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
    }
}

fn worker_loop(worker_id: usize, receiver: Receiver<Task>, registry: Arc<Mutex<TaskRegistry>>) {
    while let Ok(task) = receiver.recv() {
        let Some(key) = lock(&registry).insert(task.cancel.clone()) else {
            debug!(worker = worker_id, "Dropping queued task during shutdown");
            continue;
        };

        if panic::catch_unwind(AssertUnwindSafe(task.job)).is_err() {
            error!(worker = worker_id, "Connection task panicked");
        }

        lock(&registry).remove(key);
    }
    debug!(worker = worker_id, "Worker exiting");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
