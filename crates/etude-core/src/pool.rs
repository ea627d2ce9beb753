// src/pool.rs
//! Fixed-size pool of long-lived worker threads fed by a FIFO task queue.
//!
//! `submit` wakes exactly one idle worker. On shutdown every worker keeps
//! draining the queue until it is empty and then exits, so no queued task is
//! dropped and none runs twice.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    tasks: VecDeque<Task>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers named `etude-worker-{i}`.
    pub fn new(size: usize) -> std::io::Result<Self> {
        assert!(size > 0, "worker pool needs at least one thread");

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        });

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || worker_loop(i, shared))?;
            handles.push(handle);
        }

        debug!(workers = size, "worker pool started");
        Ok(Self {
            shared,
            handles: Mutex::new(handles),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queues `task` for execution. Returns `false` once the pool is shut down.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.lock();
            if state.closed {
                return false;
            }
            state.tasks.push_back(Box::new(task));
        }
        self.shared.available.notify_one();
        true
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    /// Stops accepting tasks, lets the workers drain the queue and joins them.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.shared.lock().closed = true;
        self.shared.available.notify_all();

        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for handle in handles {
            // A task that triggers shutdown must not join its own thread.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    let mut state = shared.lock();
    loop {
        if let Some(task) = state.tasks.pop_front() {
            drop(state);
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
                error!(worker = id, "task panicked");
            }
            state = shared.lock();
        } else if state.closed {
            break;
        } else {
            state = shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
    debug!(worker = id, "worker exiting");
}
