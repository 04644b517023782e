//! Elastic worker pool.
//!
//! Tasks go through a bounded queue; `schedule` blocks while the queue is
//! full, which is how backpressure reaches the shard consumers. Workers are
//! spawned on demand up to `max_workers` and exit after sitting idle for
//! `idle_timeout`.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace};

/// Unit of work run on a pool thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    receiver: Receiver<Task>,
    workers: AtomicUsize,
    idle: AtomicUsize,
    max_workers: usize,
    idle_timeout: Duration,
    next_id: AtomicUsize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Reserve a worker slot if the pool is below its maximum.
    fn reserve(&self) -> bool {
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_workers).then_some(n + 1)
            })
            .is_ok()
    }
}

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Task>>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, queue_capacity: usize, idle_timeout: Duration) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(queue_capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            shared: Arc::new(Shared {
                receiver,
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                max_workers: max_workers.max(1),
                idle_timeout,
                next_id: AtomicUsize::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queue a task, blocking while the queue is full.
    pub fn schedule<F>(&self, task: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().clone().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "worker pool is shut down")
        })?;

        if self.shared.idle.load(Ordering::SeqCst) == 0 {
            self.spawn_worker()?;
        }

        sender.send(Box::new(task)).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "worker pool is shut down")
        })?;

        // Every worker may have timed out while we were blocked.
        if self.shared.workers.load(Ordering::SeqCst) == 0 {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// Live worker threads.
    pub fn workers(&self) -> usize {
        self.shared.workers.load(Ordering::SeqCst)
    }

    /// Workers waiting for a task.
    pub fn idle(&self) -> usize {
        self.shared.idle.load(Ordering::SeqCst)
    }

    /// Tasks waiting in the queue.
    pub fn queued(&self) -> usize {
        self.shared.receiver.len()
    }

    /// Close the queue and wait for workers to finish what is queued.
    pub fn shutdown(&self) {
        self.sender.lock().take();

        let handles = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        debug!("Worker pool stopped");
    }

    fn spawn_worker(&self) -> io::Result<()> {
        if !self.shared.reserve() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let worker_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("worker-{worker_id}"))
            .spawn(move || worker_loop(worker_id, &shared));

        match spawned {
            Ok(handle) => {
                let mut handles = self.shared.handles.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.workers.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

fn worker_loop(worker_id: usize, shared: &Shared) {
    trace!(worker = worker_id, "Worker started");

    loop {
        shared.idle.fetch_add(1, Ordering::SeqCst);
        let received = shared.receiver.recv_timeout(shared.idle_timeout);
        shared.idle.fetch_sub(1, Ordering::SeqCst);

        match received {
            Ok(task) => run_task(worker_id, task),
            Err(RecvTimeoutError::Timeout) => {
                shared.workers.fetch_sub(1, Ordering::SeqCst);
                // A task may have been queued after the scheduler saw us alive.
                if !shared.receiver.is_empty() && shared.reserve() {
                    continue;
                }
                trace!(worker = worker_id, "Idle worker exiting");
                return;
            }
            Err(RecvTimeoutError::Disconnected) => {
                shared.workers.fetch_sub(1, Ordering::SeqCst);
                trace!(worker = worker_id, "Worker stopped");
                return;
            }
        }
    }
}

fn run_task(worker_id: usize, task: Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let msg = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(worker = worker_id, panic = %msg, "Task panicked");
    }
}
