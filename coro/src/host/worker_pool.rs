use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use super::Task;
use crate::error::{HostError, HostResult};
use crate::priority::Priority;
use crate::promise::panic_message;

/// A task waiting in the pool.
struct PendingTask {
    priority: Priority,
    /// Insertion order for stable ordering within the same priority.
    id: u64,
    task: Task,
}

struct Queue {
    tasks: Vec<PendingTask>,
    next_id: u64,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl PoolShared {
    /// Blocks until a task is available; `None` once shut down and drained.
    fn next_task(&self) -> Option<Task> {
        let mut queue = self.queue.lock();
        loop {
            // Highest priority, lowest id.
            let best = queue
                .tasks
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)))
                .map(|(i, _)| i);
            if let Some(index) = best {
                return Some(queue.tasks.swap_remove(index).task);
            }
            if queue.shutdown {
                return None;
            }
            self.available.wait(&mut queue);
        }
    }
}

/// Persistent worker threads running prioritized tasks.
///
/// Tasks never block the pool from shutting down: on drop, queued tasks
/// still run, then the workers exit and are joined.
///
/// # Example
///
/// ```
/// use redlilium_coro::{Priority, WorkerPool};
/// use std::sync::mpsc;
///
/// let pool = WorkerPool::new(2, "example").unwrap();
/// let (tx, rx) = mpsc::channel();
/// pool.submit(Priority::Low, Box::new(move || tx.send(7u32).unwrap()));
/// assert_eq!(rx.recv().unwrap(), 7);
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `threads` workers (at least one) named `{prefix}-worker-{n}`.
    pub fn new(threads: usize, prefix: &str) -> HostResult<Self> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(Queue {
                tasks: Vec::new(),
                next_id: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let mut workers = Vec::new();
        for index in 0..threads.max(1) {
            let name = format!("{prefix}-worker-{index}");
            let worker_shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&worker_shared))
                .map_err(|source| HostError::ThreadSpawn { name, source })?;
            workers.push(handle);
        }
        log::debug!("Started worker pool with {} threads", workers.len());

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queues `task`. Higher priorities run first, FIFO within a priority.
    pub fn submit(&self, priority: Priority, task: Task) {
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            log::warn!("Dropping task submitted to a stopped worker pool");
            return;
        }
        let id = queue.next_id;
        queue.next_id += 1;
        queue.tasks.push(PendingTask { priority, id, task });
        drop(queue);
        self.shared.available.notify_one();
    }

    pub fn thread_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Number of queued tasks not yet picked up by a worker.
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().tasks.len()
    }

    /// Stops accepting tasks, drains the queue and joins the workers.
    pub fn shutdown(&self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();

        let current = std::thread::current().id();
        for worker in self.workers.lock().drain(..) {
            if worker.thread().id() == current {
                // Last reference dropped from inside a task.
                continue;
            }
            if worker.join().is_err() {
                log::error!("Worker thread exited with a panic");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    while let Some(task) = shared.next_task() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            log::error!("Worker task panicked: {}", panic_message(payload.as_ref()));
        }
    }
}
