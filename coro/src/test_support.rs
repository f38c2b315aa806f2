//! Single-threaded environment for unit tests.
//!
//! Everything submitted (to any thread, to the pool, or as a timer) is
//! queued and only runs when the test calls [`ManualEnv::run_pending`] or
//! [`ManualEnv::fire_timers`]. The creating thread is the game thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Instant;

use parking_lot::Mutex;

use crate::host::{Environment, Host, Task, TimerId};
use crate::latent_action::LatentActionManager;
use crate::priority::{Priority, ThreadKind};

struct Shared {
    game_thread: ThreadId,
    queue: Mutex<Vec<Task>>,
    timers: Mutex<Vec<(TimerId, Instant, Task)>>,
    next_timer: AtomicU64,
}

impl Environment for Shared {
    fn is_game_thread(&self) -> bool {
        thread::current().id() == self.game_thread
    }

    fn submit(&self, _thread: ThreadKind, task: Task) {
        self.queue.lock().push(task);
    }

    fn submit_pooled(&self, _priority: Priority, task: Task) {
        self.queue.lock().push(task);
    }

    fn schedule_timer(&self, deadline: Instant, _thread: ThreadKind, task: Task) -> TimerId {
        let id = TimerId::from_raw(self.next_timer.fetch_add(1, Ordering::Relaxed));
        self.timers.lock().push((id, deadline, task));
        id
    }

    fn cancel_timer(&self, timer: TimerId) -> bool {
        let mut timers = self.timers.lock();
        let before = timers.len();
        timers.retain(|(id, _, _)| *id != timer);
        timers.len() != before
    }

    fn latent(&self) -> Option<&dyn LatentActionManager> {
        None
    }
}

pub(crate) struct ManualEnv {
    shared: Arc<Shared>,
}

impl ManualEnv {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                game_thread: thread::current().id(),
                queue: Mutex::new(Vec::new()),
                timers: Mutex::new(Vec::new()),
                next_timer: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn host(&self) -> Host {
        Host::new(self.shared.clone())
    }

    /// Runs queued tasks until the queue stays empty. Returns how many ran.
    pub(crate) fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = std::mem::take(&mut *self.shared.queue.lock());
            if batch.is_empty() {
                return ran;
            }
            for task in batch {
                task();
                ran += 1;
            }
        }
    }

    /// Runs every scheduled timer regardless of its deadline.
    pub(crate) fn fire_timers(&self) -> usize {
        let timers = std::mem::take(&mut *self.shared.timers.lock());
        let fired = timers.len();
        for (_, _, task) in timers {
            task();
        }
        fired
    }

    pub(crate) fn pending_timers(&self) -> usize {
        self.shared.timers.lock().len()
    }
}
