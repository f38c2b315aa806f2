use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::{Task, TimerId};
use crate::error::{HostError, HostResult};
use crate::priority::ThreadKind;

type Dispatch = Box<dyn Fn(ThreadKind, Task) + Send + Sync>;

struct Timers {
    by_deadline: BTreeMap<(Instant, u64), (ThreadKind, Task)>,
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    timers: Mutex<Timers>,
    changed: Condvar,
}

/// A single thread that hands tasks to their target thread once their
/// deadline passes.
///
/// The task itself never runs on the timer thread; it is passed to the
/// dispatch callback given to [`TimerThread::new`].
pub struct TimerThread {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    pub fn new(
        name: impl Into<String>,
        dispatch: impl Fn(ThreadKind, Task) + Send + Sync + 'static,
    ) -> HostResult<Self> {
        let shared = Arc::new(TimerShared {
            timers: Mutex::new(Timers {
                by_deadline: BTreeMap::new(),
                deadlines: HashMap::new(),
                next_id: 1,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let name = name.into();
        let thread_shared = shared.clone();
        let dispatch: Dispatch = Box::new(dispatch);
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || timer_loop(&thread_shared, &dispatch))
            .map_err(|source| HostError::ThreadSpawn { name, source })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Schedules `task` to be dispatched to `thread` at `deadline`.
    pub fn schedule(&self, deadline: Instant, thread: ThreadKind, task: Task) -> TimerId {
        let mut timers = self.shared.timers.lock();
        let id = timers.next_id;
        timers.next_id += 1;
        timers.by_deadline.insert((deadline, id), (thread, task));
        timers.deadlines.insert(id, deadline);
        drop(timers);
        self.shared.changed.notify_one();
        TimerId::from_raw(id)
    }

    /// Removes a timer that has not been dispatched yet.
    pub fn cancel(&self, timer: TimerId) -> bool {
        let mut timers = self.shared.timers.lock();
        let Some(deadline) = timers.deadlines.remove(&timer.raw()) else {
            return false;
        };
        timers.by_deadline.remove(&(deadline, timer.raw())).is_some()
    }

    /// Number of timers not dispatched yet.
    pub fn pending_count(&self) -> usize {
        self.shared.timers.lock().deadlines.len()
    }

    /// Stops the thread. Pending timers are dropped without running.
    pub fn shutdown(&self) {
        let dropped = {
            let mut timers = self.shared.timers.lock();
            timers.shutdown = true;
            timers.deadlines.clear();
            std::mem::take(&mut timers.by_deadline)
        };
        if !dropped.is_empty() {
            log::debug!("Timer thread stopping with {} pending timers", dropped.len());
        }
        drop(dropped);
        self.shared.changed.notify_all();

        if let Some(thread) = self.thread.lock().take()
            && thread.thread().id() != std::thread::current().id()
            && thread.join().is_err()
        {
            log::error!("Timer thread exited with a panic");
        }
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: &TimerShared, dispatch: &Dispatch) {
    let mut timers = shared.timers.lock();
    loop {
        if timers.shutdown {
            return;
        }
        let Some((&(deadline, id), _)) = timers.by_deadline.first_key_value() else {
            shared.changed.wait(&mut timers);
            continue;
        };
        if Instant::now() < deadline {
            shared.changed.wait_until(&mut timers, deadline);
            continue;
        }
        let Some((thread, task)) = timers.by_deadline.remove(&(deadline, id)) else {
            continue;
        };
        timers.deadlines.remove(&id);

        // Dispatch may take other locks.
        drop(timers);
        dispatch(thread, task);
        timers = shared.timers.lock();
    }
}
