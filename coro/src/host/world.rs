use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{Environment, Host, Task, TimerId, TimerThread, WorkerPool};
use crate::config::HostConfig;
use crate::error::HostResult;
use crate::io::IoRuntime;
use crate::latent_action::{
    LatentActionManager, LatentInfo, LatentResponse, ObjectId, PendingLatentAction,
};
use crate::priority::{Priority, ThreadKind};

const SYSTEM_OWNER: ObjectId = ObjectId::from_raw(0);

/// Tasks waiting for the game thread.
struct GameQueue {
    tasks: Mutex<Vec<Task>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl GameQueue {
    fn push(&self, task: Task) {
        if self.closed.load(Ordering::Acquire) {
            log::trace!("Dropping game thread task submitted after shutdown");
            return;
        }
        self.tasks.lock().push(task);
        self.ready.notify_all();
    }

    /// Runs queued tasks, including ones queued while running, until the
    /// queue stays empty.
    fn run(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch = std::mem::take(&mut *self.tasks.lock());
            if batch.is_empty() {
                return ran;
            }
            for task in batch {
                task();
                ran += 1;
            }
        }
    }

    fn wait_until(&self, deadline: Instant) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            self.ready.wait_until(&mut tasks, deadline);
        }
    }
}

struct ActionEntry {
    info: LatentInfo,
    action: Box<dyn PendingLatentAction>,
}

struct WorldShared {
    config: HostConfig,
    game_thread: ThreadId,
    game: Arc<GameQueue>,
    pool: Arc<WorkerPool>,
    timer: TimerThread,
    actions: Mutex<Vec<ActionEntry>>,
    keys: Mutex<HashSet<LatentInfo>>,
    objects: Mutex<HashSet<ObjectId>>,
    aborting: Mutex<HashSet<ObjectId>>,
    updating: AtomicBool,
    next_object: AtomicU64,
    next_uuid: AtomicI32,
    frame: AtomicU64,
    time_bits: AtomicU64,
    fired_links: AtomicUsize,
    shut_down: AtomicBool,
}

impl WorldShared {
    fn assert_game_thread(&self, what: &str) {
        assert!(
            self.is_game_thread(),
            "World::{what} must be called on the game thread"
        );
    }

    fn update_actions(&self) {
        let current = std::mem::take(&mut *self.actions.lock());
        self.updating.store(true, Ordering::Release);

        let mut kept = Vec::with_capacity(current.len());
        for mut entry in current {
            let owner = entry.info.owner;
            if !self.is_valid(owner) || self.aborting.lock().contains(&owner) {
                // Removed below with the proper notification.
                kept.push(entry);
                continue;
            }
            match entry.action.update(self) {
                LatentResponse::KeepWaiting => kept.push(entry),
                response => {
                    if response == LatentResponse::FinishedFireContinuation {
                        self.fired_links.fetch_add(1, Ordering::Relaxed);
                    }
                    log::trace!("Latent action {:?} finished with {response:?}", entry.info);
                    self.keys.lock().remove(&entry.info);
                    drop(entry);
                }
            }
        }

        self.updating.store(false, Ordering::Release);
        {
            let mut actions = self.actions.lock();
            kept.append(&mut *actions);
            *actions = kept;
        }
        self.process_removals();
    }

    /// Removes actions whose owner died or was marked for abortion.
    fn process_removals(&self) {
        let aborting = std::mem::take(&mut *self.aborting.lock());
        let removed: Vec<ActionEntry> = {
            let mut actions = self.actions.lock();
            let (removed, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *actions).into_iter().partition(|entry| {
                    !self.is_valid(entry.info.owner) || aborting.contains(&entry.info.owner)
                });
            *actions = kept;
            removed
        };

        for mut entry in removed {
            if self.is_valid(entry.info.owner) {
                log::debug!("Aborting latent action {:?}", entry.info);
                entry.action.notify_aborted();
            } else {
                log::debug!("Owner of latent action {:?} destroyed", entry.info);
                entry.action.notify_owner_destroyed();
            }
            self.keys.lock().remove(&entry.info);
            drop(entry);
        }
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.is_game_thread() {
            log::warn!("World dropped off the game thread, latent teardown may not complete");
        }

        for _ in 0..self.config.shutdown_drain_rounds.max(1) {
            let actions = std::mem::take(&mut *self.actions.lock());
            let had_actions = !actions.is_empty();
            for mut entry in actions {
                entry.action.notify_aborted();
                self.keys.lock().remove(&entry.info);
                drop(entry);
            }
            let ran = self.game.run();
            if !had_actions && ran == 0 {
                break;
            }
        }

        self.timer.shutdown();
        self.pool.shutdown();
        self.game.run();
        self.game.closed.store(true, Ordering::Release);
        let leftover = std::mem::take(&mut *self.game.tasks.lock());
        if !leftover.is_empty() {
            log::debug!("Discarding {} game thread tasks at shutdown", leftover.len());
        }
        drop(leftover);
        log::debug!("World shut down");
    }
}

impl Environment for WorldShared {
    fn is_game_thread(&self) -> bool {
        thread::current().id() == self.game_thread
    }

    fn submit(&self, thread: ThreadKind, task: Task) {
        match thread {
            ThreadKind::Game => self.game.push(task),
            ThreadKind::Worker => self.pool.submit(Priority::High, task),
        }
    }

    fn submit_pooled(&self, priority: Priority, task: Task) {
        self.pool.submit(priority, task);
    }

    fn schedule_timer(&self, deadline: Instant, thread: ThreadKind, task: Task) -> TimerId {
        self.timer.schedule(deadline, thread, task)
    }

    fn cancel_timer(&self, timer: TimerId) -> bool {
        self.timer.cancel(timer)
    }

    fn latent(&self) -> Option<&dyn LatentActionManager> {
        Some(self)
    }
}

impl LatentActionManager for WorldShared {
    fn find_action(&self, info: LatentInfo) -> bool {
        self.keys.lock().contains(&info)
    }

    fn add_action(&self, info: LatentInfo, action: Box<dyn PendingLatentAction>) {
        self.assert_game_thread("add_action");
        self.keys.lock().insert(info);
        self.actions.lock().push(ActionEntry { info, action });
    }

    fn is_valid(&self, owner: ObjectId) -> bool {
        owner == SYSTEM_OWNER || self.objects.lock().contains(&owner)
    }

    fn next_uuid(&self) -> i32 {
        self.next_uuid.fetch_add(1, Ordering::Relaxed)
    }

    fn system_owner(&self) -> ObjectId {
        SYSTEM_OWNER
    }

    fn frame_counter(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    fn time_seconds(&self) -> f64 {
        f64::from_bits(self.time_bits.load(Ordering::Acquire))
    }
}

/// Reference host: a frame-ticked game thread, a worker pool, a timer
/// thread and a latent action manager.
///
/// The thread that creates the world is its game thread. Nothing runs on it
/// unless that thread calls [`tick`](Self::tick) or [`pump`](Self::pump).
///
/// # Example
///
/// ```
/// use redlilium_coro::{World, ticks};
///
/// let world = World::new().unwrap();
/// let actor = world.spawn_object();
/// let task = world.host().spawn_latent(actor, async {
///     ticks(2).await;
///     "done"
/// });
///
/// world.tick(1.0 / 60.0);
/// assert!(!task.is_done());
/// world.tick(1.0 / 60.0);
/// assert_eq!(task.result(), Ok("done"));
/// ```
pub struct World {
    shared: Arc<WorldShared>,
    io: Mutex<Option<IoRuntime>>,
}

impl World {
    /// Creates a world configured from [`HostConfig::from_env`].
    pub fn new() -> HostResult<Self> {
        Self::with_config(HostConfig::from_env())
    }

    pub fn with_config(config: HostConfig) -> HostResult<Self> {
        let game = Arc::new(GameQueue {
            tasks: Mutex::new(Vec::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        let pool = Arc::new(WorkerPool::new(
            config.effective_workers(),
            &config.thread_name_prefix,
        )?);

        let timer_game = game.clone();
        let timer_pool = Arc::downgrade(&pool);
        let timer = TimerThread::new(
            format!("{}-timer", config.thread_name_prefix),
            move |thread, task| match thread {
                ThreadKind::Game => timer_game.push(task),
                ThreadKind::Worker => {
                    if let Some(pool) = timer_pool.upgrade() {
                        pool.submit(Priority::High, task);
                    }
                }
            },
        )?;

        log::info!(
            "World created with {} workers and {} IO workers",
            pool.thread_count(),
            config.io_worker_threads
        );

        Ok(Self {
            shared: Arc::new(WorldShared {
                config,
                game_thread: thread::current().id(),
                game,
                pool,
                timer,
                actions: Mutex::new(Vec::new()),
                keys: Mutex::new(HashSet::new()),
                objects: Mutex::new(HashSet::new()),
                aborting: Mutex::new(HashSet::new()),
                updating: AtomicBool::new(false),
                next_object: AtomicU64::new(1),
                next_uuid: AtomicI32::new(1),
                frame: AtomicU64::new(0),
                time_bits: AtomicU64::new(0f64.to_bits()),
                fired_links: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
            io: Mutex::new(None),
        })
    }

    /// Handle for starting coroutines on this world.
    pub fn host(&self) -> Host {
        Host::new(self.shared.clone())
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// The world's IO runtime, started on first use.
    pub fn io(&self) -> HostResult<IoRuntime> {
        let mut io = self.io.lock();
        if let Some(runtime) = io.as_ref() {
            return Ok(runtime.clone());
        }
        let runtime = IoRuntime::new(&self.shared.config)?;
        *io = Some(runtime.clone());
        Ok(runtime)
    }

    /// Advances one frame: bumps the frame counter and world time, runs
    /// queued game thread tasks and ticks every latent action once.
    pub fn tick(&self, delta_seconds: f64) {
        self.shared.assert_game_thread("tick");
        let frame = self.shared.frame.fetch_add(1, Ordering::AcqRel) + 1;
        let time = self.shared.time_seconds() + delta_seconds;
        self.shared.time_bits.store(time.to_bits(), Ordering::Release);
        log::trace!("Tick {frame} at {time:.3}s");

        self.shared.game.run();
        self.shared.update_actions();
        self.shared.game.run();
    }

    /// Ticks until `done` returns `true` or `max_ticks` frames elapsed.
    pub fn tick_until(
        &self,
        delta_seconds: f64,
        max_ticks: usize,
        mut done: impl FnMut() -> bool,
    ) -> bool {
        for _ in 0..max_ticks {
            if done() {
                return true;
            }
            self.tick(delta_seconds);
        }
        done()
    }

    /// Runs queued game thread tasks without advancing the frame.
    pub fn pump(&self) -> usize {
        self.shared.assert_game_thread("pump");
        self.shared.game.run()
    }

    /// Pumps the game thread until `done` returns `true` or `timeout`
    /// elapses, sleeping while nothing is queued.
    pub fn pump_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared
                .game
                .wait_until(deadline.min(now + Duration::from_millis(1)));
        }
    }

    /// Creates a new object that can own latent actions.
    pub fn spawn_object(&self) -> ObjectId {
        let id = ObjectId::from_raw(self.shared.next_object.fetch_add(1, Ordering::Relaxed));
        self.shared.objects.lock().insert(id);
        id
    }

    /// Destroys an object. Its latent actions are notified and dropped.
    pub fn destroy_object(&self, object: ObjectId) {
        self.shared.assert_game_thread("destroy_object");
        assert!(object != SYSTEM_OWNER, "The system owner cannot be destroyed");
        if !self.shared.objects.lock().remove(&object) {
            return;
        }
        log::debug!("Destroying {object:?}");
        if !self.shared.updating.load(Ordering::Acquire) {
            self.shared.process_removals();
        }
    }

    /// Forcibly removes every latent action owned by `owner`.
    pub fn abort_actions(&self, owner: ObjectId) {
        self.shared.assert_game_thread("abort_actions");
        self.shared.aborting.lock().insert(owner);
        if !self.shared.updating.load(Ordering::Acquire) {
            self.shared.process_removals();
        }
    }

    pub fn is_valid(&self, object: ObjectId) -> bool {
        self.shared.is_valid(object)
    }

    /// Number of registered latent actions.
    pub fn action_count(&self) -> usize {
        self.shared.keys.lock().len()
    }

    /// Number of latent actions that finished with
    /// [`LatentResponse::FinishedFireContinuation`].
    pub fn fired_links(&self) -> usize {
        self.shared.fired_links.load(Ordering::Relaxed)
    }

    pub fn frame_counter(&self) -> u64 {
        self.shared.frame_counter()
    }

    pub fn time_seconds(&self) -> f64 {
        self.shared.time_seconds()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world() -> World {
        World::with_config(HostConfig::default().with_worker_threads(2)).unwrap()
    }

    struct Countdown {
        remaining: u32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl PendingLatentAction for Countdown {
        fn update(&mut self, _manager: &dyn LatentActionManager) -> LatentResponse {
            self.remaining -= 1;
            if self.remaining == 0 {
                LatentResponse::FinishedFireContinuation
            } else {
                LatentResponse::KeepWaiting
            }
        }

        fn notify_aborted(&mut self) {
            self.log.lock().push("aborted");
        }

        fn notify_owner_destroyed(&mut self) {
            self.log.lock().push("owner destroyed");
        }
    }

    fn countdown(remaining: u32) -> (Box<Countdown>, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Countdown {
                remaining,
                log: log.clone(),
            }),
            log,
        )
    }

    #[test]
    fn tick_advances_clock() {
        let world = world();
        world.tick(0.5);
        world.tick(0.25);
        assert_eq!(world.frame_counter(), 2);
        assert!((world.time_seconds() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn actions_tick_until_finished() {
        let world = world();
        let owner = world.spawn_object();
        let info = LatentInfo::new(owner, 1);
        let (action, _log) = countdown(2);
        world.shared.add_action(info, action);
        assert!(world.shared.find_action(info));

        world.tick(0.1);
        assert_eq!(world.action_count(), 1);
        world.tick(0.1);
        assert_eq!(world.action_count(), 0);
        assert!(!world.shared.find_action(info));
        assert_eq!(world.fired_links(), 1);
    }

    #[test]
    fn destroying_owner_notifies_actions() {
        let world = world();
        let owner = world.spawn_object();
        let (action, log) = countdown(5);
        world.shared.add_action(LatentInfo::new(owner, 1), action);

        world.destroy_object(owner);
        assert!(!world.is_valid(owner));
        assert_eq!(world.action_count(), 0);
        assert_eq!(*log.lock(), vec!["owner destroyed"]);
    }

    #[test]
    fn aborting_keeps_owner_alive() {
        let world = world();
        let owner = world.spawn_object();
        let (action, log) = countdown(5);
        world.shared.add_action(LatentInfo::new(owner, 1), action);

        world.abort_actions(owner);
        assert!(world.is_valid(owner));
        assert_eq!(world.action_count(), 0);
        assert_eq!(*log.lock(), vec!["aborted"]);
    }

    #[test]
    fn system_owner_is_always_valid() {
        let world = world();
        assert!(world.is_valid(world.shared.system_owner()));
    }

    #[test]
    fn submitted_game_tasks_run_on_pump() {
        let world = world();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = hits.clone();
        world.host().submit(ThreadKind::Game, move || {
            hits_in.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(world.pump(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timers_reach_the_game_thread() {
        let world = world();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_in = fired.clone();
        world.host().schedule_timer(
            Instant::now() + Duration::from_millis(5),
            ThreadKind::Game,
            move || fired_in.store(true, Ordering::SeqCst),
        );
        assert!(world.pump_until(Duration::from_secs(5), || fired.load(Ordering::SeqCst)));
    }

    #[test]
    fn io_runtime_starts_once() {
        let world = world();
        let io = world.io().unwrap();
        let again = world.io().unwrap();
        assert_eq!(io.run(async { 3u8 }).recv(), Some(3));
        assert_eq!(again.run(async { 4u8 }).recv(), Some(4));
    }
}
