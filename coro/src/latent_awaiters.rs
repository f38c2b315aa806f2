//! Frame-ticked waits.
//!
//! All of these are driven by the host's [`LatentActionManager`]. A latent
//! coroutine awaiting them on the game thread installs the wait directly on
//! its own pending action and stays attached. Any other coroutine gets a
//! short-lived anonymous action, owned by the manager's system owner, that
//! resumes it once the wait completes; that bridge supports fast
//! cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::awaiter::{Awaiter, CancelableAwaiter, Suspension};
use crate::latent_action::{
    LatentActionManager, LatentInfo, LatentResponse, PendingLatentAction,
};
use crate::priority::ThreadKind;
use crate::promise::Promise;

type Predicate = Box<dyn FnMut() -> bool + Send>;

enum Condition {
    Frames(u64),
    Seconds(f64),
    UntilTime(f64),
    Until(Predicate),
}

/// A condition pinned to absolute frame or time values.
enum Target {
    Frame(u64),
    Time(f64),
    Until(Predicate),
}

impl Target {
    fn resolve(condition: Condition, manager: &dyn LatentActionManager) -> Self {
        match condition {
            Condition::Frames(frames) => Target::Frame(manager.frame_counter() + frames),
            Condition::Seconds(seconds) => Target::Time(manager.time_seconds() + seconds),
            Condition::UntilTime(time) => Target::Time(time),
            Condition::Until(predicate) => Target::Until(predicate),
        }
    }

    /// Checks the target. Predicates only run on the game thread.
    fn reached(&mut self, manager: &dyn LatentActionManager, on_game_thread: bool) -> bool {
        match self {
            Target::Frame(frame) => manager.frame_counter() >= *frame,
            Target::Time(time) => manager.time_seconds() >= *time,
            Target::Until(predicate) => on_game_thread && predicate(),
        }
    }
}

/// Awaiter behind the latent wait functions.
pub struct LatentWait {
    condition: Option<Condition>,
    target: Option<Target>,
    attached: bool,
}

impl LatentWait {
    fn new(condition: Condition) -> Self {
        Self {
            condition: Some(condition),
            target: None,
            attached: false,
        }
    }
}

impl Awaiter for LatentWait {
    type Output = ();

    fn is_ready_now(&mut self) -> bool {
        let promise = Promise::current();
        let host = promise.host();
        let on_game_thread = host.is_game_thread();
        let manager = host.latent_manager();
        let target = match self.condition.take() {
            Some(condition) => self.target.insert(Target::resolve(condition, manager)),
            None => match self.target.as_mut() {
                Some(target) => target,
                None => return true,
            },
        };
        if target.reached(manager, on_game_thread) {
            return true;
        }
        self.attached = promise.is_latent() && on_game_thread;
        false
    }

    fn keeps_latent_attached(&self) -> bool {
        self.attached
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let Some(mut target) = self.target.take() else {
            promise.resume(false);
            return;
        };

        if self.attached
            && let Some(latent) = promise.latent()
        {
            latent.set_current_wait(Box::new(move |manager| target.reached(manager, true)));
            return;
        }

        let hook = Arc::new(WaitHook {
            canceled: AtomicBool::new(false),
        });
        let registered: Arc<dyn CancelableAwaiter> = hook.clone();
        if !promise.register_cancelable_awaiter(registered.clone()) {
            promise.resume(false);
            return;
        }

        let action = PendingLatentWait {
            target,
            promise: promise.clone(),
            hook,
            registered,
            finished: false,
        };
        let host = promise.host();
        if host.is_game_thread() {
            add_anonymous(host.latent_manager(), action);
        } else {
            let bridge_host = host.clone();
            host.submit(ThreadKind::Game, move || {
                add_anonymous(bridge_host.latent_manager(), action);
            });
        }
    }

    fn resume_result(&mut self) {}
}

fn add_anonymous(manager: &dyn LatentActionManager, action: PendingLatentWait) {
    let info = LatentInfo::new(manager.system_owner(), manager.next_uuid());
    manager.add_action(info, Box::new(action));
}

struct WaitHook {
    canceled: AtomicBool,
}

impl CancelableAwaiter for WaitHook {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        self.canceled.store(true, Ordering::Release);
        promise.resume_deferred(false);
    }
}

/// Anonymous action resuming a coroutine that waits on a latent condition
/// from outside its own latent action.
struct PendingLatentWait {
    target: Target,
    promise: Arc<Promise>,
    hook: Arc<WaitHook>,
    registered: Arc<dyn CancelableAwaiter>,
    finished: bool,
}

impl PendingLatentAction for PendingLatentWait {
    fn update(&mut self, manager: &dyn LatentActionManager) -> LatentResponse {
        if self.hook.canceled.load(Ordering::Acquire) {
            self.finished = true;
            return LatentResponse::FinishedNoContinuation;
        }
        if !self.target.reached(manager, true) {
            return LatentResponse::KeepWaiting;
        }
        self.finished = true;
        if self.promise.unregister_cancelable_awaiter(&self.registered) {
            self.promise.resume(false);
        }
        LatentResponse::FinishedNoContinuation
    }
}

impl Drop for PendingLatentWait {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Removed before the wait completed; nothing else will resume it.
        if self.promise.unregister_cancelable_awaiter(&self.registered) {
            log::debug!(
                "Latent wait of '{}' removed early, canceling",
                self.promise.debug_name()
            );
            self.promise.cancel(true);
            self.promise.resume_deferred(true);
        }
    }
}

/// Suspends until the next frame.
pub fn next_tick() -> Suspension<LatentWait> {
    ticks(1)
}

/// Suspends for `frames` frames, counted from the first time the await is
/// reached. `ticks(0)` completes immediately.
pub fn ticks(frames: u64) -> Suspension<LatentWait> {
    Suspension::new(LatentWait::new(Condition::Frames(frames)))
}

/// Suspends for `seconds` of world time.
pub fn seconds(seconds: f64) -> Suspension<LatentWait> {
    Suspension::new(LatentWait::new(Condition::Seconds(seconds)))
}

/// Suspends until world time reaches `time`.
pub fn until_time(time: f64) -> Suspension<LatentWait> {
    Suspension::new(LatentWait::new(Condition::UntilTime(time)))
}

/// Suspends until `predicate` returns `true`. The predicate is evaluated on
/// the game thread, once per frame.
pub fn until(predicate: impl FnMut() -> bool + Send + 'static) -> Suspension<LatentWait> {
    Suspension::new(LatentWait::new(Condition::Until(Box::new(predicate))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::error::CoroutineError;
    use crate::host::World;
    use crate::latent_action::ObjectId;
    use std::sync::atomic::AtomicUsize;

    fn world() -> World {
        World::with_config(HostConfig::default().with_worker_threads(1)).unwrap()
    }

    #[test]
    fn latent_ticks_wait_exact_frames() {
        let world = world();
        let owner = world.spawn_object();
        let handle = world.host().spawn_latent(owner, async {
            ticks(3).await;
        });
        world.tick(0.1);
        world.tick(0.1);
        assert!(!handle.is_done());
        world.tick(0.1);
        assert!(handle.was_successful());
    }

    #[test]
    fn zero_ticks_is_immediate() {
        let world = world();
        let owner = world.spawn_object();
        let handle = world.host().spawn_latent(owner, async {
            ticks(0).await;
            5u8
        });
        assert_eq!(handle.result(), Ok(5));
    }

    #[test]
    fn free_threaded_coroutine_bridges_through_anonymous_action() {
        let world = world();
        let handle = world.host().spawn(async {
            next_tick().await;
        });
        assert_eq!(world.action_count(), 1);
        world.tick(0.1);
        assert!(handle.was_successful());
        assert_eq!(world.action_count(), 0);
    }

    #[test]
    fn seconds_use_world_time() {
        let world = world();
        let owner = world.spawn_object();
        let handle = world.host().spawn_latent(owner, async {
            seconds(1.0).await;
        });
        world.tick(0.5);
        assert!(!handle.is_done());
        world.tick(0.6);
        assert!(handle.was_successful());
    }

    #[test]
    fn until_polls_predicate_each_frame() {
        let world = world();
        let owner = world.spawn_object();
        let polls = Arc::new(AtomicUsize::new(0));
        let polls_in = polls.clone();
        let handle = world.host().spawn_latent(owner, async move {
            until(move || polls_in.fetch_add(1, Ordering::SeqCst) + 1 >= 3).await;
        });
        // First check happens when the await is reached.
        assert_eq!(polls.load(Ordering::SeqCst), 1);
        world.tick(0.1);
        assert!(!handle.is_done());
        world.tick(0.1);
        assert!(handle.was_successful());
    }

    #[test]
    fn canceling_bridged_wait_is_fast() {
        let world = world();
        let handle = world.host().spawn(async {
            ticks(1000).await;
        });
        handle.cancel();
        assert!(handle.wait(Some(std::time::Duration::from_secs(5))));
        assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
        world.tick(0.1);
        assert_eq!(world.action_count(), 0);
    }

    #[test]
    fn invalid_owner_refuses_to_start() {
        let world = world();
        let handle = world
            .host()
            .spawn_latent(ObjectId::from_raw(9999), async { ticks(1).await });
        assert!(handle.is_done());
        assert_eq!(handle.failure(), Some(CoroutineError::NotStarted));
    }
}
