//! Thread hops and wall-clock timers.
//!
//! These work in both coroutine modes. A latent coroutine awaiting any of
//! them is detached from the game thread until it is resumed there again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::awaiter::{Awaiter, CancelableAwaiter, Suspension};
use crate::host::TimerId;
use crate::priority::{Priority, ThreadKind};
use crate::promise::Promise;

/// Awaiter behind [`yield_now`].
pub struct YieldNow;

impl Awaiter for YieldNow {
    type Output = ();

    fn is_ready_now(&mut self) -> bool {
        false
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        promise.resume_deferred(false);
    }

    fn resume_result(&mut self) {}
}

/// Suspends and resumes from a freshly scheduled task: on the game thread
/// for latent coroutines, on the worker pool otherwise.
pub fn yield_now() -> Suspension<YieldNow> {
    Suspension::new(YieldNow)
}

/// Where a [`MoveTo`] continues the coroutine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Thread(ThreadKind),
    Pool(Priority),
    NewThread,
}

/// Awaiter behind the `move_to_*` functions.
pub struct MoveTo {
    destination: Destination,
}

impl Awaiter for MoveTo {
    type Output = ();

    fn is_ready_now(&mut self) -> bool {
        match self.destination {
            Destination::Thread(ThreadKind::Game) => Promise::current().host().is_game_thread(),
            _ => false,
        }
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let host = promise.host().clone();
        let promise = promise.clone();
        match self.destination {
            Destination::Thread(thread) => host.submit(thread, move || promise.resume(false)),
            Destination::Pool(priority) => {
                host.submit_pooled(priority, move || promise.resume(false));
            }
            Destination::NewThread => {
                let on_thread = promise.clone();
                let spawned = std::thread::Builder::new()
                    .name("coro-thread".to_owned())
                    .spawn(move || on_thread.resume(false));
                if let Err(error) = spawned {
                    log::warn!(
                        "Failed to spawn a thread for '{}': {error}, using the pool",
                        promise.debug_name()
                    );
                    host.submit_pooled(Priority::High, move || promise.resume(false));
                }
            }
        }
    }

    fn resume_result(&mut self) {}
}

/// Continues the coroutine on the given thread.
///
/// Completes without suspending when already on the game thread and
/// `thread` is [`ThreadKind::Game`].
pub fn move_to_thread(thread: ThreadKind) -> Suspension<MoveTo> {
    Suspension::new(MoveTo {
        destination: Destination::Thread(thread),
    })
}

/// Continues the coroutine on the game thread.
pub fn move_to_game_thread() -> Suspension<MoveTo> {
    move_to_thread(ThreadKind::Game)
}

/// Continues the coroutine on the worker pool.
pub fn move_to_pool(priority: Priority) -> Suspension<MoveTo> {
    Suspension::new(MoveTo {
        destination: Destination::Pool(priority),
    })
}

/// Continues the coroutine on a dedicated new thread, which exits at the
/// coroutine's next suspension point.
pub fn move_to_new_thread() -> Suspension<MoveTo> {
    Suspension::new(MoveTo {
        destination: Destination::NewThread,
    })
}

struct TimerHook {
    timer: Mutex<Option<TimerId>>,
}

impl CancelableAwaiter for TimerHook {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        if let Some(timer) = self.timer.lock().take() {
            promise.host().cancel_timer(timer);
        }
        promise.resume_deferred(false);
    }
}

/// Awaiter behind [`platform_seconds`] and [`until_platform_time`].
pub struct PlatformTimer {
    deadline: Instant,
}

impl Awaiter for PlatformTimer {
    type Output = ();

    fn is_ready_now(&mut self) -> bool {
        Instant::now() >= self.deadline
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let hook = Arc::new(TimerHook {
            timer: Mutex::new(None),
        });
        let registered: Arc<dyn CancelableAwaiter> = hook.clone();
        if !promise.register_cancelable_awaiter(registered.clone()) {
            promise.resume(false);
            return;
        }

        let thread = if promise.is_latent() {
            ThreadKind::Game
        } else {
            ThreadKind::Worker
        };
        let fired = promise.clone();
        // The hook lock covers the window before the id is stored.
        let mut slot = hook.timer.lock();
        let timer = promise.host().schedule_timer(self.deadline, thread, move || {
            if fired.unregister_cancelable_awaiter(&registered) {
                fired.resume(false);
            }
        });
        *slot = Some(timer);
    }

    fn resume_result(&mut self) {}
}

const FAR_FUTURE_SECS: u64 = 365 * 24 * 60 * 60;

/// Suspends for `seconds` of wall-clock time. Cancelable.
pub fn platform_seconds(seconds: f64) -> Suspension<PlatformTimer> {
    let delay = Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX);
    let deadline = Instant::now()
        .checked_add(delay)
        .unwrap_or_else(|| Instant::now() + Duration::from_secs(FAR_FUTURE_SECS));
    until_platform_time(deadline)
}

/// Suspends until `deadline`. Cancelable.
pub fn until_platform_time(deadline: Instant) -> Suspension<PlatformTimer> {
    Suspension::new(PlatformTimer { deadline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoroutineError;
    use crate::test_support::ManualEnv;

    #[test]
    fn yield_resumes_from_queue() {
        let env = ManualEnv::new();
        let handle = env.host().spawn(async {
            yield_now().await;
            1u8
        });
        assert!(!handle.is_done());
        assert_eq!(env.run_pending(), 1);
        assert_eq!(handle.result(), Ok(1));
    }

    #[test]
    fn move_to_game_thread_is_ready_on_game_thread() {
        let env = ManualEnv::new();
        let handle = env.host().spawn(async {
            move_to_game_thread().await;
        });
        assert!(handle.is_done());
    }

    #[test]
    fn move_to_pool_always_hops() {
        let env = ManualEnv::new();
        let handle = env.host().spawn(async {
            move_to_pool(Priority::Low).await;
        });
        assert!(!handle.is_done());
        env.run_pending();
        assert!(handle.was_successful());
    }

    #[test]
    fn move_to_new_thread_runs_elsewhere() {
        let env = ManualEnv::new();
        let caller = std::thread::current().id();
        let handle = env.host().spawn(async move {
            move_to_new_thread().await;
            std::thread::current().id() != caller
        });
        assert!(handle.wait(Some(Duration::from_secs(5))));
        assert_eq!(handle.result(), Ok(true));
    }

    #[test]
    fn elapsed_timer_does_not_suspend() {
        let env = ManualEnv::new();
        let handle = env.host().spawn(async {
            platform_seconds(0.0).await;
        });
        assert!(handle.is_done());
        assert_eq!(env.pending_timers(), 0);
    }

    #[test]
    fn timer_fires_once() {
        let env = ManualEnv::new();
        let handle = env.host().spawn(async {
            platform_seconds(60.0).await;
            "fired"
        });
        assert_eq!(env.pending_timers(), 1);
        assert_eq!(env.fire_timers(), 1);
        assert_eq!(handle.result(), Ok("fired"));
    }

    #[test]
    fn cancel_removes_timer() {
        let env = ManualEnv::new();
        let handle = env.host().spawn(async {
            platform_seconds(60.0).await;
        });
        handle.cancel();
        assert_eq!(env.pending_timers(), 0);
        env.run_pending();
        assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
    }
}
