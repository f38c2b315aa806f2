//! End-to-end scenarios against the reference [`World`] host.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::Mutex;

use redlilium_coro::{
    AwaitableDelegate, AwaitableEvent, AwaitableSemaphore, CancellationGuard, CoroutineError,
    EventMode, ExitReason, HostConfig, LatentInfo, ManualCoroutine, OnAbnormalExit, OnActionAborted, OnObjectDestroyed,
    Priority, World, finish_now_if_canceled, move_to_game_thread, move_to_pool,
    platform_seconds, race, self_cancel, ticks, when_all, when_any, yield_now,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn world() -> World {
    init_logging();
    World::with_config(HostConfig::default().with_worker_threads(2)).unwrap()
}

/// Records the thread that drops it.
struct DropSite(Arc<Mutex<Option<ThreadId>>>);

impl Drop for DropSite {
    fn drop(&mut self) {
        *self.0.lock() = Some(std::thread::current().id());
    }
}

// ---------------------------------------------------------------------------
// Latent waits
// ---------------------------------------------------------------------------

#[test]
fn two_ticks_take_exactly_two_frames() {
    let world = world();
    let actor = world.spawn_object();
    let handle = world.host().spawn_latent(actor, async {
        ticks(2).await;
        "done"
    });

    assert!(!handle.is_done());
    world.tick(1.0 / 60.0);
    assert!(!handle.is_done());
    world.tick(1.0 / 60.0);
    assert_eq!(handle.result(), Ok("done"));
    assert_eq!(handle.exit_reason(), ExitReason::Normal);

    world.tick(1.0 / 60.0);
    assert_eq!(world.action_count(), 0);
    assert_eq!(world.fired_links(), 1);
}

#[test]
fn when_any_of_latent_coroutines_picks_the_shortest() {
    let world = world();
    let actor = world.spawn_object();
    let host = world.host();
    let children: Vec<_> = [3, 4, 1, 2]
        .into_iter()
        .map(|frames| host.spawn_latent(actor, async move { ticks(frames).await }))
        .collect();

    let waiter_children = children.clone();
    let first = host.spawn(async move { when_any(waiter_children).await });

    assert!(!first.is_done());
    world.tick(0.1);
    assert_eq!(first.result(), Ok(Some(2)));

    // Losing children keep running; when_any does not cancel them.
    assert!(!children[0].is_done());
    world.tick(0.1);
    world.tick(0.1);
    world.tick(0.1);
    assert!(children.iter().all(|child| child.was_successful()));
}

#[test]
fn duplicate_latent_key_refuses_to_start() {
    let world = world();
    let actor = world.spawn_object();
    let info = LatentInfo::new(actor, 42);
    let first = world.host().spawn_latent_with(info, async { ticks(5).await });
    let second = world.host().spawn_latent_with(info, async { ticks(5).await });

    assert!(!first.is_done());
    assert!(second.is_done());
    assert_eq!(second.failure(), Some(CoroutineError::NotStarted));
    assert_eq!(world.action_count(), 1);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[test]
fn canceling_inside_when_all_skips_everything_after() {
    let world = world();
    let event = AwaitableEvent::new(EventMode::ManualReset, false);
    let semaphore = AwaitableSemaphore::new(1, 0);
    let continued = Arc::new(AtomicBool::new(false));

    let handle = {
        let event = event.clone();
        let semaphore = semaphore.clone();
        let continued = continued.clone();
        world.host().spawn(async move {
            when_all!(event.wait(), semaphore.acquire()).await;
            continued.store(true, Ordering::SeqCst);
        })
    };
    assert!(!handle.is_done());

    handle.cancel();
    assert!(handle.wait(Some(TIMEOUT)));
    assert!(!handle.was_successful());
    assert_eq!(handle.failure(), Some(CoroutineError::Canceled));

    // Neither primitive hands anything to the dead consumers.
    event.trigger();
    semaphore.unlock(1);
    assert_eq!(semaphore.count(), 1);
    assert_eq!(event.waiter_count(), 0);
    assert!(!continued.load(Ordering::SeqCst));
}

#[test]
fn cancel_is_idempotent() {
    let world = world();
    let handle = world.host().spawn(async {
        platform_seconds(3600.0).await;
    });
    handle.cancel();
    handle.cancel();
    handle.cancel();
    assert!(handle.wait(Some(TIMEOUT)));
    assert_eq!(handle.failure(), Some(CoroutineError::Canceled));

    // Canceling a finished coroutine keeps its outcome.
    let done = world.host().spawn(async { 5u8 });
    done.cancel();
    assert_eq!(done.result(), Ok(5));
}

#[test]
fn nested_guards_defer_cancellation_until_released() {
    let world = world();
    let gate = AwaitableEvent::new(EventMode::ManualReset, false);
    let released = Arc::new(AtomicBool::new(false));
    let after = Arc::new(AtomicBool::new(false));

    let handle = {
        let gate = gate.clone();
        let released = released.clone();
        let after = after.clone();
        world.host().spawn(async move {
            let outer = CancellationGuard::new();
            let inner = CancellationGuard::new();
            gate.wait().await;
            drop(inner);
            yield_now().await;
            drop(outer);
            released.store(true, Ordering::SeqCst);
            finish_now_if_canceled().await;
            after.store(true, Ordering::SeqCst);
        })
    };

    handle.cancel();
    // The guarded wait is not interrupted.
    assert_eq!(gate.waiter_count(), 1);
    assert!(!handle.is_done());

    gate.trigger();
    assert!(handle.wait(Some(TIMEOUT)));
    assert!(released.load(Ordering::SeqCst));
    assert!(!after.load(Ordering::SeqCst));
    assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
}

#[test]
fn cancel_racing_completion_finishes_exactly_once() {
    let world = world();
    for _ in 0..50 {
        let event = AwaitableEvent::new(EventMode::AutoReset, false);
        let resumed = Arc::new(AtomicUsize::new(0));
        let handle = {
            let event = event.clone();
            let resumed = resumed.clone();
            world.host().spawn(async move {
                event.wait().await;
                resumed.fetch_add(1, Ordering::SeqCst);
            })
        };

        let trigger = {
            let event = event.clone();
            std::thread::spawn(move || event.trigger())
        };
        handle.cancel();
        trigger.join().unwrap();

        assert!(handle.wait(Some(TIMEOUT)));
        match handle.failure() {
            None => assert_eq!(resumed.load(Ordering::SeqCst), 1),
            Some(error) => {
                assert_eq!(error, CoroutineError::Canceled);
                assert_eq!(resumed.load(Ordering::SeqCst), 0);
            }
        }
        assert_eq!(event.waiter_count(), 0);
    }
}

#[test]
fn race_cancels_the_losers() {
    let world = world();
    let host = world.host();
    let slow = host.spawn(async {
        platform_seconds(3600.0).await;
        1u32
    });
    let fast = host.spawn(async {
        yield_now().await;
        2u32
    });

    let participants = vec![slow.clone(), fast.clone()];
    let outcome = host.spawn(async move { race(participants).await });

    assert!(outcome.wait(Some(TIMEOUT)));
    assert_eq!(outcome.result(), Ok(Some(1)));
    assert_eq!(fast.result(), Ok(2));
    assert!(slow.wait(Some(TIMEOUT)));
    assert_eq!(slow.failure(), Some(CoroutineError::Canceled));
}

// ---------------------------------------------------------------------------
// Latent exits
// ---------------------------------------------------------------------------

#[test]
fn destroyed_owner_ends_latent_coroutine() {
    let world = world();
    let actor = world.spawn_object();
    let destroyed = Arc::new(AtomicBool::new(false));
    let abnormal = Arc::new(AtomicBool::new(false));

    let handle = {
        let destroyed = destroyed.clone();
        let abnormal = abnormal.clone();
        world.host().spawn_latent(actor, async move {
            let _on_destroyed =
                OnObjectDestroyed::new(move || destroyed.store(true, Ordering::SeqCst));
            let _on_abnormal =
                OnAbnormalExit::new(move || abnormal.store(true, Ordering::SeqCst));
            ticks(100).await;
        })
    };
    world.tick(0.1);
    assert!(!handle.is_done());

    world.destroy_object(actor);
    assert!(handle.is_done());
    assert_eq!(handle.exit_reason(), ExitReason::ObjectDestroyed);
    assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
    assert!(destroyed.load(Ordering::SeqCst));
    assert!(abnormal.load(Ordering::SeqCst));
    assert_eq!(world.action_count(), 0);
}

#[test]
fn aborted_action_ends_latent_coroutine() {
    let world = world();
    let actor = world.spawn_object();
    let aborted = Arc::new(AtomicBool::new(false));
    let destroyed = Arc::new(AtomicBool::new(false));

    let handle = {
        let aborted = aborted.clone();
        let destroyed = destroyed.clone();
        world.host().spawn_latent(actor, async move {
            let _on_aborted =
                OnActionAborted::new(move || aborted.store(true, Ordering::SeqCst));
            let _on_destroyed =
                OnObjectDestroyed::new(move || destroyed.store(true, Ordering::SeqCst));
            ticks(100).await;
        })
    };

    world.abort_actions(actor);
    assert!(handle.is_done());
    assert_eq!(handle.exit_reason(), ExitReason::ActionAborted);
    assert!(aborted.load(Ordering::SeqCst));
    assert!(!destroyed.load(Ordering::SeqCst));
    assert!(world.is_valid(actor));
}

#[test]
fn released_exit_callback_does_not_fire() {
    let world = world();
    let actor = world.spawn_object();
    let fired = Arc::new(AtomicBool::new(false));

    let handle = {
        let fired = fired.clone();
        world.host().spawn_latent(actor, async move {
            let callback = OnAbnormalExit::new(move || fired.store(true, Ordering::SeqCst));
            callback.release();
            ticks(100).await;
        })
    };
    world.destroy_object(actor);
    assert!(handle.is_done());
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn self_cancel_reports_self_canceled() {
    let world = world();
    let actor = world.spawn_object();
    let after = Arc::new(AtomicBool::new(false));

    let handle = {
        let after = after.clone();
        world.host().spawn_latent(actor, async move {
            ticks(1).await;
            self_cancel().await;
            after.store(true, Ordering::SeqCst);
        })
    };
    world.tick(0.1);
    world.tick(0.1);
    assert!(handle.is_done());
    assert_eq!(handle.exit_reason(), ExitReason::SelfCanceled);
    assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
    assert!(!after.load(Ordering::SeqCst));
    assert_eq!(world.action_count(), 0);
}

#[test]
fn owner_destroyed_while_suspended_off_game_thread() {
    let world = world();
    let actor = world.spawn_object();
    let game_thread = std::thread::current().id();
    let gate = AwaitableEvent::new(EventMode::ManualReset, false);
    let dropped_on = Arc::new(Mutex::new(None));
    let continued = Arc::new(AtomicBool::new(false));

    let handle = {
        let gate = gate.clone();
        let site = DropSite(dropped_on.clone());
        let continued = continued.clone();
        world.host().spawn_latent(actor, async move {
            let _site = site;
            move_to_pool(Priority::Low).await;
            gate.wait().await;
            continued.store(true, Ordering::SeqCst);
        })
    };
    assert!(world.pump_until(TIMEOUT, || gate.waiter_count() == 1));

    world.destroy_object(actor);
    assert!(world.pump_until(TIMEOUT, || handle.is_done()));
    assert_eq!(handle.exit_reason(), ExitReason::ObjectDestroyed);
    assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
    assert_eq!(*dropped_on.lock(), Some(game_thread));

    gate.trigger();
    assert!(!continued.load(Ordering::SeqCst));
}

#[test]
fn owner_destroyed_while_running_on_pool_defers_teardown() {
    let world = world();
    let actor = world.spawn_object();
    let game_thread = std::thread::current().id();
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let dropped_on = Arc::new(Mutex::new(None));
    let continued = Arc::new(AtomicBool::new(false));

    let handle = {
        let started = started.clone();
        let release = release.clone();
        let site = DropSite(dropped_on.clone());
        let continued = continued.clone();
        world.host().spawn_latent(actor, async move {
            let _site = site;
            move_to_pool(Priority::Low).await;
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            yield_now().await;
            continued.store(true, Ordering::SeqCst);
        })
    };
    assert!(world.pump_until(TIMEOUT, || started.load(Ordering::SeqCst)));

    // The frame is busy on a worker; only the request is recorded.
    world.destroy_object(actor);
    assert!(!handle.is_done());
    assert_eq!(world.action_count(), 0);

    release.store(true, Ordering::SeqCst);
    assert!(world.pump_until(TIMEOUT, || handle.is_done()));
    assert_eq!(handle.exit_reason(), ExitReason::ObjectDestroyed);
    assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
    assert_eq!(*dropped_on.lock(), Some(game_thread));
    assert!(!continued.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Thread hops
// ---------------------------------------------------------------------------

#[test]
fn latent_coroutine_detaches_and_reattaches() {
    let world = world();
    let actor = world.spawn_object();
    let game_thread = std::thread::current().id();
    let back_home = Arc::new(AtomicBool::new(false));

    let handle = {
        let back_home = back_home.clone();
        world.host().spawn_latent(actor, async move {
            move_to_pool(Priority::Low).await;
            let was_away = std::thread::current().id() != game_thread;
            move_to_game_thread().await;
            back_home.store(true, Ordering::SeqCst);
            ticks(1).await;
            was_away && std::thread::current().id() == game_thread
        })
    };

    // The action outlives the detour.
    assert_eq!(world.action_count(), 1);
    assert!(world.pump_until(TIMEOUT, || back_home.load(Ordering::SeqCst)));
    assert!(!handle.is_done());

    world.tick(0.1);
    assert_eq!(handle.result(), Ok(true));
}

#[test]
fn free_threaded_coroutine_awaits_latent_ticks() {
    let world = world();
    let handle = world.host().spawn(async {
        move_to_pool(Priority::High).await;
        ticks(2).await;
        "ticked"
    });

    assert!(world.tick_until(0.1, 100, || handle.is_done()));
    assert_eq!(handle.result(), Ok("ticked"));
}

// ---------------------------------------------------------------------------
// Callback bridges
// ---------------------------------------------------------------------------

#[test]
fn latent_coroutine_awaits_delegate_and_manual_result() {
    let world = world();
    let actor = world.spawn_object();
    let on_loaded = AwaitableDelegate::<(u32, String)>::new();
    let manual = ManualCoroutine::<u32>::named("asset");

    let handle = {
        let on_loaded = on_loaded.clone();
        let asset = manual.handle();
        world.host().spawn_latent(actor, async move {
            let (id, name) = (&on_loaded).await;
            let size = asset.await.unwrap_or_default();
            format!("{id}:{name}:{size}")
        })
    };
    assert_eq!(on_loaded.waiter_count(), 1);

    let broadcaster = {
        let on_loaded = on_loaded.clone();
        std::thread::spawn(move || on_loaded.broadcast((4, "mesh".to_owned())))
    };
    broadcaster.join().unwrap();
    assert!(world.pump_until(TIMEOUT, || on_loaded.waiter_count() == 0));

    manual.set_result(1024);
    assert!(world.pump_until(TIMEOUT, || handle.is_done()));
    assert_eq!(handle.result(), Ok("4:mesh:1024".to_owned()));
    assert_eq!(handle.exit_reason(), ExitReason::Normal);
}
