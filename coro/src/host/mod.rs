//! Host environment seam.
//!
//! Coroutines never create threads or clocks of their own. Everything they
//! need from the outside world goes through [`Environment`]: which thread is
//! the game thread, how to run a callback on a given thread or on the pool,
//! a timer service, and (optionally) a [`LatentActionManager`].
//!
//! [`Host`] is the cheap, clonable handle coroutines keep to their
//! environment. It is also where coroutines are started:
//!
//! ```ignore
//! let world = World::new()?;
//! let host = world.host();
//!
//! // Free-threaded coroutine
//! let task = host.spawn(async {
//!     move_to_pool(Priority::Low).await;
//!     expensive()
//! });
//!
//! // Frame-ticked coroutine owned by a host object
//! let actor = world.spawn_object();
//! host.spawn_latent(actor, async move {
//!     ticks(2).await;
//!     log::info!("two frames later");
//! });
//! ```

mod timer_thread;
mod worker_pool;
mod world;

pub use timer_thread::TimerThread;
pub use worker_pool::WorkerPool;
pub use world::World;

use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Instant;

use crate::aggregate::{self, AggregateAwaiter};
use crate::awaiter::Suspension;
use crate::coroutine::Coroutine;
use crate::latent_action::{LatentActionManager, LatentInfo, ObjectId};
use crate::priority::{Priority, ThreadKind};
use crate::promise::latent::{LatentPromise, PendingLatentCoroutine};
use crate::promise::{Frame, Promise};

/// A unit of work submitted to a thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Thread and scheduling services supplied by the embedding engine.
pub trait Environment: Send + Sync + 'static {
    /// Whether the calling thread is the game thread.
    fn is_game_thread(&self) -> bool;

    /// Runs `task` on the given thread at the next opportunity.
    fn submit(&self, thread: ThreadKind, task: Task);

    /// Runs `task` on the worker pool.
    fn submit_pooled(&self, priority: Priority, task: Task);

    /// Runs `task` on `thread` once `deadline` has passed.
    fn schedule_timer(&self, deadline: Instant, thread: ThreadKind, task: Task) -> TimerId;

    /// Cancels a timer that has not fired yet. Returns `true` if it was
    /// removed before firing.
    fn cancel_timer(&self, timer: TimerId) -> bool;

    /// The latent action manager, if this host supports latent coroutines.
    fn latent(&self) -> Option<&dyn LatentActionManager>;
}

/// Shared handle to an [`Environment`].
///
/// Clone is cheap (Arc-wrapped).
#[derive(Clone)]
pub struct Host {
    env: Arc<dyn Environment>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("latent", &self.env.latent().is_some())
            .finish_non_exhaustive()
    }
}

impl Host {
    /// Wraps an environment.
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self { env }
    }

    /// Whether the calling thread is the game thread.
    pub fn is_game_thread(&self) -> bool {
        self.env.is_game_thread()
    }

    /// Runs `task` on the given thread.
    pub fn submit(&self, thread: ThreadKind, task: impl FnOnce() + Send + 'static) {
        self.env.submit(thread, Box::new(task));
    }

    /// Runs `task` on the worker pool.
    pub fn submit_pooled(&self, priority: Priority, task: impl FnOnce() + Send + 'static) {
        self.env.submit_pooled(priority, Box::new(task));
    }

    /// Runs `task` on `thread` after `deadline`.
    pub fn schedule_timer(
        &self,
        deadline: Instant,
        thread: ThreadKind,
        task: impl FnOnce() + Send + 'static,
    ) -> TimerId {
        self.env.schedule_timer(deadline, thread, Box::new(task))
    }

    /// Cancels a pending timer.
    pub fn cancel_timer(&self, timer: TimerId) -> bool {
        self.env.cancel_timer(timer)
    }

    /// The latent action manager, if any.
    pub fn latent(&self) -> Option<&dyn LatentActionManager> {
        self.env.latent()
    }

    pub(crate) fn latent_manager(&self) -> &dyn LatentActionManager {
        self.env
            .latent()
            .unwrap_or_else(|| panic!("Host has no latent action manager"))
    }

    /// Starts a free-threaded coroutine.
    ///
    /// The body runs immediately on the calling thread until its first
    /// suspension point. Afterwards it runs on whichever thread resumes it.
    pub fn spawn<F>(&self, future: F) -> Coroutine<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_named("async", future)
    }

    /// Starts a free-threaded coroutine with a debug name.
    pub fn spawn_named<F>(&self, name: impl Into<String>, future: F) -> Coroutine<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let promise = Promise::new(self.clone(), name.into(), None, erase(future));
        let handle = Coroutine::from_extras(promise.extras().clone());
        promise.resume(false);
        handle
    }

    /// Starts a frame-ticked coroutine owned by `owner`, with a fresh uuid.
    ///
    /// # Panics
    ///
    /// Panics when called off the game thread or when the host has no
    /// latent action manager.
    pub fn spawn_latent<F>(&self, owner: ObjectId, future: F) -> Coroutine<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let uuid = self.latent_manager().next_uuid();
        self.spawn_latent_with(LatentInfo::new(owner, uuid), future)
    }

    /// Starts a frame-ticked coroutine under an explicit action key.
    ///
    /// If the owner is no longer valid, or an action with the same key is
    /// already registered, the coroutine does not run: the returned handle
    /// is done and unsuccessful.
    pub fn spawn_latent_with<F>(&self, info: LatentInfo, future: F) -> Coroutine<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        assert!(
            self.is_game_thread(),
            "Latent coroutines may only be started on the game thread"
        );
        let manager = self.latent_manager();
        let promise = Promise::new(
            self.clone(),
            format!("latent {:?}#{}", info.owner, info.uuid),
            Some(LatentPromise::new(info)),
            erase(future),
        );
        let handle = Coroutine::from_extras(promise.extras().clone());

        if !manager.is_valid(info.owner) {
            log::debug!("Not starting latent coroutine: owner {:?} is invalid", info.owner);
            promise.refuse_start();
            return handle;
        }
        if manager.find_action(info) {
            log::debug!(
                "Not starting latent coroutine: duplicate action {:?}#{}",
                info.owner,
                info.uuid
            );
            promise.refuse_start();
            return handle;
        }

        manager.add_action(info, Box::new(PendingLatentCoroutine::new(promise.clone())));
        promise.resume(false);
        handle
    }

    /// [`when_all`](crate::when_all) with consumers started on this host.
    pub fn when_all<I>(&self, awaitables: I) -> Suspension<AggregateAwaiter>
    where
        I: IntoIterator,
        I::Item: IntoFuture + Send + 'static,
        <I::Item as IntoFuture>::IntoFuture: Send + 'static,
    {
        aggregate::when_all_on(self, awaitables)
    }

    /// [`when_any`](crate::when_any) with consumers started on this host.
    pub fn when_any<I>(&self, awaitables: I) -> Suspension<AggregateAwaiter>
    where
        I: IntoIterator,
        I::Item: IntoFuture + Send + 'static,
        <I::Item as IntoFuture>::IntoFuture: Send + 'static,
    {
        aggregate::when_any_on(self, awaitables)
    }
}

fn erase<F>(future: F) -> Frame
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    Box::pin(async move { Box::new(future.await) as Box<dyn Any + Send> })
}
