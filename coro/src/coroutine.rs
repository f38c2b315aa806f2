//! User-facing coroutine handles.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::future::IntoFuture;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::awaiter::{Awaiter, CancelableAwaiter, Suspension};
use crate::error::CoroutineError;
use crate::promise::{self, ExitReason, Promise, PromiseExtras};

/// Shared handle to a running or finished coroutine.
///
/// Cloning is cheap and every clone observes the same coroutine. Dropping
/// all handles does not stop the coroutine.
///
/// # Example
///
/// ```
/// use redlilium_coro::{World, move_to_pool, Priority};
///
/// let world = World::new().unwrap();
/// let task = world.host().spawn(async {
///     move_to_pool(Priority::Low).await;
///     6 * 7
/// });
/// task.wait(None);
/// assert_eq!(task.result(), Ok(42));
/// ```
pub struct Coroutine<T> {
    extras: Arc<PromiseExtras>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Coroutine<T> {
    pub(crate) fn from_extras(extras: Arc<PromiseExtras>) -> Self {
        Self {
            extras,
            _marker: PhantomData,
        }
    }

    /// Process-unique id of the coroutine.
    pub fn id(&self) -> u64 {
        self.extras.id()
    }

    pub fn debug_name(&self) -> &str {
        self.extras.name()
    }

    /// Whether the coroutine has finished, successfully or not.
    pub fn is_done(&self) -> bool {
        self.extras.is_done()
    }

    /// Whether the coroutine returned normally. `false` while running.
    pub fn was_successful(&self) -> bool {
        self.extras.was_successful()
    }

    /// Why the coroutine finished unsuccessfully, if it did.
    pub fn failure(&self) -> Option<CoroutineError> {
        self.extras.failure()
    }

    /// Why a latent coroutine ended. Always [`ExitReason::Normal`] for
    /// free-threaded coroutines and while running.
    pub fn exit_reason(&self) -> ExitReason {
        self.extras.exit_reason()
    }

    /// Blocks the calling thread until the coroutine finishes or `timeout`
    /// elapses. Returns whether it finished.
    ///
    /// Waiting on the game thread for a coroutine that needs the game
    /// thread to progress deadlocks.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        self.extras.wait(timeout)
    }

    /// Requests cancellation. Does nothing if the coroutine already finished.
    ///
    /// The coroutine is destroyed at its next suspension point, or right
    /// away (from a freshly scheduled task) if it is suspended on an awaiter
    /// that supports fast cancellation. A [`ManualCoroutine`] handle
    /// completes as canceled on the spot.
    ///
    /// [`ManualCoroutine`]: crate::ManualCoroutine
    pub fn cancel(&self) {
        if let Some(promise) = self.extras.promise() {
            promise.cancel(false);
        } else if self.extras.is_manual() {
            self.extras
                .try_complete(Err(CoroutineError::Canceled), ExitReason::Normal);
        }
    }

    /// Awaitable completing with [`was_successful`](Self::was_successful)
    /// once the coroutine finished.
    pub fn finished(&self) -> Suspension<CoroutineAwaiter<bool>> {
        Suspension::new(CoroutineAwaiter::new(self.extras.clone(), |success, _| {
            success
        }))
    }

    pub(crate) fn extras(&self) -> &Arc<PromiseExtras> {
        &self.extras
    }
}

impl<T: Send + 'static> Coroutine<T> {
    /// A handle that is already done, successfully, with `value`.
    pub fn completed(value: T) -> Self {
        let extras = PromiseExtras::completed(
            promise::allocate_id(),
            "completed".to_owned(),
            Box::new(value),
        );
        Self::from_extras(Arc::new(extras))
    }

    /// Blocks until done, then moves the result out.
    ///
    /// Later calls (and [`result`](Self::result)) get
    /// [`CoroutineError::ResultTaken`].
    pub fn take_result(&self) -> Result<T, CoroutineError> {
        self.extras.take_result()
    }

    /// Runs `callback` once the coroutine finished, with its result if it
    /// was successful. Runs immediately on this thread if already done;
    /// otherwise on the thread that finishes the coroutine.
    pub fn continue_with(&self, callback: impl FnOnce(Option<&T>) + Send + 'static) {
        self.extras.add_continuation(Box::new(move |value| {
            callback(value.and_then(|value| value.downcast_ref::<T>()));
        }));
    }

    /// Like [`continue_with`](Self::continue_with), but only runs while
    /// `target` is still alive.
    pub fn continue_with_weak<O>(
        &self,
        target: &Arc<O>,
        callback: impl FnOnce(&O, Option<&T>) + Send + 'static,
    ) where
        O: Send + Sync + 'static,
    {
        let target = Arc::downgrade(target);
        self.continue_with(move |value| {
            if let Some(target) = target.upgrade() {
                callback(&target, value);
            }
        });
    }
}

impl<T: Clone + 'static> Coroutine<T> {
    /// Blocks until done, then clones the result out.
    ///
    /// Calling this from one of the coroutine's own continuations
    /// deadlocks; continuations receive the result directly.
    pub fn result(&self) -> Result<T, CoroutineError> {
        self.extras.clone_result()
    }
}

impl<T> Clone for Coroutine<T> {
    fn clone(&self) -> Self {
        Self::from_extras(self.extras.clone())
    }
}

impl<T> fmt::Debug for Coroutine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("id", &self.id())
            .field("name", &self.debug_name())
            .field("done", &self.is_done())
            .finish()
    }
}

impl<T> PartialEq for Coroutine<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.extras, &other.extras)
    }
}

impl<T> Eq for Coroutine<T> {}

impl<T> PartialOrd for Coroutine<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Coroutine<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        Arc::as_ptr(&self.extras).cmp(&Arc::as_ptr(&other.extras))
    }
}

impl<T> Hash for Coroutine<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.extras).hash(state);
    }
}

/// Awaiting a handle yields its result, or `None` if it was unsuccessful.
///
/// Awaiting is cancelable: canceling the awaiting coroutine does not wait
/// for the awaited one.
impl<T: Clone + Send + 'static> IntoFuture for Coroutine<T> {
    type Output = Option<T>;
    type IntoFuture = Suspension<CoroutineAwaiter<Option<T>>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(CoroutineAwaiter::new(self.extras, |_, value| {
            value.and_then(|value| value.downcast_ref::<T>()).cloned()
        }))
    }
}

impl<T: Clone + Send + 'static> IntoFuture for &Coroutine<T> {
    type Output = Option<T>;
    type IntoFuture = Suspension<CoroutineAwaiter<Option<T>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.clone().into_future()
    }
}

type Project<R> = fn(bool, Option<&(dyn Any + Send)>) -> R;

/// Waits for another coroutine to finish.
///
/// The outcome is captured inside the completion callback, so resuming never
/// needs to wait for the awaited coroutine's remaining continuations.
pub struct CoroutineAwaiter<R> {
    extras: Arc<PromiseExtras>,
    project: Project<R>,
    slot: Arc<Mutex<Option<R>>>,
}

impl<R> CoroutineAwaiter<R> {
    fn new(extras: Arc<PromiseExtras>, project: Project<R>) -> Self {
        Self {
            extras,
            project,
            slot: Arc::new(Mutex::new(None)),
        }
    }
}

struct CompletionHook;

impl CancelableAwaiter for CompletionHook {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        promise.resume_deferred(false);
    }
}

impl<R: Send + 'static> Awaiter for CoroutineAwaiter<R> {
    type Output = R;

    fn is_ready_now(&mut self) -> bool {
        match self.extras.settled(self.project) {
            Some(outcome) => {
                *self.slot.lock() = Some(outcome);
                true
            }
            None => false,
        }
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let hook: Arc<dyn CancelableAwaiter> = Arc::new(CompletionHook);
        if !promise.register_cancelable_awaiter(hook.clone()) {
            promise.resume(false);
            return;
        }

        let promise = promise.clone();
        let project = self.project;
        let slot = self.slot.clone();
        self.extras.add_continuation(Box::new(move |value| {
            if promise.unregister_cancelable_awaiter(&hook) {
                *slot.lock() = Some(project(value.is_some(), value));
                promise.resume(false);
            }
        }));
    }

    fn resume_result(&mut self) -> R {
        match self.slot.lock().take() {
            Some(outcome) => outcome,
            // Resumed without an outcome only on the way to teardown.
            None => (self.project)(false, None),
        }
    }
}
