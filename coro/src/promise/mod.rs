//! Coroutine promises.
//!
//! A [`Promise`] owns one coroutine frame (a boxed `Future`) and drives it.
//! It is never polled by an executor: the frame advances only when something
//! calls [`Promise::resume`], which is what every awaiter does once the thing
//! it waited for has happened.
//!
//! # Resume protocol
//!
//! At most one thread touches a frame at a time. `resume` claims the frame by
//! moving the run state from idle to running; a resume that arrives while the
//! frame is being polled (from another thread, or synchronously from inside
//! an awaiter's `suspend`) only marks the promise as notified, and the
//! thread that owns the frame polls it again before giving it up.
//!
//! # Cancellation
//!
//! [`Promise::cancel`] only flags the [`CancellationTracker`]. The frame is
//! destroyed (dropped, running its scope guards) by the next `resume` that
//! finds [`CancellationTracker::should_cancel`] true. Awaiters that register
//! themselves with [`Promise::register_cancelable_awaiter`] get their hook
//! invoked by `cancel`, which lets them resume the coroutine early.

mod extras;
pub(crate) mod latent;

pub(crate) use extras::PromiseExtras;
pub use latent::{ExitReason, LatentState};

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::Mutex;

use crate::awaiter::{CancelableAwaiter, same_hook};
use crate::cancellation::CancellationTracker;
use crate::error::CoroutineError;
use crate::host::Host;
use crate::priority::{Priority, ThreadKind};
use latent::LatentPromise;

/// A type-erased coroutine frame producing the boxed return value.
pub(crate) type Frame = Pin<Box<dyn Future<Output = Box<dyn Any + Send>> + Send>>;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const FINISHED: u8 = 3;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique coroutine id.
pub(crate) fn allocate_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static CURRENT: RefCell<Vec<Arc<Promise>>> = const { RefCell::new(Vec::new()) };
}

/// Marks `promise` as the current coroutine of this thread while alive.
struct CoroutineScope;

impl CoroutineScope {
    fn enter(promise: Arc<Promise>) -> Self {
        CURRENT.with(|stack| stack.borrow_mut().push(promise));
        CoroutineScope
    }
}

impl Drop for CoroutineScope {
    fn drop(&mut self) {
        let popped = CURRENT.with(|stack| stack.borrow_mut().pop());
        drop(popped);
    }
}

enum Step {
    Poll,
    Destroy,
    Marshal,
}

enum FramePoll {
    Pending,
    Ready(Box<dyn Any + Send>),
    Panicked(String),
    Gone,
}

/// Re-polls the promise when a foreign future wakes it.
///
/// A wake is not a resume: a [`Suspension`](crate::Suspension) parked on an
/// awaiter stays parked until that awaiter resumes the coroutine.
struct PromiseWaker(Arc<Promise>);

impl Wake for PromiseWaker {
    fn wake(self: Arc<Self>) {
        self.0.wake_deferred();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.wake_deferred();
    }
}

/// State of one running coroutine.
pub struct Promise {
    id: u64,
    name: String,
    host: Host,
    extras: Arc<PromiseExtras>,
    tracker: CancellationTracker,
    run_state: AtomicU8,
    pending_bypass: AtomicBool,
    resumed: AtomicBool,
    destroying: AtomicBool,
    poisoned: Mutex<Option<String>>,
    frame: Mutex<Option<Frame>>,
    latent: Option<LatentPromise>,
}

impl Promise {
    pub(crate) fn new(
        host: Host,
        name: String,
        latent: Option<LatentPromise>,
        frame: Frame,
    ) -> Arc<Self> {
        let id = allocate_id();
        Arc::new_cyclic(|this: &Weak<Promise>| Promise {
            id,
            extras: Arc::new(PromiseExtras::live(id, name.clone(), this.clone())),
            name,
            host,
            tracker: CancellationTracker::new(),
            run_state: AtomicU8::new(IDLE),
            pending_bypass: AtomicBool::new(false),
            resumed: AtomicBool::new(false),
            destroying: AtomicBool::new(false),
            poisoned: Mutex::new(None),
            frame: Mutex::new(Some(frame)),
            latent,
        })
    }

    /// The promise of the coroutine running on this thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a coroutine.
    pub fn current() -> Arc<Promise> {
        Self::try_current()
            .unwrap_or_else(|| panic!("Promise::current() called outside of a coroutine"))
    }

    /// The promise of the coroutine running on this thread, if any.
    pub fn try_current() -> Option<Arc<Promise>> {
        CURRENT.with(|stack| stack.borrow().last().cloned())
    }

    /// Process-unique id, shared with every handle to this coroutine.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn debug_name(&self) -> &str {
        &self.name
    }

    /// The host this coroutine was started on.
    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn tracker(&self) -> &CancellationTracker {
        &self.tracker
    }

    /// Whether this is a frame-ticked coroutine.
    pub fn is_latent(&self) -> bool {
        self.latent.is_some()
    }

    pub(crate) fn latent(&self) -> Option<&LatentPromise> {
        self.latent.as_ref()
    }

    pub(crate) fn extras(&self) -> &Arc<PromiseExtras> {
        &self.extras
    }

    /// Whether the frame is being torn down instead of completing normally.
    pub fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::Acquire)
    }

    /// Whether a pending cancellation applies, honoring cancellation holds
    /// unless `bypass_holds` is set.
    pub fn should_cancel(&self, bypass_holds: bool) -> bool {
        self.tracker.should_cancel(bypass_holds)
    }

    /// Continues the coroutine from its current suspension point, or
    /// destroys it if a cancellation applies.
    ///
    /// Safe to call from any thread. Resuming a finished coroutine does
    /// nothing.
    pub fn resume(self: &Arc<Self>, bypass_holds: bool) {
        self.resumed.store(true, Ordering::Release);
        self.run_now(bypass_holds);
    }

    fn run_now(self: &Arc<Self>, bypass_holds: bool) {
        if bypass_holds {
            self.pending_bypass.store(true, Ordering::Release);
        }

        let mut state = self.run_state.load(Ordering::Acquire);
        loop {
            let claim = match state {
                IDLE => RUNNING,
                RUNNING => NOTIFIED,
                NOTIFIED => return,
                _ => {
                    log::trace!("Ignoring resume of finished coroutine '{}'", self.name);
                    return;
                }
            };
            match self
                .run_state
                .compare_exchange(state, claim, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) if claim == NOTIFIED => return,
                Ok(_) => break,
                Err(actual) => state = actual,
            }
        }

        self.run();
    }

    /// Resumes the coroutine from a freshly scheduled task instead of the
    /// calling stack.
    ///
    /// Latent coroutines are resumed on the game thread, free-threaded ones
    /// on the worker pool.
    pub fn resume_deferred(self: &Arc<Self>, bypass_holds: bool) {
        let this = self.clone();
        if self.is_latent() {
            self.host
                .submit(ThreadKind::Game, move || this.resume(bypass_holds));
        } else {
            self.host
                .submit_pooled(Priority::High, move || this.resume(bypass_holds));
        }
    }

    /// Schedules a poll without resuming the current suspension.
    fn wake_deferred(self: &Arc<Self>) {
        let this = self.clone();
        if self.is_latent() {
            self.host
                .submit(ThreadKind::Game, move || this.run_now(false));
        } else {
            self.host
                .submit_pooled(Priority::High, move || this.run_now(false));
        }
    }

    /// Clears the resume flag before an awaiter suspends the coroutine.
    pub(crate) fn arm_resume(&self) {
        self.resumed.store(false, Ordering::Release);
    }

    /// Consumes the resume flag set by [`resume`](Self::resume).
    pub(crate) fn take_resume(&self) -> bool {
        self.resumed.swap(false, Ordering::AcqRel)
    }

    /// Requests cancellation.
    ///
    /// Never destroys anything synchronously. If the cancellation applies
    /// right away and the coroutine is suspended on a cancelable awaiter,
    /// that awaiter is claimed and told to resume the coroutine early.
    pub fn cancel(self: &Arc<Self>, bypass_holds: bool) {
        let hook = {
            let mut inner = self.extras.lock();
            if !inner.link.is_live() {
                return;
            }
            self.tracker.cancel();
            if self.tracker.should_cancel(bypass_holds) {
                inner.cancelable.take()
            } else {
                None
            }
        };
        log::trace!(
            "Cancel requested for '{}' (bypass: {bypass_holds}, fast path: {})",
            self.name,
            hook.is_some()
        );
        if let Some(hook) = hook {
            hook.cancel(self);
        }
    }

    /// Registers the awaiter this coroutine is about to suspend on as the
    /// target of fast cancellation.
    ///
    /// Returns `false` if the coroutine is already canceled. The caller must
    /// then not register anything externally, and should resume the
    /// coroutine with [`resume_deferred`](Self::resume_deferred) instead.
    pub fn register_cancelable_awaiter(&self, hook: Arc<dyn CancelableAwaiter>) -> bool {
        let mut inner = self.extras.lock();
        if self.tracker.should_cancel(false) {
            return false;
        }
        assert!(
            inner.cancelable.is_none(),
            "Coroutine '{}' registered two cancelable awaiters",
            self.name
        );
        inner.cancelable = Some(hook);
        true
    }

    /// Clears `hook` if it is still the registered cancelable awaiter.
    ///
    /// This is the claim that arbitrates natural completion against
    /// cancellation: only the side that gets `true` here (or the cancel side,
    /// which claims the slot inside [`cancel`](Self::cancel)) may resume the
    /// coroutine.
    pub fn unregister_cancelable_awaiter(&self, hook: &Arc<dyn CancelableAwaiter>) -> bool {
        let mut inner = self.extras.lock();
        match &inner.cancelable {
            Some(current) if same_hook(current, hook) => {
                inner.cancelable = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn detach_from_game_thread(&self) {
        if let Some(latent) = &self.latent {
            latent.detach_from_game_thread(self.host.is_game_thread());
        }
    }

    /// Finishes a latent coroutine whose action is gone, on the game thread.
    ///
    /// While the coroutine is detached the request is only recorded; the
    /// next resume carries it out.
    pub(crate) fn thread_safe_destroy(self: &Arc<Self>) {
        if let Some(latent) = &self.latent
            && latent.defer_destroy()
        {
            log::trace!("Deferring destruction of detached '{}'", self.name);
            return;
        }
        if !self.host.is_game_thread() {
            let this = self.clone();
            self.host
                .submit(ThreadKind::Game, move || this.thread_safe_destroy());
            return;
        }
        self.resume(true);
    }

    /// The latent action driving this coroutine was dropped.
    pub(crate) fn latent_action_destroyed(self: &Arc<Self>) {
        if let Some(latent) = &self.latent {
            latent.action_destroyed();
        }
        self.cancel(true);
        self.thread_safe_destroy();
    }

    /// Cancels this coroutine from inside its own frame.
    pub(crate) fn cancel_from_within(self: &Arc<Self>) {
        if let Some(latent) = &self.latent {
            latent.set_exit_reason(ExitReason::SelfCanceled);
            latent.attach_to_game_thread();
            if self.host.is_game_thread() {
                latent.latent_cancel();
            }
        }
        self.cancel(false);
        assert!(
            self.tracker.should_cancel(false),
            "Coroutines may only cancel themselves while no CancellationGuard is active"
        );
    }

    /// Finishes a coroutine that must not run at all.
    pub(crate) fn refuse_start(&self) {
        self.run_state.store(FINISHED, Ordering::Release);
        self.destroying.store(true, Ordering::Release);
        let frame = self.frame.lock().take();
        drop(frame);
        self.extras
            .complete(Err(CoroutineError::NotStarted), ExitReason::Normal);
    }

    fn run(self: &Arc<Self>) {
        loop {
            let bypass = self.pending_bypass.swap(false, Ordering::AcqRel);
            match self.next_step(bypass) {
                Step::Poll => match self.poll_frame() {
                    FramePoll::Pending => {}
                    FramePoll::Ready(value) => {
                        self.finish(Ok(value));
                        return;
                    }
                    FramePoll::Panicked(message) => {
                        log::error!("Coroutine '{}' panicked: {message}", self.name);
                        *self.poisoned.lock() = Some(message);
                        continue;
                    }
                    FramePoll::Gone => {
                        self.run_state.store(FINISHED, Ordering::Release);
                        return;
                    }
                },
                Step::Destroy => {
                    self.destroy();
                    return;
                }
                Step::Marshal => {
                    self.run_state.store(IDLE, Ordering::Release);
                    let this = self.clone();
                    self.host.submit(ThreadKind::Game, move || this.resume(true));
                    return;
                }
            }

            if self
                .run_state
                .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            // Notified while polling: the resume belongs to this suspension.
            self.run_state.store(RUNNING, Ordering::Release);
        }
    }

    fn next_step(&self, mut bypass: bool) -> Step {
        let poisoned = self.poisoned.lock().is_some();
        let Some(latent) = &self.latent else {
            if poisoned || self.tracker.should_cancel(bypass) {
                return Step::Destroy;
            }
            return Step::Poll;
        };

        let on_game_thread = self.host.is_game_thread();
        let teardown = if on_game_thread {
            Step::Destroy
        } else {
            Step::Marshal
        };
        if poisoned || latent.state() == LatentState::DeferredDestroy {
            return teardown;
        }
        if on_game_thread {
            latent.attach_to_game_thread();
        }
        if !latent.action_alive() {
            bypass = true;
        }
        if self.tracker.should_cancel(bypass) {
            return teardown;
        }
        Step::Poll
    }

    fn poll_frame(self: &Arc<Self>) -> FramePoll {
        let mut slot = self.frame.lock();
        let Some(frame) = slot.as_mut() else {
            return FramePoll::Gone;
        };
        let waker = Waker::from(Arc::new(PromiseWaker(self.clone())));
        let mut cx = Context::from_waker(&waker);

        let _scope = CoroutineScope::enter(self.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| frame.as_mut().poll(&mut cx))) {
            Ok(Poll::Pending) => FramePoll::Pending,
            Ok(Poll::Ready(value)) => {
                *slot = None;
                FramePoll::Ready(value)
            }
            Err(payload) => FramePoll::Panicked(panic_message(payload.as_ref())),
        }
    }

    fn destroy(self: &Arc<Self>) {
        self.destroying.store(true, Ordering::Release);
        let frame = self.frame.lock().take();
        if let Some(frame) = frame {
            let _scope = CoroutineScope::enter(self.clone());
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(frame))) {
                log::error!(
                    "Coroutine '{}' panicked during teardown: {}",
                    self.name,
                    panic_message(payload.as_ref())
                );
            }
        }
        log::trace!("Destroyed coroutine '{}'", self.name);

        let error = match self.poisoned.lock().take() {
            Some(message) => CoroutineError::Panicked(message),
            None => CoroutineError::Canceled,
        };
        self.finish(Err(error));
    }

    fn finish(self: &Arc<Self>, outcome: Result<Box<dyn Any + Send>, CoroutineError>) {
        self.run_state.store(FINISHED, Ordering::Release);
        let Some(latent) = &self.latent else {
            self.extras.complete(outcome, ExitReason::Normal);
            return;
        };

        if outcome.is_ok() {
            latent.mark_done();
        }
        if self.host.is_game_thread() {
            self.extras.complete(outcome, latent.exit_reason());
        } else {
            let extras = self.extras.clone();
            let this = self.clone();
            self.host.submit(ThreadKind::Game, move || {
                let reason = this.latent().map_or(ExitReason::Normal, |l| l.exit_reason());
                extras.complete(outcome, reason);
            });
        }
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        let Some(frame) = self.frame.get_mut().take() else {
            return;
        };
        log::debug!(
            "Coroutine '{}' dropped while suspended, nothing can resume it",
            self.name
        );
        self.destroying.store(true, Ordering::Release);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(frame))) {
            log::error!(
                "Coroutine '{}' panicked during teardown: {}",
                self.name,
                panic_message(payload.as_ref())
            );
        }
        let reason = self
            .latent
            .as_ref()
            .map_or(ExitReason::Normal, |l| l.exit_reason());
        self.extras.complete(Err(CoroutineError::Canceled), reason);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
