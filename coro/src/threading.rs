//! Awaitable synchronization primitives.
//!
//! Both primitives keep a FIFO list of suspended coroutines. Waking one is
//! a claim on its cancelable-awaiter slot: a waiter whose coroutine was
//! canceled in the meantime loses the claim and is skipped, so a trigger or
//! a permit is never consumed by a coroutine that will not observe it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::awaiter::{Awaiter, CancelableAwaiter, Suspension};
use crate::promise::Promise;

static NEXT_WAITER: AtomicU64 = AtomicU64::new(1);

/// Allocates an id unique among all waiters and delegate bindings.
pub(crate) fn next_waiter_id() -> u64 {
    NEXT_WAITER.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) promise: Arc<Promise>,
    hook: Arc<dyn CancelableAwaiter>,
}

impl Waiter {
    /// Wins the race against cancellation, or reports that it lost.
    pub(crate) fn claim(&self) -> bool {
        self.promise.unregister_cancelable_awaiter(&self.hook)
    }
}

/// Registers `promise` as a waiter. Called with the primitive's lock held.
///
/// Returns `None` if the coroutine is already canceled and was resumed so
/// it can be torn down.
pub(crate) fn enqueue<F>(promise: &Arc<Promise>, make_hook: F) -> Option<Waiter>
where
    F: FnOnce(u64) -> Arc<dyn CancelableAwaiter>,
{
    let id = next_waiter_id();
    let hook = make_hook(id);
    if !promise.register_cancelable_awaiter(hook.clone()) {
        promise.resume(false);
        return None;
    }
    Some(Waiter {
        id,
        promise: promise.clone(),
        hook,
    })
}

/// Reset behavior of an [`AwaitableEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    /// A trigger releases exactly one waiter; with no waiters it stays
    /// triggered until the next await consumes it.
    AutoReset,
    /// A trigger releases every waiter and stays triggered until
    /// [`AwaitableEvent::reset`].
    ManualReset,
}

struct EventState {
    triggered: bool,
    waiters: VecDeque<Waiter>,
}

struct EventInner {
    mode: EventMode,
    state: Mutex<EventState>,
}

/// An event coroutines can await.
///
/// Clone is cheap (Arc-wrapped); clones share the same event.
///
/// # Example
///
/// ```ignore
/// let ready = AwaitableEvent::new(EventMode::ManualReset, false);
/// let waiter = ready.clone();
/// host.spawn(async move {
///     waiter.wait().await;
///     log::info!("ready");
/// });
/// ready.trigger();
/// ```
#[derive(Clone)]
pub struct AwaitableEvent {
    inner: Arc<EventInner>,
}

impl AwaitableEvent {
    pub fn new(mode: EventMode, initially_triggered: bool) -> Self {
        Self {
            inner: Arc::new(EventInner {
                mode,
                state: Mutex::new(EventState {
                    triggered: initially_triggered,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn mode(&self) -> EventMode {
        self.inner.mode
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.state.lock().triggered
    }

    /// Number of suspended coroutines.
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Triggers the event, resuming waiters on the calling thread.
    pub fn trigger(&self) {
        let released = {
            let mut state = self.inner.state.lock();
            match self.inner.mode {
                EventMode::AutoReset => {
                    let mut released = Vec::new();
                    loop {
                        let Some(waiter) = state.waiters.pop_front() else {
                            state.triggered = true;
                            break;
                        };
                        if waiter.claim() {
                            released.push(waiter);
                            break;
                        }
                    }
                    released
                }
                EventMode::ManualReset => {
                    state.triggered = true;
                    state.waiters.drain(..).filter(Waiter::claim).collect()
                }
            }
        };
        for waiter in released {
            waiter.promise.resume(false);
        }
    }

    /// Clears the triggered state.
    pub fn reset(&self) {
        self.inner.state.lock().triggered = false;
    }

    /// Suspends until the event is triggered. Cancelable.
    pub fn wait(&self) -> Suspension<EventWait> {
        Suspension::new(EventWait {
            event: self.inner.clone(),
        })
    }
}

impl EventInner {
    /// Consumes the triggered state if set. Called with the lock held.
    fn try_consume(&self, state: &mut EventState) -> bool {
        if !state.triggered {
            return false;
        }
        if self.mode == EventMode::AutoReset {
            state.triggered = false;
        }
        true
    }
}

struct EventHook {
    event: Weak<EventInner>,
    id: u64,
}

impl CancelableAwaiter for EventHook {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        if let Some(event) = self.event.upgrade() {
            event.state.lock().waiters.retain(|waiter| waiter.id != self.id);
        }
        promise.resume_deferred(false);
    }
}

/// Awaiter behind [`AwaitableEvent::wait`].
pub struct EventWait {
    event: Arc<EventInner>,
}

impl Awaiter for EventWait {
    type Output = ();

    fn is_ready_now(&mut self) -> bool {
        let mut state = self.event.state.lock();
        self.event.try_consume(&mut state)
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let mut state = self.event.state.lock();
        if self.event.try_consume(&mut state) {
            drop(state);
            promise.resume(false);
            return;
        }
        let event = Arc::downgrade(&self.event);
        let waiter = enqueue(promise, |id| Arc::new(EventHook { event, id }));
        if let Some(waiter) = waiter {
            state.waiters.push_back(waiter);
        }
    }

    fn resume_result(&mut self) {}
}

struct SemaphoreWaiter {
    waiter: Waiter,
    granted: Arc<AtomicBool>,
}

struct SemaphoreState {
    count: usize,
    waiters: VecDeque<SemaphoreWaiter>,
}

struct SemaphoreInner {
    capacity: usize,
    state: Mutex<SemaphoreState>,
}

impl SemaphoreInner {
    fn release(&self, permits: usize) {
        let released = {
            let mut state = self.state.lock();
            state.count = (state.count + permits).min(self.capacity);
            let mut released = Vec::new();
            while state.count > 0 {
                let Some(next) = state.waiters.pop_front() else {
                    break;
                };
                if next.waiter.claim() {
                    state.count -= 1;
                    next.granted.store(true, Ordering::Release);
                    released.push(next.waiter);
                }
            }
            released
        };
        for waiter in released {
            waiter.promise.resume(false);
        }
    }
}

/// A counting semaphore coroutines can await.
///
/// Clone is cheap (Arc-wrapped); clones share the same permits.
#[derive(Clone)]
pub struct AwaitableSemaphore {
    inner: Arc<SemaphoreInner>,
}

impl AwaitableSemaphore {
    /// A semaphore holding at most `capacity` permits, starting with
    /// `initial` (clamped to `capacity`).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize, initial: usize) -> Self {
        assert!(capacity > 0, "Semaphore capacity must be positive");
        Self {
            inner: Arc::new(SemaphoreInner {
                capacity,
                state: Mutex::new(SemaphoreState {
                    count: initial.min(capacity),
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently available.
    pub fn count(&self) -> usize {
        self.inner.state.lock().count
    }

    /// Takes a permit without waiting.
    pub fn try_lock(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.count == 0 {
            return false;
        }
        state.count -= 1;
        true
    }

    /// Returns `permits` permits, waking waiters in FIFO order on the
    /// calling thread. The count never exceeds the capacity.
    pub fn unlock(&self, permits: usize) {
        self.inner.release(permits);
    }

    /// Suspends until a permit is available, then takes it. Cancelable.
    pub fn acquire(&self) -> Suspension<SemaphoreAcquire> {
        Suspension::new(SemaphoreAcquire {
            semaphore: self.inner.clone(),
            granted: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct SemaphoreHook {
    semaphore: Weak<SemaphoreInner>,
    id: u64,
}

impl CancelableAwaiter for SemaphoreHook {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        if let Some(semaphore) = self.semaphore.upgrade() {
            semaphore
                .state
                .lock()
                .waiters
                .retain(|next| next.waiter.id != self.id);
        }
        promise.resume_deferred(false);
    }
}

/// Awaiter behind [`AwaitableSemaphore::acquire`].
///
/// A permit handed to a coroutine that is torn down before observing it is
/// returned to the semaphore.
pub struct SemaphoreAcquire {
    semaphore: Arc<SemaphoreInner>,
    granted: Arc<AtomicBool>,
}

impl Awaiter for SemaphoreAcquire {
    type Output = ();

    fn is_ready_now(&mut self) -> bool {
        let mut state = self.semaphore.state.lock();
        if state.count == 0 {
            return false;
        }
        state.count -= 1;
        true
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let mut state = self.semaphore.state.lock();
        if state.count > 0 {
            state.count -= 1;
            self.granted.store(true, Ordering::Release);
            drop(state);
            promise.resume(false);
            return;
        }
        let semaphore = Arc::downgrade(&self.semaphore);
        let waiter = enqueue(promise, |id| Arc::new(SemaphoreHook { semaphore, id }));
        if let Some(waiter) = waiter {
            state.waiters.push_back(SemaphoreWaiter {
                waiter,
                granted: self.granted.clone(),
            });
        }
    }

    fn resume_result(&mut self) {
        self.granted.store(false, Ordering::Release);
    }
}

impl Drop for SemaphoreAcquire {
    fn drop(&mut self) {
        if self.granted.swap(false, Ordering::AcqRel) {
            log::debug!("Returning semaphore permit of a torn down waiter");
            self.semaphore.release(1);
        }
    }
}
