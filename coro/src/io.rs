use std::future::{Future, IntoFuture};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::awaiter::{Awaiter, CancelableAwaiter, Suspension};
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::promise::Promise;

/// Runtime for real async IO futures.
///
/// Coroutines are never polled by an executor, so futures that need a
/// reactor (sockets, files, tokio timers) run here instead and coroutines
/// await the resulting [`IoHandle`]. Native only: a tokio multi-thread
/// runtime with [`HostConfig::io_worker_threads`] workers.
///
/// Clone is cheap (Arc-wrapped); capture it in coroutines to do IO from
/// anywhere.
///
/// # Example
///
/// ```ignore
/// let io = world.io().clone();
/// host.spawn(async move {
///     let text = io.run(async { tokio::fs::read_to_string("config.ron").await }).await;
///     move_to_game_thread().await;
///     apply(text);
/// });
/// ```
#[derive(Clone)]
pub struct IoRuntime {
    inner: Arc<IoRuntimeInner>,
}

struct IoRuntimeInner {
    runtime: Option<tokio::runtime::Runtime>,
}

impl Drop for IoRuntimeInner {
    fn drop(&mut self) {
        // The last clone may be dropped on a runtime thread, where a
        // blocking shutdown panics.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl IoRuntime {
    pub fn new(config: &HostConfig) -> HostResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_worker_threads.max(1))
            .thread_name(format!("{}-io", config.thread_name_prefix))
            .enable_all()
            .build()
            .map_err(HostError::IoRuntime)?;

        Ok(Self {
            inner: Arc::new(IoRuntimeInner {
                runtime: Some(runtime),
            }),
        })
    }

    /// Spawns `future` on the IO runtime.
    pub fn run<T, F>(&self, future: F) -> IoHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let slot = Arc::new(IoSlot {
            state: Mutex::new(SlotState {
                value: None,
                done: false,
                waiter: None,
            }),
            done: Condvar::new(),
        });

        let sender = SlotSender {
            slot: Some(slot.clone()),
        };
        let abort = self.inner.runtime.as_ref().map(|runtime| {
            runtime
                .spawn(async move {
                    let value = future.await;
                    sender.send(value);
                })
                .abort_handle()
        });

        IoHandle { slot, abort }
    }
}

struct SlotState<T> {
    value: Option<T>,
    done: bool,
    waiter: Option<(Arc<Promise>, Arc<dyn CancelableAwaiter>)>,
}

struct IoSlot<T> {
    state: Mutex<SlotState<T>>,
    done: Condvar,
}

impl<T> IoSlot<T> {
    fn fulfill(&self, value: Option<T>) {
        let waiter = {
            let mut state = self.state.lock();
            state.value = value;
            state.done = true;
            self.done.notify_all();
            state.waiter.take()
        };
        if let Some((promise, hook)) = waiter
            && promise.unregister_cancelable_awaiter(&hook)
        {
            promise.resume(false);
        }
    }
}

/// Completes the slot with `None` if the IO task is dropped before sending.
struct SlotSender<T> {
    slot: Option<Arc<IoSlot<T>>>,
}

impl<T> SlotSender<T> {
    fn send(mut self, value: T) {
        if let Some(slot) = self.slot.take() {
            slot.fulfill(Some(value));
        }
    }
}

impl<T> Drop for SlotSender<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.fulfill(None);
        }
    }
}

/// Handle to a future running on an [`IoRuntime`].
///
/// Await it from a coroutine (cancelable: canceling the coroutine aborts
/// the IO task), or poll it with [`try_recv`](Self::try_recv).
pub struct IoHandle<T> {
    slot: Arc<IoSlot<T>>,
    abort: Option<tokio::task::AbortHandle>,
}

impl<T> IoHandle<T> {
    /// Takes the result without blocking. `None` while running, after the
    /// result was taken, or if the task was aborted.
    pub fn try_recv(&self) -> Option<T> {
        self.slot.state.lock().value.take()
    }

    pub fn is_finished(&self) -> bool {
        self.slot.state.lock().done
    }

    /// Blocks until the task completes and returns the result.
    ///
    /// Returns `None` if the task was aborted or panicked.
    ///
    /// # Warning
    ///
    /// This blocks the calling thread. Prefer `.await` in coroutines.
    pub fn recv(self) -> Option<T> {
        let mut state = self.slot.state.lock();
        while !state.done {
            self.slot.done.wait(&mut state);
        }
        state.value.take()
    }
}

impl<T: Send + 'static> IntoFuture for IoHandle<T> {
    type Output = Option<T>;
    type IntoFuture = Suspension<IoAwaiter<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Suspension::new(IoAwaiter { handle: self })
    }
}

struct IoHook<T> {
    slot: Weak<IoSlot<T>>,
    abort: Option<tokio::task::AbortHandle>,
}

impl<T: Send + 'static> CancelableAwaiter for IoHook<T> {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        if let Some(slot) = self.slot.upgrade() {
            slot.state.lock().waiter = None;
        }
        if let Some(abort) = &self.abort {
            abort.abort();
        }
        promise.resume_deferred(false);
    }
}

/// Awaiter behind awaiting an [`IoHandle`].
pub struct IoAwaiter<T> {
    handle: IoHandle<T>,
}

impl<T: Send + 'static> Awaiter for IoAwaiter<T> {
    type Output = Option<T>;

    fn is_ready_now(&mut self) -> bool {
        self.handle.is_finished()
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let mut state = self.handle.slot.state.lock();
        if state.done {
            drop(state);
            promise.resume(false);
            return;
        }
        let hook: Arc<dyn CancelableAwaiter> = Arc::new(IoHook {
            slot: Arc::downgrade(&self.handle.slot),
            abort: self.handle.abort.clone(),
        });
        if !promise.register_cancelable_awaiter(hook.clone()) {
            drop(state);
            promise.resume(false);
            return;
        }
        state.waiter = Some((promise.clone(), hook));
    }

    fn resume_result(&mut self) -> Option<T> {
        self.handle.try_recv()
    }
}
