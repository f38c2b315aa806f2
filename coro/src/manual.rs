use std::future::IntoFuture;
use std::sync::Arc;

use crate::awaiter::Suspension;
use crate::coroutine::{Coroutine, CoroutineAwaiter};
use crate::error::CoroutineError;
use crate::promise::{self, ExitReason, PromiseExtras};

/// A coroutine that finishes when its result is set by hand.
///
/// Wraps callback-based code so it can be awaited, combined and observed
/// like any other [`Coroutine`]. Clones share the same coroutine; dropping
/// the last clone before a result was set cancels it. Plain handles from
/// [`handle`](Self::handle) do not keep it alive.
///
/// # Example
///
/// ```
/// use redlilium_coro::ManualCoroutine;
///
/// let loaded = ManualCoroutine::<u32>::new();
/// let handle = loaded.handle();
/// loaded.set_result(7);
/// assert_eq!(handle.result(), Ok(7));
/// ```
pub struct ManualCoroutine<T> {
    owner: Arc<ManualOwner<T>>,
}

struct ManualOwner<T> {
    handle: Coroutine<T>,
}

impl<T> Drop for ManualOwner<T> {
    fn drop(&mut self) {
        if self
            .handle
            .extras()
            .try_complete(Err(CoroutineError::Canceled), ExitReason::Normal)
        {
            log::debug!(
                "Manual coroutine '{}' dropped without a result",
                self.handle.debug_name()
            );
        }
    }
}

impl<T: Send + 'static> ManualCoroutine<T> {
    pub fn new() -> Self {
        Self::named("manual")
    }

    pub fn named(name: impl Into<String>) -> Self {
        let extras = PromiseExtras::manual(promise::allocate_id(), name.into());
        Self {
            owner: Arc::new(ManualOwner {
                handle: Coroutine::from_extras(Arc::new(extras)),
            }),
        }
    }

    /// Completes the coroutine successfully with `value`.
    ///
    /// Continuations run on the calling thread before this returns. Setting
    /// the result of a finished coroutine logs an error and drops `value`.
    pub fn set_result(&self, value: T) {
        if !self.try_set_result(value) {
            log::error!(
                "Manual coroutine '{}' was already complete",
                self.owner.handle.debug_name()
            );
        }
    }

    /// Completes the coroutine with `value`. Returns `false`, dropping
    /// `value`, if it already finished or was canceled.
    pub fn try_set_result(&self, value: T) -> bool {
        self.owner
            .handle
            .extras()
            .try_complete(Ok(Box::new(value)), ExitReason::Normal)
    }

    /// A non-owning handle to the same coroutine.
    pub fn handle(&self) -> Coroutine<T> {
        self.owner.handle.clone()
    }

    pub fn is_done(&self) -> bool {
        self.owner.handle.is_done()
    }
}

impl<T: Send + 'static> Default for ManualCoroutine<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for ManualCoroutine<T> {
    fn clone(&self) -> Self {
        Self {
            owner: self.owner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> IntoFuture for &ManualCoroutine<T> {
    type Output = Option<T>;
    type IntoFuture = Suspension<CoroutineAwaiter<Option<T>>>;

    fn into_future(self) -> Self::IntoFuture {
        self.owner.handle.clone().into_future()
    }
}
