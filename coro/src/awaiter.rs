//! The awaiter contract.
//!
//! Every leaf suspension point (timers, events, semaphores, delegates,
//! thread hops, latent waits, other coroutines) implements [`Awaiter`] and is
//! awaited through the [`Suspension`] future. The contract mirrors a
//! hand-written coroutine awaiter:
//!
//! 1. [`is_ready_now`](Awaiter::is_ready_now): may the coroutine skip
//!    suspending entirely?
//! 2. [`suspend`](Awaiter::suspend): called only when not ready. It must
//!    arrange for [`Promise::resume`] to be called exactly once later, from
//!    any thread (possibly before `suspend` even returns).
//! 3. [`resume_result`](Awaiter::resume_result): produces the value of the
//!    `.await` expression once resumed.
//!
//! # Fast cancellation
//!
//! An awaiter that can abandon its wait registers a [`CancelableAwaiter`]
//! hook with [`Promise::register_cancelable_awaiter`] inside `suspend`. From
//! then on two sides race to resume the coroutine:
//!
//! - the completion side calls [`Promise::unregister_cancelable_awaiter`]
//!   and resumes only if that returns `true`;
//! - the cancel side is [`Promise::cancel`], which claims the hook and calls
//!   [`CancelableAwaiter::cancel`]. The hook tears down its registration and
//!   schedules [`Promise::resume_deferred`], never an inline resume.
//!
//! Exactly one side wins; the loser must do nothing.
//!
//! A suspended [`Suspension`] completes only after such a resume. Wakes of
//! ordinary futures polled by the same coroutine re-poll it, but it stays
//! parked.
//!
//! # Example
//!
//! ```ignore
//! struct Flag(Arc<Mutex<Option<Arc<Promise>>>>);
//!
//! impl Awaiter for Flag {
//!     type Output = ();
//!     fn is_ready_now(&mut self) -> bool { false }
//!     fn suspend(&mut self, promise: &Arc<Promise>) {
//!         *self.0.lock() = Some(promise.clone());
//!     }
//!     fn resume_result(&mut self) {}
//! }
//!
//! // Somewhere else, exactly once:
//! if let Some(promise) = slot.lock().take() {
//!     promise.resume(false);
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::promise::Promise;

/// A leaf suspension point.
pub trait Awaiter: Send {
    /// Value produced by the `.await` expression.
    type Output;

    /// Whether the coroutine can continue without suspending.
    fn is_ready_now(&mut self) -> bool;

    /// Suspends `promise` and arranges for exactly one later resume.
    fn suspend(&mut self, promise: &Arc<Promise>);

    /// Produces the result after the coroutine was resumed (or when it did
    /// not need to suspend).
    fn resume_result(&mut self) -> Self::Output;

    /// Whether a latent coroutine stays attached to the game thread while
    /// suspended here. Awaiters resumed by the latent action manager itself
    /// return `true`; everything else detaches.
    fn keeps_latent_attached(&self) -> bool {
        false
    }
}

/// Fast-cancellation hook of an awaiter.
pub trait CancelableAwaiter: Send + Sync {
    /// Called once, after the promise claimed this hook. Must undo the
    /// awaiter's registration and schedule a deferred resume.
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>);
}

/// Compares two hooks by identity.
pub(crate) fn same_hook(a: &Arc<dyn CancelableAwaiter>, b: &Arc<dyn CancelableAwaiter>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SuspensionState {
    Fresh,
    Suspended,
    Spent,
}

/// Future awaiting an [`Awaiter`] from inside a coroutine.
///
/// The first poll either completes immediately or suspends. Later polls
/// complete only once the awaiter has called [`Promise::resume`]; wakes of
/// other futures in the same coroutine leave it suspended. Polling a
/// completed suspension panics.
#[must_use = "awaiters do nothing unless `.await`ed"]
pub struct Suspension<A> {
    awaiter: A,
    state: SuspensionState,
}

impl<A: Awaiter> Suspension<A> {
    pub fn new(awaiter: A) -> Self {
        Self {
            awaiter,
            state: SuspensionState::Fresh,
        }
    }

    /// The wrapped awaiter.
    pub fn awaiter(&self) -> &A {
        &self.awaiter
    }
}

impl<A: Awaiter + Unpin> Future for Suspension<A> {
    type Output = A::Output;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<A::Output> {
        let this = self.get_mut();
        match this.state {
            SuspensionState::Fresh => {
                if this.awaiter.is_ready_now() {
                    this.state = SuspensionState::Spent;
                    return Poll::Ready(this.awaiter.resume_result());
                }
                let promise = Promise::current();
                if !this.awaiter.keeps_latent_attached() {
                    promise.detach_from_game_thread();
                }
                this.state = SuspensionState::Suspended;
                promise.arm_resume();
                this.awaiter.suspend(&promise);
                Poll::Pending
            }
            SuspensionState::Suspended => {
                if !Promise::current().take_resume() {
                    return Poll::Pending;
                }
                this.state = SuspensionState::Spent;
                Poll::Ready(this.awaiter.resume_result())
            }
            SuspensionState::Spent => panic!("Awaiter polled after it was resumed"),
        }
    }
}
