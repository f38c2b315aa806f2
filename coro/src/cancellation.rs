//! Cooperative cancellation.
//!
//! Canceling a coroutine never interrupts it mid-statement. The request is
//! recorded in the coroutine's [`CancellationTracker`] and processed at the
//! next suspension point, where the frame is dropped instead of resumed.
//! Drop guards inside the coroutine body run as usual, which is how
//! [`OnCoroutineCanceled`] and the latent exit callbacks observe it.
//!
//! [`CancellationGuard`] defers cancellation for a region of code:
//!
//! ```ignore
//! host.spawn(async {
//!     {
//!         let _guard = CancellationGuard::new();
//!         // A cancellation arriving here waits for the guard to drop.
//!         write_save_game().await;
//!     }
//!     // ...and takes effect at this await.
//!     move_to_game_thread().await;
//! });
//! ```

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use crate::awaiter::{Awaiter, Suspension};
use crate::promise::{ExitReason, Promise};

/// Canceled flag plus a hold count.
///
/// `should_cancel(bypass)` is `canceled && (bypass || holds == 0)`.
#[derive(Debug, Default)]
pub struct CancellationTracker {
    canceled: AtomicBool,
    holds: AtomicI32,
}

impl CancellationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the tracker canceled. Idempotent.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    /// Defers cancellation until the matching [`release`](Self::release).
    pub fn hold(&self) {
        self.holds.fetch_add(1, Ordering::AcqRel);
    }

    /// Ends a [`hold`](Self::hold).
    ///
    /// # Panics
    ///
    /// Panics on an unbalanced release.
    pub fn release(&self) {
        let previous = self.holds.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Unbalanced cancellation hold release");
    }

    /// Whether a cancellation was ever requested, regardless of holds.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Number of active holds.
    pub fn holds(&self) -> i32 {
        self.holds.load(Ordering::Acquire)
    }

    /// Whether the next suspension point should cancel.
    pub fn should_cancel(&self, bypass_holds: bool) -> bool {
        self.is_canceled() && (bypass_holds || self.holds() == 0)
    }
}

/// Defers cancellation of the current coroutine while alive.
///
/// Guards nest. A cancellation requested while any guard is alive is
/// processed at the first suspension point after the outermost one drops.
/// Forced cancellation (a latent coroutine losing its action) ignores
/// guards.
///
/// # Panics
///
/// [`new`](Self::new) panics outside of a coroutine.
pub struct CancellationGuard {
    promise: Weak<Promise>,
}

impl CancellationGuard {
    pub fn new() -> Self {
        let promise = Promise::current();
        promise.tracker().hold();
        Self {
            promise: Arc::downgrade(&promise),
        }
    }
}

impl Default for CancellationGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        if let Some(promise) = self.promise.upgrade() {
            promise.tracker().release();
        }
    }
}

/// Whether the current coroutine was asked to cancel, ignoring guards.
///
/// # Panics
///
/// Panics outside of a coroutine.
pub fn is_current_coroutine_canceled() -> bool {
    Promise::current().should_cancel(true)
}

/// Awaiter behind [`finish_now_if_canceled`].
pub struct FinishNowIfCanceled;

impl Awaiter for FinishNowIfCanceled {
    type Output = ();

    fn is_ready_now(&mut self) -> bool {
        !Promise::current().should_cancel(false)
    }

    fn keeps_latent_attached(&self) -> bool {
        true
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        // The frame is running, so this only flags it; teardown follows as
        // soon as the poll returns.
        promise.resume(false);
    }

    fn resume_result(&mut self) {}
}

/// Ends the current coroutine right here if a cancellation applies.
///
/// Completes immediately otherwise. Useful in long loops without other
/// suspension points.
pub fn finish_now_if_canceled() -> Suspension<FinishNowIfCanceled> {
    Suspension::new(FinishNowIfCanceled)
}

/// Awaiter behind [`self_cancel`].
pub struct SelfCancel;

impl Awaiter for SelfCancel {
    type Output = ();

    fn is_ready_now(&mut self) -> bool {
        false
    }

    fn keeps_latent_attached(&self) -> bool {
        true
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        promise.cancel_from_within();
        promise.resume(false);
    }

    fn resume_result(&mut self) {}
}

/// Cancels the current coroutine from within. The await never completes.
///
/// Latent coroutines are moved back to the game thread for teardown and
/// report [`ExitReason::SelfCanceled`].
///
/// # Panics
///
/// Panics if a [`CancellationGuard`] is active.
pub fn self_cancel() -> Suspension<SelfCancel> {
    Suspension::new(SelfCancel)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitTrigger {
    Canceled,
    ActionAborted,
    ObjectDestroyed,
    AbnormalExit,
}

/// Runs a callback on drop if the coroutine frame is being torn down for
/// the given reason.
struct ExitCallback<F: FnOnce()> {
    promise: Weak<Promise>,
    trigger: ExitTrigger,
    callback: Option<F>,
}

impl<F: FnOnce()> ExitCallback<F> {
    fn new(trigger: ExitTrigger, callback: F) -> Self {
        let promise = Promise::current();
        if trigger != ExitTrigger::Canceled {
            assert!(
                promise.is_latent(),
                "Latent exit callbacks require a latent coroutine"
            );
        }
        Self {
            promise: Arc::downgrade(&promise),
            trigger,
            callback: Some(callback),
        }
    }

    fn should_fire(&self) -> bool {
        let Some(promise) = self.promise.upgrade() else {
            // Dropped with nobody left to resume it.
            return matches!(self.trigger, ExitTrigger::Canceled | ExitTrigger::AbnormalExit);
        };
        if !promise.is_destroying() {
            return false;
        }
        let reason = promise
            .latent()
            .map_or(ExitReason::Normal, |latent| latent.exit_reason());
        match self.trigger {
            ExitTrigger::Canceled => promise.tracker().is_canceled(),
            ExitTrigger::ActionAborted => reason == ExitReason::ActionAborted,
            ExitTrigger::ObjectDestroyed => reason == ExitReason::ObjectDestroyed,
            ExitTrigger::AbnormalExit => true,
        }
    }
}

impl<F: FnOnce()> Drop for ExitCallback<F> {
    fn drop(&mut self) {
        if self.should_fire()
            && let Some(callback) = self.callback.take()
        {
            callback();
        }
    }
}

macro_rules! exit_callback {
    ($(#[$doc:meta])* $name:ident, $trigger:expr) => {
        $(#[$doc])*
        #[must_use = "the callback only runs when this guard is dropped"]
        pub struct $name<F: FnOnce()>(ExitCallback<F>);

        impl<F: FnOnce()> $name<F> {
            pub fn new(callback: F) -> Self {
                Self(ExitCallback::new($trigger, callback))
            }

            /// Disarms the callback.
            pub fn release(mut self) {
                self.0.callback = None;
            }
        }
    };
}

exit_callback!(
    /// Runs `callback` if the current coroutine is destroyed by cancellation
    /// while this guard is in scope.
    OnCoroutineCanceled,
    ExitTrigger::Canceled
);

exit_callback!(
    /// Runs `callback` if the current latent coroutine ends because its
    /// action was removed by the action manager.
    OnActionAborted,
    ExitTrigger::ActionAborted
);

exit_callback!(
    /// Runs `callback` if the current latent coroutine ends because its
    /// owner object was destroyed.
    OnObjectDestroyed,
    ExitTrigger::ObjectDestroyed
);

exit_callback!(
    /// Runs `callback` if the current latent coroutine ends in any way other
    /// than returning normally.
    OnAbnormalExit,
    ExitTrigger::AbnormalExit
);
