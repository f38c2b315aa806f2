//! Frame-ticked promise state.
//!
//! A latent coroutine belongs to the game thread: it is registered with the
//! host's [`LatentActionManager`] as a [`PendingLatentCoroutine`], ticked
//! once per frame, and always torn down on the game thread. It may still
//! leave the game thread between suspension points (for example to wait on
//! a worker or a timer). While it is "on loan" like that it is detached, and
//! a destruction request from the action manager is deferred until it comes
//! back.
//!
//! ```text
//!                 detach              defer_destroy
//! LatentRunning ---------> AsyncRunning -----------> DeferredDestroy
//!      ^   |    <---------                                  |
//!      |   |      attach                                    | next resume
//!      |   | latent_cancel                                  v
//!      |   +-------------> Canceled ----------------> (destroyed on GT)
//!      |
//!      +-- frame returns --> Done
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;

use super::Promise;
use crate::latent_action::{
    LatentActionManager, LatentInfo, LatentResponse, PendingLatentAction,
};

/// Why a latent coroutine is ending. Written at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitReason {
    /// Completed, or canceled through its handle.
    Normal = 0,
    /// The owner object was destroyed.
    ObjectDestroyed = 1,
    /// The action manager removed the action.
    ActionAborted = 2,
    /// The coroutine canceled itself.
    SelfCanceled = 3,
}

impl ExitReason {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ExitReason::ObjectDestroyed,
            2 => ExitReason::ActionAborted,
            3 => ExitReason::SelfCanceled,
            _ => ExitReason::Normal,
        }
    }
}

/// Latent coroutine ownership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LatentState {
    /// Owned by the game thread; the pending action may tick it.
    LatentRunning = 0,
    /// Temporarily running or waiting off the game thread.
    AsyncRunning = 1,
    /// Destruction requested while detached; finished on the next resume.
    DeferredDestroy = 2,
    /// Canceled on the game thread; the action finishes next tick.
    Canceled = 3,
    /// The frame returned normally.
    Done = 4,
}

impl LatentState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LatentState::LatentRunning,
            1 => LatentState::AsyncRunning,
            2 => LatentState::DeferredDestroy,
            3 => LatentState::Canceled,
            _ => LatentState::Done,
        }
    }
}

/// Polled once per tick on the game thread; `true` resumes the coroutine.
pub(crate) type LatentPoll = Box<dyn FnMut(&dyn LatentActionManager) -> bool + Send>;

pub(crate) struct LatentPromise {
    info: LatentInfo,
    state: AtomicU8,
    exit_reason: AtomicU8,
    action_alive: AtomicBool,
    current_wait: Mutex<Option<LatentPoll>>,
}

impl LatentPromise {
    pub(crate) fn new(info: LatentInfo) -> Self {
        Self {
            info,
            state: AtomicU8::new(LatentState::LatentRunning as u8),
            exit_reason: AtomicU8::new(ExitReason::Normal as u8),
            action_alive: AtomicBool::new(true),
            current_wait: Mutex::new(None),
        }
    }

    pub(crate) fn info(&self) -> LatentInfo {
        self.info
    }

    pub(crate) fn state(&self) -> LatentState {
        LatentState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: LatentState, to: LatentState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// `AsyncRunning -> LatentRunning`; no-op in any other state.
    pub(crate) fn attach_to_game_thread(&self) {
        if self.transition(LatentState::AsyncRunning, LatentState::LatentRunning) {
            log::trace!("Latent coroutine {:?} attached", self.info);
        }
    }

    /// `LatentRunning -> AsyncRunning`; idempotent while detached.
    ///
    /// # Panics
    ///
    /// Panics if the first detachment happens off the game thread.
    pub(crate) fn detach_from_game_thread(&self, on_game_thread: bool) {
        match self.state() {
            LatentState::LatentRunning => {
                assert!(
                    on_game_thread,
                    "Latent coroutine {:?} detached off the game thread",
                    self.info
                );
                if self.transition(LatentState::LatentRunning, LatentState::AsyncRunning) {
                    log::trace!("Latent coroutine {:?} detached", self.info);
                }
            }
            LatentState::AsyncRunning | LatentState::DeferredDestroy => {}
            LatentState::Canceled | LatentState::Done => {}
        }
    }

    /// `AsyncRunning -> DeferredDestroy`. Returns `true` if destruction
    /// was deferred.
    pub(crate) fn defer_destroy(&self) -> bool {
        self.transition(LatentState::AsyncRunning, LatentState::DeferredDestroy)
    }

    /// `LatentRunning -> Canceled`.
    pub(crate) fn latent_cancel(&self) -> bool {
        self.transition(LatentState::LatentRunning, LatentState::Canceled)
    }

    pub(crate) fn mark_done(&self) {
        self.state.store(LatentState::Done as u8, Ordering::Release);
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.state() == LatentState::LatentRunning
    }

    pub(crate) fn action_alive(&self) -> bool {
        self.action_alive.load(Ordering::Acquire)
    }

    pub(crate) fn action_destroyed(&self) {
        let was_alive = self.action_alive.swap(false, Ordering::AcqRel);
        assert!(was_alive, "Latent action {:?} destroyed twice", self.info);
        self.current_wait.lock().take();
    }

    pub(crate) fn exit_reason(&self) -> ExitReason {
        ExitReason::from_u8(self.exit_reason.load(Ordering::Acquire))
    }

    /// Records why the coroutine is ending. The first reason sticks.
    pub(crate) fn set_exit_reason(&self, reason: ExitReason) {
        if let Err(existing) = self.exit_reason.compare_exchange(
            ExitReason::Normal as u8,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            let existing = ExitReason::from_u8(existing);
            if existing != reason {
                log::warn!(
                    "Latent coroutine {:?} already exiting with {existing:?}, ignoring {reason:?}",
                    self.info
                );
            }
        }
    }

    /// Installs the latent wait polled by the pending action each tick.
    pub(crate) fn set_current_wait(&self, wait: LatentPoll) {
        let mut slot = self.current_wait.lock();
        assert!(
            slot.is_none(),
            "Latent coroutine {:?} awaited two latent awaiters at once",
            self.info
        );
        *slot = Some(wait);
    }

    /// Polls the current latent wait; `true` if it just finished.
    fn poll_current_wait(&self, manager: &dyn LatentActionManager) -> bool {
        let Some(mut wait) = self.current_wait.lock().take() else {
            return false;
        };
        if wait(manager) {
            return true;
        }
        let mut slot = self.current_wait.lock();
        if slot.is_none() && self.action_alive() {
            *slot = Some(wait);
        }
        false
    }
}

/// Adapter registering a latent coroutine with the action manager.
///
/// Holds the promise strongly: as long as the action is registered, the
/// coroutine can be ticked. Dropping the adapter forces the coroutine to
/// finish.
pub(crate) struct PendingLatentCoroutine {
    promise: Arc<Promise>,
}

impl PendingLatentCoroutine {
    pub(crate) fn new(promise: Arc<Promise>) -> Self {
        Self { promise }
    }

    fn latent(&self) -> &LatentPromise {
        self.promise
            .latent()
            .unwrap_or_else(|| panic!("Latent action wraps a free-threaded coroutine"))
    }
}

impl PendingLatentAction for PendingLatentCoroutine {
    fn update(&mut self, manager: &dyn LatentActionManager) -> LatentResponse {
        if self.latent().poll_current_wait(manager) {
            // Might install the next wait.
            self.promise.resume(false);
        }

        let latent = self.latent();
        match latent.state() {
            LatentState::Done => return LatentResponse::FinishedFireContinuation,
            LatentState::Canceled => return LatentResponse::FinishedNoContinuation,
            _ => {}
        }
        let extras = self.promise.extras();
        if extras.is_done() {
            return if extras.was_successful() {
                LatentResponse::FinishedFireContinuation
            } else {
                LatentResponse::FinishedNoContinuation
            };
        }
        if latent.is_attached() && self.promise.should_cancel(false) {
            return LatentResponse::FinishedNoContinuation;
        }
        LatentResponse::KeepWaiting
    }

    fn notify_aborted(&mut self) {
        self.latent().set_exit_reason(ExitReason::ActionAborted);
    }

    fn notify_owner_destroyed(&mut self) {
        self.latent().set_exit_reason(ExitReason::ObjectDestroyed);
    }
}

impl Drop for PendingLatentCoroutine {
    fn drop(&mut self) {
        log::debug!("Latent action {:?} destroyed", self.latent().info());
        self.promise.latent_action_destroyed();
    }
}
