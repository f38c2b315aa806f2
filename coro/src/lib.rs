//! # RedLilium Coro
//!
//! Coroutine runtime for gameplay code: `async` blocks that run either
//! free-threaded (hopping between the game thread, a worker pool and
//! timers) or frame-ticked on the game thread as latent actions owned by a
//! host object.
//!
//! ## Core Types
//!
//! - [`Coroutine`] - Shared handle to a running coroutine and its result
//! - [`ManualCoroutine`] - Coroutine handle completed by hand
//! - [`Host`] - Entry point for spawning coroutines on an [`Environment`]
//! - [`World`] - Reference host with a game thread queue, worker pool, timer
//!   thread and latent action manager
//! - [`Promise`] - Runtime state of one coroutine, reachable from inside it
//!   via [`Promise::current`]
//!
//! ## Awaiting
//!
//! - [`Awaiter`] / [`Suspension`] - Contract between awaitables and the runtime
//! - [`CancelableAwaiter`] - Hook that lets cancellation interrupt a suspension
//! - [`yield_now`], [`move_to_game_thread`], [`move_to_pool`],
//!   [`platform_seconds`] - Free-threaded awaiters
//! - [`next_tick`], [`ticks`], [`seconds`], [`until`] - Frame-ticked awaiters
//! - [`AwaitableEvent`] / [`AwaitableSemaphore`] - Cancelable synchronization
//! - [`AwaitableDelegate`] - Multicast callback that resumes with its arguments
//! - [`IoRuntime`] - Tokio runtime for futures that need a reactor
//!
//! ## Composition
//!
//! - [`when_all`] / [`when_any`] - Wait on several awaitables at once
//! - [`race`] - First coroutine to finish wins, the rest are canceled
//!
//! ## Cancellation
//!
//! - [`CancellationTracker`] - Cancel flag with a hold counter
//! - [`CancellationGuard`] - Defers cancellation for a scope
//! - [`finish_now_if_canceled`] / [`self_cancel`] - Cooperative exits
//! - [`OnCoroutineCanceled`], [`OnActionAborted`], [`OnObjectDestroyed`],
//!   [`OnAbnormalExit`] - Scoped exit callbacks
//!
//! See `DESIGN.md` at the repository root for architecture decisions.

pub mod aggregate;
mod async_awaiters;
mod awaiter;
mod cancellation;
mod config;
mod coroutine;
mod delegate;
mod error;
pub mod host;
mod io;
pub mod latent_action;
mod latent_awaiters;
mod manual;
mod priority;
mod promise;
#[cfg(test)]
mod test_support;
mod threading;

pub use aggregate::{AggregateAwaiter, ErasedAwaitable, RaceAwaiter, race, when_all, when_any};
pub use async_awaiters::{
    Destination, MoveTo, PlatformTimer, YieldNow, move_to_game_thread, move_to_new_thread,
    move_to_pool, move_to_thread, platform_seconds, until_platform_time, yield_now,
};
pub use awaiter::{Awaiter, CancelableAwaiter, Suspension};
pub use cancellation::{
    CancellationGuard, CancellationTracker, FinishNowIfCanceled, OnAbnormalExit,
    OnActionAborted, OnCoroutineCanceled, OnObjectDestroyed, SelfCancel,
    finish_now_if_canceled, is_current_coroutine_canceled, self_cancel,
};
pub use config::{HostConfig, IO_WORKERS_ENV, WORKERS_ENV};
pub use coroutine::{Coroutine, CoroutineAwaiter};
pub use delegate::{AwaitableDelegate, DelegateHandle, DelegateWait};
pub use error::{CoroutineError, HostError, HostResult};
pub use host::{Environment, Host, Task, TimerId, TimerThread, WorkerPool, World};
pub use io::{IoAwaiter, IoHandle, IoRuntime};
pub use latent_action::{
    LatentActionManager, LatentInfo, LatentResponse, ObjectId, PendingLatentAction,
};
pub use latent_awaiters::{LatentWait, next_tick, seconds, ticks, until, until_time};
pub use manual::ManualCoroutine;
pub use priority::{Priority, ThreadKind};
pub use promise::{ExitReason, LatentState, Promise};
pub use threading::{AwaitableEvent, AwaitableSemaphore, EventMode, EventWait, SemaphoreAcquire};
