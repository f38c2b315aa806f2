//! Combinators awaiting several things at once.
//!
//! [`when_all`] and [`when_any`] accept anything awaitable. Each argument is
//! awaited by its own internal consumer coroutine; consumers count down a
//! shared counter when they finish (successfully or not), and the one that
//! reaches zero resumes the outer coroutine. [`race`] works on coroutine
//! handles directly and cancels every participant but the first to finish.
//!
//! All three produce the index of the participant that completed the
//! aggregate, or `None` when given nothing to wait for.
//!
//! ```ignore
//! let first = when_any(vec![ticks(3), ticks(1)]).await;
//! assert_eq!(first, Some(1));
//!
//! // Heterogeneous arguments
//! when_all!(event.wait(), semaphore.acquire(), child).await;
//! ```

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::awaiter::{Awaiter, CancelableAwaiter, Suspension};
use crate::coroutine::Coroutine;
use crate::host::Host;
use crate::promise::Promise;

/// A type-erased awaitable, used by [`when_all!`](crate::when_all!) and
/// [`when_any!`](crate::when_any!).
pub type ErasedAwaitable = Pin<Box<dyn Future<Output = ()> + Send>>;

#[doc(hidden)]
pub fn erase_awaitable<A>(awaitable: A) -> ErasedAwaitable
where
    A: IntoFuture + Send + 'static,
    A::IntoFuture: Send + 'static,
{
    Box::pin(async move {
        awaitable.await;
    })
}

type Registration = (Arc<Promise>, Arc<dyn CancelableAwaiter>);

/// Claims the outer coroutine's suspension and resumes it.
fn resume_registered(registered: Option<Registration>) {
    if let Some((promise, hook)) = registered
        && promise.unregister_cancelable_awaiter(&hook)
    {
        promise.resume(false);
    }
}

struct AggregateState {
    remaining: usize,
    winner: Option<usize>,
    registered: Option<Registration>,
    consumers: Vec<Coroutine<()>>,
}

struct AggregateShared {
    state: Mutex<AggregateState>,
}

/// Counts a consumer down when its coroutine ends, however it ends.
struct ConsumerGuard {
    shared: Arc<AggregateShared>,
    index: usize,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let registered = {
            let mut state = self.shared.state.lock();
            if state.remaining == 0 {
                return;
            }
            state.remaining -= 1;
            if state.remaining > 0 {
                return;
            }
            state.winner = Some(self.index);
            state.consumers.clear();
            state.registered.take()
        };
        resume_registered(registered);
    }
}

fn aggregate_on<I>(host: &Host, awaitables: I, any: bool) -> Suspension<AggregateAwaiter>
where
    I: IntoIterator,
    I::Item: IntoFuture + Send + 'static,
    <I::Item as IntoFuture>::IntoFuture: Send + 'static,
{
    let awaitables: Vec<_> = awaitables.into_iter().collect();
    let count = awaitables.len();
    let shared = Arc::new(AggregateShared {
        state: Mutex::new(AggregateState {
            remaining: if any { count.min(1) } else { count },
            winner: None,
            registered: None,
            consumers: Vec::with_capacity(count),
        }),
    });

    let name = if any { "when_any" } else { "when_all" };
    for (index, awaitable) in awaitables.into_iter().enumerate() {
        let guard = ConsumerGuard {
            shared: shared.clone(),
            index,
        };
        let consumer = host.spawn_named(name, async move {
            let _guard = guard;
            awaitable.await;
        });
        let mut state = shared.state.lock();
        if state.remaining > 0 && !consumer.is_done() {
            state.consumers.push(consumer);
        }
    }

    Suspension::new(AggregateAwaiter { shared })
}

pub(crate) fn when_all_on<I>(host: &Host, awaitables: I) -> Suspension<AggregateAwaiter>
where
    I: IntoIterator,
    I::Item: IntoFuture + Send + 'static,
    <I::Item as IntoFuture>::IntoFuture: Send + 'static,
{
    aggregate_on(host, awaitables, false)
}

pub(crate) fn when_any_on<I>(host: &Host, awaitables: I) -> Suspension<AggregateAwaiter>
where
    I: IntoIterator,
    I::Item: IntoFuture + Send + 'static,
    <I::Item as IntoFuture>::IntoFuture: Send + 'static,
{
    aggregate_on(host, awaitables, true)
}

/// Completes once every awaitable completed. Yields the index of the last
/// one to finish.
///
/// Must be called inside a coroutine; consumers start on its host.
pub fn when_all<I>(awaitables: I) -> Suspension<AggregateAwaiter>
where
    I: IntoIterator,
    I::Item: IntoFuture + Send + 'static,
    <I::Item as IntoFuture>::IntoFuture: Send + 'static,
{
    when_all_on(Promise::current().host(), awaitables)
}

/// Completes once any awaitable completed, yielding its index. The others
/// keep running.
///
/// Must be called inside a coroutine; consumers start on its host.
pub fn when_any<I>(awaitables: I) -> Suspension<AggregateAwaiter>
where
    I: IntoIterator,
    I::Item: IntoFuture + Send + 'static,
    <I::Item as IntoFuture>::IntoFuture: Send + 'static,
{
    when_any_on(Promise::current().host(), awaitables)
}

/// [`when_all`] over heterogeneous awaitables.
#[macro_export]
macro_rules! when_all {
    ($($awaitable:expr),* $(,)?) => {
        $crate::when_all(::std::vec![$($crate::aggregate::erase_awaitable($awaitable)),*])
    };
}

/// [`when_any`] over heterogeneous awaitables.
#[macro_export]
macro_rules! when_any {
    ($($awaitable:expr),* $(,)?) => {
        $crate::when_any(::std::vec![$($crate::aggregate::erase_awaitable($awaitable)),*])
    };
}

struct AggregateHook {
    shared: Weak<AggregateShared>,
}

impl CancelableAwaiter for AggregateHook {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        let consumers = match self.shared.upgrade() {
            Some(shared) => {
                let mut state = shared.state.lock();
                state.registered = None;
                std::mem::take(&mut state.consumers)
            }
            None => Vec::new(),
        };
        log::trace!(
            "Aggregate awaited by '{}' canceled, stopping {} consumers",
            promise.debug_name(),
            consumers.len()
        );
        for consumer in &consumers {
            consumer.cancel();
        }
        promise.resume_deferred(false);
    }
}

/// Awaiter behind [`when_all`] and [`when_any`].
pub struct AggregateAwaiter {
    shared: Arc<AggregateShared>,
}

impl Awaiter for AggregateAwaiter {
    type Output = Option<usize>;

    fn is_ready_now(&mut self) -> bool {
        self.shared.state.lock().remaining == 0
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let mut state = self.shared.state.lock();
        if state.remaining == 0 {
            drop(state);
            promise.resume(false);
            return;
        }
        let hook: Arc<dyn CancelableAwaiter> = Arc::new(AggregateHook {
            shared: Arc::downgrade(&self.shared),
        });
        if !promise.register_cancelable_awaiter(hook.clone()) {
            drop(state);
            promise.resume(false);
            return;
        }
        state.registered = Some((promise.clone(), hook));
    }

    fn resume_result(&mut self) -> Option<usize> {
        self.shared.state.lock().winner
    }
}

struct RaceState<T> {
    winner: Option<usize>,
    registered: Option<Registration>,
    participants: Vec<Coroutine<T>>,
}

impl<T> RaceState<T> {
    /// A winner exists, or there was nobody to race.
    fn is_decided(&self) -> bool {
        self.winner.is_some() || self.participants.is_empty()
    }
}

struct RaceShared<T> {
    state: Mutex<RaceState<T>>,
}

impl<T> RaceShared<T> {
    /// Records the first finisher and cancels everyone else.
    fn finish(&self, index: usize) {
        let (losers, registered) = {
            let mut state = self.state.lock();
            if state.winner.is_some() {
                return;
            }
            state.winner = Some(index);
            // Empty if the race was already abandoned.
            let losers: Vec<_> = std::mem::take(&mut state.participants)
                .into_iter()
                .enumerate()
                .filter_map(|(i, participant)| (i != index).then_some(participant))
                .collect();
            (losers, state.registered.take())
        };
        log::trace!("Race won by participant {index}, canceling {}", losers.len());
        for loser in &losers {
            loser.cancel();
        }
        resume_registered(registered);
    }

    /// Cancels every participant of an undecided race.
    fn abandon(&self) -> bool {
        let participants = {
            let mut state = self.state.lock();
            state.registered = None;
            if state.winner.is_some() {
                return false;
            }
            std::mem::take(&mut state.participants)
        };
        for participant in &participants {
            participant.cancel();
        }
        true
    }
}

struct RaceHook<T> {
    shared: Weak<RaceShared<T>>,
}

impl<T: Send + 'static> CancelableAwaiter for RaceHook<T> {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.abandon();
        }
        promise.resume_deferred(false);
    }
}

/// Awaiter behind [`race`].
///
/// Dropping an undecided race cancels all participants.
pub struct RaceAwaiter<T> {
    shared: Arc<RaceShared<T>>,
}

impl<T: Send + 'static> Awaiter for RaceAwaiter<T> {
    type Output = Option<usize>;

    fn is_ready_now(&mut self) -> bool {
        self.shared.state.lock().is_decided()
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let mut state = self.shared.state.lock();
        if state.is_decided() {
            drop(state);
            promise.resume(false);
            return;
        }
        let hook: Arc<dyn CancelableAwaiter> = Arc::new(RaceHook {
            shared: Arc::downgrade(&self.shared),
        });
        if !promise.register_cancelable_awaiter(hook.clone()) {
            drop(state);
            promise.resume(false);
            return;
        }
        state.registered = Some((promise.clone(), hook));
    }

    fn resume_result(&mut self) -> Option<usize> {
        self.shared.state.lock().winner
    }
}

impl<T> Drop for RaceAwaiter<T> {
    fn drop(&mut self) {
        if self.shared.abandon() {
            log::trace!("Undecided race dropped, participants canceled");
        }
    }
}

/// Completes when the first of `participants` finishes, successfully or
/// not, and cancels all the others. Yields the winner's index, or `None`
/// for an empty race.
///
/// Participants that are already done when the race starts are considered
/// in index order.
pub fn race<T: Send + 'static>(
    participants: impl IntoIterator<Item = Coroutine<T>>,
) -> Suspension<RaceAwaiter<T>> {
    let participants: Vec<_> = participants.into_iter().collect();
    let shared = Arc::new(RaceShared {
        state: Mutex::new(RaceState {
            winner: None,
            registered: None,
            participants: participants.clone(),
        }),
    });
    for (index, participant) in participants.iter().enumerate() {
        let shared = Arc::downgrade(&shared);
        participant.continue_with(move |_| {
            if let Some(shared) = shared.upgrade() {
                shared.finish(index);
            }
        });
    }
    Suspension::new(RaceAwaiter { shared })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoroutineError;
    use crate::test_support::ManualEnv;
    use crate::threading::{AwaitableEvent, EventMode};

    fn events(count: usize) -> Vec<AwaitableEvent> {
        (0..count)
            .map(|_| AwaitableEvent::new(EventMode::ManualReset, false))
            .collect()
    }

    #[test]
    fn when_all_waits_for_everyone() {
        let env = ManualEnv::new();
        let host = env.host();
        let events = events(2);
        let waits: Vec<_> = events.iter().map(|e| e.wait()).collect();
        let handle = host.spawn(async move { when_all(waits).await });

        events[1].trigger();
        assert!(!handle.is_done());
        events[0].trigger();
        assert_eq!(handle.result(), Ok(Some(0)));
    }

    #[test]
    fn when_any_reports_first_finisher() {
        let env = ManualEnv::new();
        let host = env.host();
        let events = events(3);
        let waits: Vec<_> = events.iter().map(|e| e.wait()).collect();
        let handle = host.spawn(async move { when_any(waits).await });

        events[2].trigger();
        assert_eq!(handle.result(), Ok(Some(2)));
        events[0].trigger();
        assert_eq!(handle.result(), Ok(Some(2)));
    }

    #[test]
    fn empty_aggregates_are_ready() {
        let env = ManualEnv::new();
        let handle = env.host().spawn(async {
            let all = when_all(Vec::<ErasedAwaitable>::new()).await;
            let any = when_any(Vec::<ErasedAwaitable>::new()).await;
            let first = race(Vec::<Coroutine<u8>>::new()).await;
            (all, any, first)
        });
        assert_eq!(handle.result(), Ok((None, None, None)));
    }

    #[test]
    fn already_complete_arguments_do_not_suspend() {
        let env = ManualEnv::new();
        let handle = env.host().spawn(async {
            when_all(vec![Coroutine::completed(1u8), Coroutine::completed(2u8)]).await
        });
        assert_eq!(handle.result(), Ok(Some(1)));
    }

    #[test]
    fn canceling_outer_cancels_consumers() {
        let env = ManualEnv::new();
        let host = env.host();
        let event = AwaitableEvent::new(EventMode::ManualReset, false);
        let wait = event.clone();
        let handle = host.spawn(async move { when_all!(wait.wait()).await });
        assert_eq!(event.waiter_count(), 1);

        handle.cancel();
        // The consumer's wait was withdrawn synchronously.
        assert_eq!(event.waiter_count(), 0);
        event.trigger();
        env.run_pending();
        assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
    }

    #[test]
    fn signals_between_cancel_and_teardown_are_not_consumed() {
        use crate::threading::AwaitableSemaphore;
        use std::sync::atomic::{AtomicBool, Ordering};

        let env = ManualEnv::new();
        let host = env.host();
        let event = AwaitableEvent::new(EventMode::AutoReset, false);
        let semaphore = AwaitableSemaphore::new(1, 0);
        let continued = Arc::new(AtomicBool::new(false));
        let handle = {
            let event = event.clone();
            let semaphore = semaphore.clone();
            let continued = continued.clone();
            host.spawn(async move {
                when_all!(event.wait(), semaphore.acquire()).await;
                continued.store(true, Ordering::SeqCst);
            })
        };
        assert_eq!(event.waiter_count(), 1);

        // Requested, but the teardown tasks have not run yet.
        handle.cancel();
        assert!(!handle.is_done());
        event.trigger();
        semaphore.unlock(1);

        env.run_pending();
        assert_eq!(handle.failure(), Some(CoroutineError::Canceled));
        assert!(!continued.load(Ordering::SeqCst));
        assert!(event.is_triggered());
        assert_eq!(event.waiter_count(), 0);
        assert_eq!(semaphore.count(), 1);
    }

    #[test]
    fn race_cancels_losers() {
        let env = ManualEnv::new();
        let host = env.host();
        let events = events(3);
        let participants: Vec<_> = events
            .iter()
            .map(|event| {
                let event = event.clone();
                host.spawn(async move { event.wait().await })
            })
            .collect();
        let racers = participants.clone();
        let handle = host.spawn(async move { race(racers).await });

        events[1].trigger();
        assert_eq!(handle.result(), Ok(Some(1)));
        env.run_pending();
        for (index, participant) in participants.iter().enumerate() {
            assert!(participant.is_done());
            assert_eq!(participant.was_successful(), index == 1);
        }
    }

    #[test]
    fn race_with_finished_participant_picks_lowest_index() {
        let env = ManualEnv::new();
        let pending = env.host().spawn(std::future::pending::<u8>());
        let handle = env.host().spawn({
            let pending = pending.clone();
            async move {
                race(vec![
                    pending,
                    Coroutine::completed(1u8),
                    Coroutine::completed(2u8),
                ])
                .await
            }
        });
        assert_eq!(handle.result(), Ok(Some(1)));
    }

    #[test]
    fn dropped_race_cancels_participants() {
        let env = ManualEnv::new();
        let host = env.host();
        let event = AwaitableEvent::new(EventMode::ManualReset, false);
        let participant = {
            let event = event.clone();
            host.spawn(async move { event.wait().await })
        };
        drop(race(vec![participant.clone()]));
        env.run_pending();
        assert!(participant.is_done());
        assert!(!participant.was_successful());
    }
}
