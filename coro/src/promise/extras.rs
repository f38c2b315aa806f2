use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use super::latent::ExitReason;
use super::{Promise, panic_message};
use crate::awaiter::CancelableAwaiter;
use crate::error::CoroutineError;

/// Callback run once after a coroutine completes, with its result if any.
pub(crate) type Continuation = Box<dyn FnOnce(Option<&(dyn Any + Send)>) + Send>;

/// Where a coroutine is in its life, from the point of view of its handles.
pub(crate) enum PromiseLink {
    /// Running or suspended; the promise may still be reachable.
    Live(Weak<Promise>),
    /// Completed; continuations are being run with the result moved out.
    Finalizing,
    /// Completed and all continuations ran.
    Done,
}

impl PromiseLink {
    pub(crate) fn is_live(&self) -> bool {
        matches!(self, PromiseLink::Live(_))
    }
}

pub(crate) struct ExtrasInner {
    pub(crate) link: PromiseLink,
    pub(crate) result: Option<Box<dyn Any + Send>>,
    pub(crate) failure: Option<CoroutineError>,
    pub(crate) continuations: Vec<Continuation>,
    pub(crate) cancelable: Option<Arc<dyn CancelableAwaiter>>,
    pub(crate) exit_reason: ExitReason,
}

/// The part of a coroutine that outlives its frame.
///
/// Shared by the promise and every [`Coroutine`](crate::Coroutine) handle.
pub(crate) struct PromiseExtras {
    id: u64,
    name: String,
    manual: bool,
    inner: Mutex<ExtrasInner>,
    completed: Condvar,
}

impl PromiseExtras {
    pub(crate) fn live(id: u64, name: String, promise: Weak<Promise>) -> Self {
        Self::with_link(id, name, PromiseLink::Live(promise))
    }

    /// Extras with no frame behind them, completed by hand.
    pub(crate) fn manual(id: u64, name: String) -> Self {
        Self {
            manual: true,
            ..Self::with_link(id, name, PromiseLink::Live(Weak::new()))
        }
    }

    /// Extras of a coroutine that finished successfully before it existed.
    pub(crate) fn completed(id: u64, name: String, value: Box<dyn Any + Send>) -> Self {
        let extras = Self::with_link(id, name, PromiseLink::Done);
        extras.inner.lock().result = Some(value);
        extras
    }

    fn with_link(id: u64, name: String, link: PromiseLink) -> Self {
        Self {
            id,
            name,
            manual: false,
            inner: Mutex::new(ExtrasInner {
                link,
                result: None,
                failure: None,
                continuations: Vec::new(),
                cancelable: None,
                exit_reason: ExitReason::Normal,
            }),
            completed: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_manual(&self) -> bool {
        self.manual
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ExtrasInner> {
        self.inner.lock()
    }

    /// The live promise, if the coroutine has not completed yet.
    pub(crate) fn promise(&self) -> Option<Arc<Promise>> {
        match &self.inner.lock().link {
            PromiseLink::Live(promise) => promise.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        !self.inner.lock().link.is_live()
    }

    pub(crate) fn was_successful(&self) -> bool {
        let inner = self.inner.lock();
        !inner.link.is_live() && inner.failure.is_none()
    }

    pub(crate) fn failure(&self) -> Option<CoroutineError> {
        self.inner.lock().failure.clone()
    }

    pub(crate) fn exit_reason(&self) -> ExitReason {
        self.inner.lock().exit_reason
    }

    /// Blocks until completion or until `timeout` elapses.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        while inner.link.is_live() {
            match deadline {
                None => self.completed.wait(&mut inner),
                Some(deadline) => {
                    if self.completed.wait_until(&mut inner, deadline).timed_out() {
                        return !inner.link.is_live();
                    }
                }
            }
        }
        true
    }

    /// Marks the coroutine complete and runs its continuations.
    ///
    /// # Panics
    ///
    /// Panics if the coroutine already completed.
    pub(crate) fn complete(
        &self,
        outcome: Result<Box<dyn Any + Send>, CoroutineError>,
        exit_reason: ExitReason,
    ) {
        assert!(
            self.try_complete(outcome, exit_reason),
            "Coroutine '{}' completed twice",
            self.name
        );
    }

    /// Like [`complete`](Self::complete), but returns `false` instead of
    /// panicking if the coroutine already completed.
    pub(crate) fn try_complete(
        &self,
        outcome: Result<Box<dyn Any + Send>, CoroutineError>,
        exit_reason: ExitReason,
    ) -> bool {
        let (continuations, result) = {
            let mut inner = self.inner.lock();
            if !inner.link.is_live() {
                return false;
            }
            inner.link = PromiseLink::Finalizing;
            inner.exit_reason = exit_reason;
            inner.cancelable = None;
            let result = match outcome {
                Ok(value) => Some(value),
                Err(error) => {
                    inner.failure = Some(error);
                    None
                }
            };
            self.completed.notify_all();
            (std::mem::take(&mut inner.continuations), result)
        };
        log::trace!("Coroutine '{}' completed", self.name);
        self.drain(continuations, result);
        true
    }

    /// Runs `continuation` after completion, immediately if already complete.
    pub(crate) fn add_continuation(&self, continuation: Continuation) {
        let mut inner = self.inner.lock();
        match inner.link {
            PromiseLink::Live(_) | PromiseLink::Finalizing => {
                inner.continuations.push(continuation);
            }
            PromiseLink::Done => {
                inner.link = PromiseLink::Finalizing;
                let result = inner.result.take();
                drop(inner);
                self.drain(vec![continuation], result);
            }
        }
    }

    fn drain(&self, mut batch: Vec<Continuation>, result: Option<Box<dyn Any + Send>>) {
        loop {
            for continuation in batch.drain(..) {
                let value = result.as_deref();
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(move || continuation(value)))
                {
                    log::error!(
                        "Continuation of coroutine '{}' panicked: {}",
                        self.name,
                        panic_message(payload.as_ref())
                    );
                }
            }

            let mut inner = self.inner.lock();
            if inner.continuations.is_empty() {
                inner.result = result;
                inner.link = PromiseLink::Done;
                self.completed.notify_all();
                return;
            }
            batch = std::mem::take(&mut inner.continuations);
        }
    }

    /// Projects the outcome if every continuation already ran; `None`
    /// while running or finalizing. Does not block.
    pub(crate) fn settled<R>(
        &self,
        project: impl FnOnce(bool, Option<&(dyn Any + Send)>) -> R,
    ) -> Option<R> {
        let inner = self.inner.lock();
        match inner.link {
            PromiseLink::Done => Some(project(inner.failure.is_none(), inner.result.as_deref())),
            _ => None,
        }
    }

    fn wait_done<'a>(&'a self, inner: &mut MutexGuard<'a, ExtrasInner>) {
        while !matches!(inner.link, PromiseLink::Done) {
            self.completed.wait(inner);
        }
    }

    /// Blocks until done, then clones the result out.
    pub(crate) fn clone_result<T: Clone + 'static>(&self) -> Result<T, CoroutineError> {
        let mut inner = self.inner.lock();
        self.wait_done(&mut inner);
        if let Some(error) = &inner.failure {
            return Err(error.clone());
        }
        match inner.result.as_ref() {
            Some(value) => value
                .downcast_ref::<T>()
                .cloned()
                .ok_or(CoroutineError::ResultTaken),
            None => Err(CoroutineError::ResultTaken),
        }
    }

    /// Blocks until done, then moves the result out.
    pub(crate) fn take_result<T: 'static>(&self) -> Result<T, CoroutineError> {
        let mut inner = self.inner.lock();
        self.wait_done(&mut inner);
        if let Some(error) = &inner.failure {
            return Err(error.clone());
        }
        match inner.result.take() {
            Some(value) => match value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(value) => {
                    inner.result = Some(value);
                    Err(CoroutineError::ResultTaken)
                }
            },
            None => Err(CoroutineError::ResultTaken),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn live() -> PromiseExtras {
        PromiseExtras::live(1, "test".into(), Weak::new())
    }

    #[test]
    fn complete_runs_continuations_in_order() {
        let extras = live();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            extras.add_continuation(Box::new(move |value| {
                let value = value.and_then(|v| v.downcast_ref::<u32>()).copied();
                order.lock().push((i, value));
            }));
        }
        assert!(order.lock().is_empty());

        extras.complete(Ok(Box::new(7u32)), ExitReason::Normal);
        assert_eq!(*order.lock(), vec![(0, Some(7)), (1, Some(7)), (2, Some(7))]);
        assert!(extras.is_done());
        assert!(extras.was_successful());
        assert_eq!(extras.clone_result::<u32>(), Ok(7));
    }

    #[test]
    fn continuation_added_after_completion_runs_immediately() {
        let extras = live();
        extras.complete(Ok(Box::new(5u32)), ExitReason::Normal);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = hits.clone();
        extras.add_continuation(Box::new(move |value| {
            assert_eq!(value.and_then(|v| v.downcast_ref::<u32>()), Some(&5));
            hits_in.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(extras.clone_result::<u32>(), Ok(5));
    }

    #[test]
    fn continuation_sees_none_on_failure() {
        let extras = live();
        let seen = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        extras.add_continuation(Box::new(move |value| {
            *seen_in.lock() = Some(value.is_some());
        }));
        extras.complete(Err(CoroutineError::Canceled), ExitReason::ActionAborted);
        assert_eq!(*seen.lock(), Some(false));
        assert!(!extras.was_successful());
        assert_eq!(extras.exit_reason(), ExitReason::ActionAborted);
        assert_eq!(extras.clone_result::<u32>(), Err(CoroutineError::Canceled));
    }

    #[test]
    fn take_result_moves_once() {
        let extras = live();
        extras.complete(Ok(Box::new(String::from("x"))), ExitReason::Normal);
        assert_eq!(extras.take_result::<String>(), Ok("x".to_owned()));
        assert_eq!(
            extras.take_result::<String>(),
            Err(CoroutineError::ResultTaken)
        );
        assert!(extras.was_successful());
    }

    #[test]
    fn wait_times_out_then_completes() {
        let extras = Arc::new(live());
        assert!(!extras.wait(Some(Duration::from_millis(5))));

        let remote = extras.clone();
        let thread = std::thread::spawn(move || {
            remote.complete(Ok(Box::new(())), ExitReason::Normal);
        });
        assert!(extras.wait(None));
        thread.join().unwrap();
    }

    #[test]
    fn try_complete_keeps_the_first_outcome() {
        let extras = live();
        assert!(extras.try_complete(Ok(Box::new(1u8)), ExitReason::Normal));
        assert!(!extras.try_complete(Err(CoroutineError::Canceled), ExitReason::Normal));
        assert_eq!(extras.clone_result::<u8>(), Ok(1));
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn double_completion_panics() {
        let extras = live();
        extras.complete(Ok(Box::new(())), ExitReason::Normal);
        extras.complete(Ok(Box::new(())), ExitReason::Normal);
    }
}
