//! Multicast callbacks that coroutines can await.

use std::fmt;
use std::future::IntoFuture;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::awaiter::{Awaiter, CancelableAwaiter, Suspension};
use crate::promise::{Promise, panic_message};
use crate::threading::{Waiter, enqueue, next_waiter_id};

/// Identifies a callback bound with [`AwaitableDelegate::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DelegateHandle(u64);

type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

enum Binding<A> {
    Callback(u64, Callback<A>),
    Waiter(Waiter, Arc<Mutex<Option<A>>>),
}

impl<A> Binding<A> {
    fn id(&self) -> u64 {
        match self {
            Binding::Callback(id, _) => *id,
            Binding::Waiter(waiter, _) => waiter.id,
        }
    }
}

struct DelegateInner<A> {
    bindings: Mutex<Vec<Binding<A>>>,
}

/// A multicast delegate.
///
/// Plain callbacks stay bound until removed. Awaiting coroutines are bound
/// for a single broadcast: each one resumes with a copy of the broadcast
/// arguments and is unbound again. Both run on the broadcasting thread, in
/// the order they were bound.
///
/// Clone is cheap (Arc-wrapped); clones share the same bindings.
///
/// # Example
///
/// ```ignore
/// let on_hit = AwaitableDelegate::<(u32, f32)>::new();
/// let hits = on_hit.clone();
/// host.spawn_latent(actor, async move {
///     let (target, damage) = (&hits).await;
///     log::info!("hit {target} for {damage}");
/// });
/// on_hit.broadcast((7, 12.5));
/// ```
pub struct AwaitableDelegate<A> {
    inner: Arc<DelegateInner<A>>,
}

impl<A> Clone for AwaitableDelegate<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Clone + Send + 'static> Default for AwaitableDelegate<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for AwaitableDelegate<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwaitableDelegate")
            .field("bindings", &self.inner.bindings.lock().len())
            .finish()
    }
}

impl<A: Clone + Send + 'static> AwaitableDelegate<A> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DelegateInner {
                bindings: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Binds `callback` until it is [`remove`](Self::remove)d.
    pub fn add(&self, callback: impl Fn(&A) + Send + Sync + 'static) -> DelegateHandle {
        let id = next_waiter_id();
        self.inner
            .bindings
            .lock()
            .push(Binding::Callback(id, Arc::new(callback)));
        DelegateHandle(id)
    }

    /// Unbinds a callback. Returns whether it was still bound.
    pub fn remove(&self, handle: DelegateHandle) -> bool {
        let mut bindings = self.inner.bindings.lock();
        let before = bindings.len();
        bindings.retain(|binding| {
            !matches!(binding, Binding::Callback(id, _) if *id == handle.0)
        });
        bindings.len() != before
    }

    /// Number of bound callbacks and awaiting coroutines.
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.lock().len()
    }

    /// Number of awaiting coroutines.
    pub fn waiter_count(&self) -> usize {
        self.inner
            .bindings
            .lock()
            .iter()
            .filter(|binding| matches!(binding, Binding::Waiter(..)))
            .count()
    }

    /// Invokes every binding with `args`.
    ///
    /// Bindings added while broadcasting only see the next broadcast. A
    /// panicking callback is logged and does not stop the others.
    pub fn broadcast(&self, args: A) {
        let snapshot: Vec<Binding<A>> = {
            let mut bindings = self.inner.bindings.lock();
            let mut snapshot = Vec::with_capacity(bindings.len());
            let mut kept = Vec::with_capacity(bindings.len());
            for binding in bindings.drain(..) {
                match binding {
                    Binding::Callback(id, callback) => {
                        kept.push(Binding::Callback(id, callback.clone()));
                        snapshot.push(Binding::Callback(id, callback));
                    }
                    Binding::Waiter(waiter, slot) => {
                        if waiter.claim() {
                            snapshot.push(Binding::Waiter(waiter, slot));
                        }
                    }
                }
            }
            *bindings = kept;
            snapshot
        };

        for binding in snapshot {
            match binding {
                Binding::Callback(_, callback) => {
                    let args = &args;
                    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(args)))
                    {
                        log::error!(
                            "Delegate callback panicked: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                }
                Binding::Waiter(waiter, slot) => {
                    *slot.lock() = Some(args.clone());
                    waiter.promise.resume(false);
                }
            }
        }
    }

    /// Suspends until the next broadcast and returns its arguments.
    /// Cancelable.
    pub fn wait(&self) -> Suspension<DelegateWait<A>> {
        Suspension::new(DelegateWait {
            delegate: self.inner.clone(),
            slot: Arc::new(Mutex::new(None)),
        })
    }
}

impl<A: Clone + Send + 'static> IntoFuture for &AwaitableDelegate<A> {
    type Output = A;
    type IntoFuture = Suspension<DelegateWait<A>>;

    fn into_future(self) -> Self::IntoFuture {
        self.wait()
    }
}

struct DelegateHook<A> {
    delegate: Weak<DelegateInner<A>>,
    id: u64,
}

impl<A: Send + 'static> CancelableAwaiter for DelegateHook<A> {
    fn cancel(self: Arc<Self>, promise: &Arc<Promise>) {
        if let Some(delegate) = self.delegate.upgrade() {
            delegate
                .bindings
                .lock()
                .retain(|binding| binding.id() != self.id);
        }
        promise.resume_deferred(false);
    }
}

/// Awaiter behind [`AwaitableDelegate::wait`].
pub struct DelegateWait<A> {
    delegate: Arc<DelegateInner<A>>,
    slot: Arc<Mutex<Option<A>>>,
}

impl<A: Send + 'static> Awaiter for DelegateWait<A> {
    type Output = A;

    fn is_ready_now(&mut self) -> bool {
        false
    }

    fn suspend(&mut self, promise: &Arc<Promise>) {
        let mut bindings = self.delegate.bindings.lock();
        let delegate = Arc::downgrade(&self.delegate);
        let waiter = enqueue(promise, |id| Arc::new(DelegateHook { delegate, id }));
        if let Some(waiter) = waiter {
            bindings.push(Binding::Waiter(waiter, self.slot.clone()));
        }
    }

    fn resume_result(&mut self) -> A {
        self.slot
            .lock()
            .take()
            .unwrap_or_else(|| panic!("Delegate awaiter resumed without a broadcast"))
    }
}
