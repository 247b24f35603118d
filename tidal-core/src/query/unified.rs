//! Unified Query Implementation
//!
//! A unified query is the single shared fetch behind every consumer of one
//! `(key, fetch function)` pair.
//!
//! # How Fetches Run
//!
//! 1. `refetch()` moves the state to `Fetching`, remembering the previous
//!    outcome, and spawns the fetch onto the tokio runtime. The caller never
//!    runs fetch code itself.
//!
//! 2. While a fetch is in flight, further `refetch()` calls return the same
//!    [`FetchHandle`] instead of starting another fetch.
//!
//! 3. When the fetch completes, its result (or error, or panic) becomes the
//!    new state. Each fetch carries a generation number; a result whose
//!    generation is no longer current (the fetch was cancelled, or the query
//!    was disposed) is dropped.
//!
//! # Locking
//!
//! Every transition is computed and stored under one control mutex with the
//! state ref's notification suppressed. Listeners are notified only after
//! the mutex is released, so a listener may call back into the query.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::fetch::{FetchHandle, QueryFn};
use super::key::QueryKey;
use super::state::{Prior, UnifiedQueryState};
use crate::error::{FetchError, QueryError, ReactiveError};
use crate::reactive::{equality, CancelToken, Dependency, Observer, Ref, Subscription};

/// The fetch currently running.
struct InFlight {
    handle: FetchHandle,
    cancel: CancelToken,
}

struct Control {
    in_flight: Option<InFlight>,
    generation: u64,
    disposed: bool,
}

struct Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    key: QueryKey,
    fetch: QueryFn<T>,
    runtime: Handle,
    state: Ref<UnifiedQueryState<T>>,
    control: Mutex<Control>,
    fetch_count: AtomicUsize,
    subscribers: AtomicUsize,
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Store a new state without notifying. Must be called under `control`.
    fn replace(&self, next: UnifiedQueryState<T>) -> bool {
        // Suppressed writes never reach listeners, so they cannot fail.
        self.state.set_value(next, true).unwrap_or_default()
    }

    fn publish(&self) {
        if let Err(err) = self.state.notify() {
            tracing::error!(key = ?self.key, error = %err, "query state listener failed");
        }
    }

    async fn run(self: Arc<Self>, generation: u64, cancel: CancelToken) {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(key = ?self.key, generation, "fetch started");

        let Some(outcome) = self.execute(&cancel).await else {
            tracing::debug!(key = ?self.key, generation, "fetch cancelled");
            return;
        };

        let next = match outcome {
            Ok(data) => UnifiedQueryState::Success(data),
            Err(err) => {
                tracing::debug!(key = ?self.key, generation, error = %err, "fetch failed");
                UnifiedQueryState::Error(err)
            }
        };
        self.finish(generation, next);
    }

    /// Run the fetch function, racing it against cancellation.
    async fn execute(&self, cancel: &CancelToken) -> Option<Result<T, FetchError>> {
        let started = std::panic::catch_unwind(AssertUnwindSafe(|| self.fetch.call(cancel.clone())));
        let future = match started {
            Ok(future) => future,
            Err(panic) => return Some(Err(panicked(&*panic))),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = AssertUnwindSafe(future).catch_unwind() => Some(match result {
                Ok(Ok(data)) => Ok(data),
                Ok(Err(err)) => Err(Arc::new(err)),
                Err(panic) => Err(panicked(&*panic)),
            }),
        }
    }

    fn finish(&self, generation: u64, next: UnifiedQueryState<T>) {
        let changed = {
            let mut control = self.control.lock();
            if control.disposed || control.generation != generation {
                tracing::trace!(key = ?self.key, generation, "stale fetch result dropped");
                return;
            }
            control.in_flight = None;
            self.replace(next)
        };
        tracing::debug!(key = ?self.key, generation, "fetch finished");
        if changed {
            self.publish();
        }
    }
}

fn panicked(payload: &(dyn Any + Send)) -> FetchError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    Arc::new(anyhow::anyhow!("fetch panicked: {message}"))
}

/// One shared fetch and its state machine.
///
/// Handles are cheap to clone and all clones drive the same query. The
/// first fetch starts on construction.
pub struct UnifiedQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T>>,
}

impl<T> UnifiedQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a query and start its first fetch on `runtime`.
    pub fn new(key: QueryKey, fetch: QueryFn<T>, runtime: Handle) -> Self {
        // Every transition is a change except Disabled -> Disabled.
        let state = Ref::with_equality(
            UnifiedQueryState::Fetching(Prior::Empty),
            equality(|a: &UnifiedQueryState<T>, b: &UnifiedQueryState<T>| {
                a.is_disabled() && b.is_disabled()
            }),
        );
        let query = Self {
            inner: Arc::new(Inner {
                key,
                fetch,
                runtime,
                state,
                control: Mutex::new(Control {
                    in_flight: None,
                    generation: 0,
                    disposed: false,
                }),
                fetch_count: AtomicUsize::new(0),
                subscribers: AtomicUsize::new(0),
            }),
        };
        query.refetch();
        query
    }

    /// Start a fetch unless one is already in flight.
    ///
    /// Returns a handle resolving once the fetch has written its result.
    /// On a disposed query this does nothing and returns a resolved handle.
    ///
    /// Listener failures caused by the `Fetching` transition are logged, not
    /// returned: the same transitions are published from the fetch task,
    /// which has no caller to return them to.
    pub fn refetch(&self) -> FetchHandle {
        let inner = &self.inner;
        let (handle, changed) = {
            let mut control = inner.control.lock();
            if control.disposed {
                return FetchHandle::ready();
            }
            if let Some(in_flight) = &control.in_flight {
                return in_flight.handle.clone();
            }

            control.generation += 1;
            let generation = control.generation;
            let cancel = CancelToken::new();

            let prior = inner.state.get().into_prior();
            let changed = inner.replace(UnifiedQueryState::Fetching(prior));

            let task = inner
                .runtime
                .spawn(Arc::clone(inner).run(generation, cancel.clone()));
            let handle = FetchHandle::new(
                async move {
                    if let Err(err) = task.await {
                        tracing::warn!(error = %err, "fetch task did not complete");
                    }
                }
                .boxed(),
            );
            control.in_flight = Some(InFlight {
                handle: handle.clone(),
                cancel,
            });
            (handle, changed)
        };

        if changed {
            inner.publish();
        }
        handle
    }

    /// Cancel the in-flight fetch and wait for it to wind down.
    ///
    /// The state falls back to the outcome before the fetch started, or to
    /// an error wrapping [`QueryError::Cancelled`] if there was none. Does
    /// nothing when no fetch is in flight.
    pub async fn cancel(&self) {
        let inner = &self.inner;
        let (handle, changed) = {
            let mut control = inner.control.lock();
            let Some(in_flight) = control.in_flight.take() else {
                return;
            };
            control.generation += 1;
            in_flight.cancel.cancel();

            let prior = inner.state.get().into_prior();
            let cancelled: FetchError = Arc::new(QueryError::Cancelled.into());
            let changed = inner.replace(UnifiedQueryState::settle(prior, cancelled));
            (in_flight.handle, changed)
        };

        tracing::debug!(key = ?inner.key, "fetch cancellation requested");
        if changed {
            inner.publish();
        }
        handle.await;
    }

    /// Move to the terminal `Disabled` state.
    ///
    /// Idempotent. An in-flight fetch is signalled to stop and its result,
    /// if it still arrives, is dropped. Listener failures are logged, as
    /// for [`refetch`](Self::refetch).
    pub fn dispose(&self) {
        let inner = &self.inner;
        let changed = {
            let mut control = inner.control.lock();
            if control.disposed {
                return;
            }
            control.disposed = true;
            control.generation += 1;
            if let Some(in_flight) = control.in_flight.take() {
                in_flight.cancel.cancel();
            }
            inner.replace(UnifiedQueryState::Disabled)
        };

        tracing::debug!(key = ?inner.key, "unified query disposed");
        if changed {
            inner.publish();
        }
    }

    /// Register a listener called on every state change.
    pub fn subscribe<F>(&self, on_change: F) -> Result<Subscription, ReactiveError>
    where
        F: Fn(&UnifiedQueryState<T>) -> Result<(), ReactiveError> + Send + Sync + 'static,
    {
        let subscription = self.inner.state.subscribe(on_change)?;
        self.inner.subscribers.fetch_add(1, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(move || {
            subscription.dispose();
            inner.subscribers.fetch_sub(1, Ordering::SeqCst);
        }))
    }

    /// The current state.
    pub fn state(&self) -> UnifiedQueryState<T> {
        self.inner.state.get()
    }

    pub fn key(&self) -> &QueryKey {
        &self.inner.key
    }

    /// Number of fetches started so far.
    pub fn fetch_count(&self) -> usize {
        self.inner.fetch_count.load(Ordering::SeqCst)
    }

    /// Number of live listeners registered through [`subscribe`](Self::subscribe).
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.control.lock().disposed
    }

    /// Whether `other` is a handle to the same query.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> Dependency for UnifiedQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn observe_changes(&self, downstream: Observer<()>) -> Result<Subscription, ReactiveError> {
        self.inner.state.observe_changes(downstream)
    }
}

impl<T> Clone for UnifiedQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for UnifiedQuery<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnifiedQuery")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .field("fetch_count", &self.fetch_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
