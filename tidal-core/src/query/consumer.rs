//! Consumer-facing queries.
//!
//! A [`Query`] binds a key provider to the shared cache. Whenever one of its
//! reactive dependencies fires, the key provider is evaluated again; a new
//! key rents (and refetches) the matching unified query, no key disables
//! the query. The bound unified query's state is projected into the query's
//! own state ref.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::cache::{QueryCache, QueryLease};
use super::fetch::{FetchHandle, QueryFn};
use super::key::QueryKey;
use super::state::QueryState;
use super::unified::UnifiedQuery;
use crate::error::{QueryError, ReactiveError};
use crate::reactive::{equality, watch_effect, Dependency, Observer, Ref, Subscription, Watch};

type KeyFn = Arc<dyn Fn() -> anyhow::Result<Option<QueryKey>> + Send + Sync>;

/// Computes the key a query should currently be bound to.
///
/// A provider that fails or panics counts as "no key", which disables the
/// query. This is what makes guarded queries work:
///
/// ```rust
/// use tidal_core::query::{KeyProvider, QueryKey};
/// use tidal_core::reactive::Ref;
///
/// let user: Ref<Option<u64>> = Ref::new(None);
/// let source = user.clone();
/// let provider = KeyProvider::fallible(move || {
///     let id = source.get().ok_or_else(|| anyhow::anyhow!("signed out"))?;
///     Ok(Some(QueryKey::single("profile").with(id)))
/// });
/// # let _ = provider;
/// ```
#[derive(Clone)]
pub struct KeyProvider {
    f: KeyFn,
}

impl KeyProvider {
    /// A provider returning `key` or "no key".
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() -> Option<QueryKey> + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(move || Ok(f())),
        }
    }

    /// A provider that may fail. Failure means "no key".
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<Option<QueryKey>> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// A provider that always returns `key`.
    pub fn fixed(key: QueryKey) -> Self {
        Self::new(move || Some(key.clone()))
    }

    /// A provider that never returns a key.
    pub fn none() -> Self {
        Self::new(|| None)
    }

    pub(crate) fn resolve(&self) -> Option<QueryKey> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| (self.f)())) {
            Ok(Ok(key)) => key,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "key provider failed, query disabled");
                None
            }
            Err(_) => {
                tracing::debug!("key provider panicked, query disabled");
                None
            }
        }
    }
}

impl From<QueryKey> for KeyProvider {
    fn from(key: QueryKey) -> Self {
        Self::fixed(key)
    }
}

impl From<&'static str> for KeyProvider {
    fn from(key: &'static str) -> Self {
        Self::fixed(key.into())
    }
}

impl fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyProvider").finish_non_exhaustive()
    }
}

/// The unified query a [`Query`] is currently bound to.
struct Binding<T>
where
    T: Clone + Send + Sync + 'static,
{
    key: QueryKey,
    query: UnifiedQuery<T>,
    subscription: Subscription,
    lease: QueryLease,
}

impl<T> Binding<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn release(self) {
        self.subscription.dispose();
        self.lease.release();
    }
}

struct QueryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    cache: QueryCache,
    fetch: QueryFn<T>,
    key_provider: KeyProvider,
    state: Ref<QueryState<T>>,
    binding: Mutex<Option<Binding<T>>>,
    writer: Mutex<()>,
    /// Bumped on every rebind; writes from older bindings are dropped.
    generation: AtomicU64,
    disposed: AtomicBool,
}

impl<T> QueryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn rebind(self: &Arc<Self>) -> Result<(), ReactiveError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let next = self.key_provider.resolve();
        let current = self.binding.lock().as_ref().map(|binding| binding.key.clone());
        if next == current {
            return Ok(());
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.binding.lock().take();
        if let Some(previous) = previous {
            tracing::debug!(key = ?previous.key, "query unbound");
            previous.release();
        }

        let Some(key) = next else {
            return self.disable(generation);
        };

        let (query, lease) = match self.cache.rent(&key, &self.fetch) {
            Ok(rented) => rented,
            Err(QueryError::Disposed) => return self.disable(generation),
            Err(err) => return Err(ReactiveError::observer(err)),
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let subscription = query.subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.sync_shared(generation);
            }
            Ok(())
        })?;

        let binding = Binding {
            key,
            query: query.clone(),
            subscription,
            lease,
        };
        // `dispose` may have run since the check above; it will not look again.
        let orphaned = {
            let mut slot = self.binding.lock();
            if self.disposed.load(Ordering::SeqCst) {
                Some(binding)
            } else {
                tracing::debug!(key = ?binding.key, "query bound");
                *slot = Some(binding);
                None
            }
        };
        if let Some(binding) = orphaned {
            tracing::debug!(key = ?binding.key, "query disposed while binding");
            binding.release();
            return Ok(());
        }

        self.sync(generation)?;
        query.refetch();
        Ok(())
    }

    /// Project the bound query's current state into ours.
    fn sync(&self, generation: u64) -> Result<(), ReactiveError> {
        self.store(generation, |binding| {
            binding.map(|binding| QueryState::project(&binding.key, &binding.query.state()))
        })
    }

    /// Sync on behalf of the shared unified query.
    ///
    /// Our own observers' failures stay here: the unified query's listener
    /// stream is shared with every other consumer of the same entry.
    fn sync_shared(&self, generation: u64) {
        if let Err(err) = self.sync(generation) {
            tracing::warn!(error = %err, "query state observer failed");
        }
    }

    fn disable(&self, generation: u64) -> Result<(), ReactiveError> {
        self.store(generation, |_| Some(QueryState::disabled()))
    }

    /// Store a new state unless the query was disposed or rebound since.
    ///
    /// The state is computed and stored under the writer lock, observers are
    /// notified after it is released.
    fn store<F>(&self, generation: u64, next: F) -> Result<(), ReactiveError>
    where
        F: FnOnce(Option<&Binding<T>>) -> Option<QueryState<T>>,
    {
        let changed = {
            let _writer = self.writer.lock();
            if self.disposed.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            let Some(next) = next(self.binding.lock().as_ref()) else {
                return Ok(());
            };
            self.state.set_value(next, true)?
        };
        if changed {
            self.state.notify()?;
        }
        Ok(())
    }

    fn bound_query(&self) -> Option<UnifiedQuery<T>> {
        self.binding.lock().as_ref().map(|binding| binding.query.clone())
    }
}

/// A consumer-facing handle to a possibly shared fetch and its state.
///
/// Handles are cheap to clone; every clone observes the same query.
pub struct Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<QueryInner<T>>,
    watch: Watch,
}

impl<T> Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        cache: QueryCache,
        key_provider: KeyProvider,
        fetch: QueryFn<T>,
        dependencies: &[&dyn Dependency],
    ) -> Result<Self, QueryError> {
        // Only two disabled states compare equal.
        let state = Ref::with_equality(
            QueryState::disabled(),
            equality(|a: &QueryState<T>, b: &QueryState<T>| a.is_disabled() && b.is_disabled()),
        );
        let inner = Arc::new(QueryInner {
            cache,
            fetch,
            key_provider,
            state,
            binding: Mutex::new(None),
            writer: Mutex::new(()),
            generation: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        });

        let target = Arc::clone(&inner);
        let watch = watch_effect(dependencies, move || target.rebind())?;
        Ok(Self { inner, watch })
    }

    /// The current state.
    pub fn state(&self) -> QueryState<T> {
        self.inner.state.get()
    }

    /// The key the query is bound to, if any.
    pub fn key(&self) -> Option<QueryKey> {
        self.inner.binding.lock().as_ref().map(|binding| binding.key.clone())
    }

    /// Register an observer called on every state change.
    pub fn subscribe<F>(&self, on_change: F) -> Result<Subscription, ReactiveError>
    where
        F: Fn(&QueryState<T>) -> Result<(), ReactiveError> + Send + Sync + 'static,
    {
        self.inner.state.subscribe(on_change)
    }

    /// Refetch the bound unified query. Does nothing while disabled.
    pub fn refetch(&self) -> FetchHandle {
        match self.inner.bound_query() {
            Some(query) => query.refetch(),
            None => FetchHandle::ready(),
        }
    }

    /// Cancel the bound unified query's in-flight fetch, if any.
    pub async fn cancel(&self) {
        if let Some(query) = self.inner.bound_query() {
            query.cancel().await;
        }
    }

    /// Unbind, release the cache entry and disable the query for good.
    /// Idempotent.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.watch.dispose();
        inner.generation.fetch_add(1, Ordering::SeqCst);

        let binding = inner.binding.lock().take();
        if let Some(binding) = binding {
            binding.release();
        }
        let changed = {
            let _writer = inner.writer.lock();
            inner.state.set_value(QueryState::disabled(), true).unwrap_or_default()
        };
        if changed {
            if let Err(err) = inner.state.notify() {
                tracing::warn!(error = %err, "query state observer failed during dispose");
            }
        }
        tracing::debug!("query disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }
}

impl<T> Dependency for Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn observe_changes(&self, downstream: Observer<()>) -> Result<Subscription, ReactiveError> {
        self.inner.state.observe_changes(downstream)
    }
}

impl<T> Clone for Query<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            watch: self.watch.clone(),
        }
    }
}

impl<T> fmt::Debug for Query<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
