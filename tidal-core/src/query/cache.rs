//! Shared Query Cache
//!
//! The cache maps `(key, fetch function identity, value type)` to one
//! [`UnifiedQuery`], so every consumer of the same logical query shares one
//! fetch. Entries are reference counted through [`QueryLease`]s and evicted
//! by the invalidator the cache's [`InvalidatorFactory`] creates for them.
//!
//! The entry map sits behind one cache-wide lock. Evicted queries are
//! disposed, and invalidators told about reactivation, after that lock is
//! released.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::fetch::{FetchFnId, QueryFn};
use super::invalidator::InvalidatorFactory;
use super::key::QueryKey;
use super::lifetime::{Evict, LifetimeManager, Subscribed};
use super::unified::UnifiedQuery;
use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    key: QueryKey,
    fetch: FetchFnId,
    value_type: TypeId,
}

impl CacheKey {
    fn new<T: 'static>(key: &QueryKey, fetch: &QueryFn<T>) -> Self {
        Self {
            key: key.clone(),
            fetch: fetch.id(),
            value_type: TypeId::of::<T>(),
        }
    }
}

/// Type-erased view of a cached [`UnifiedQuery`].
trait ErasedQuery: Send + Sync {
    fn dispose(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<T> ErasedQuery for UnifiedQuery<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn dispose(&self) {
        UnifiedQuery::dispose(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Entry {
    query: Box<dyn ErasedQuery>,
    lifetime: Arc<LifetimeManager>,
}

impl Entry {
    fn downcast<T>(&self) -> Result<UnifiedQuery<T>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.query
            .as_any()
            .downcast_ref::<UnifiedQuery<T>>()
            .cloned()
            .ok_or(QueryError::TypeMismatch)
    }
}

struct CacheInner {
    /// `None` once the cache is disposed.
    entries: Mutex<Option<IndexMap<CacheKey, Entry>>>,
    factory: Arc<dyn InvalidatorFactory>,
    runtime: Handle,
}

impl CacheInner {
    /// Remove `key` if it still belongs to `lifetime`.
    fn evict(&self, key: &CacheKey, lifetime: &LifetimeManager) {
        let removed = {
            let mut guard = self.entries.lock();
            let Some(entries) = guard.as_mut() else {
                return;
            };
            match entries.get(key) {
                Some(entry) if std::ptr::eq(Arc::as_ptr(&entry.lifetime), lifetime) => {
                    entries.shift_remove(key)
                }
                _ => None,
            }
        };

        if let Some(entry) = removed {
            tracing::debug!(key = ?key.key, "cache entry evicted");
            entry.query.dispose();
        }
    }
}

/// The shared, deduplicating store of unified queries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl QueryCache {
    /// Create an empty cache running fetches and timers on `runtime`.
    pub fn new(factory: Arc<dyn InvalidatorFactory>, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(Some(IndexMap::new())),
                factory,
                runtime,
            }),
        }
    }

    /// Rent the unified query for `key` and `fetch`, creating it on a miss.
    ///
    /// The entry stays alive at least until the returned lease is released.
    /// Fails with [`QueryError::Disposed`] once the cache is disposed.
    ///
    /// A miss calls the invalidator factory under the cache lock, so the
    /// factory must not call back into the cache. Invalidators themselves
    /// are only called after the lock is released.
    pub fn rent<T>(&self, key: &QueryKey, fetch: &QueryFn<T>) -> Result<(UnifiedQuery<T>, QueryLease), QueryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let cache_key = CacheKey::new(key, fetch);

        let (query, lifetime, subscribed, replaced) = {
            let mut guard = self.inner.entries.lock();
            let entries = guard.as_mut().ok_or(QueryError::Disposed)?;

            let hit = match entries.get(&cache_key) {
                Some(entry) => {
                    let query = entry.downcast::<T>()?;
                    match entry.lifetime.on_subscribed() {
                        Subscribed::Refused => None,
                        subscribed => Some((query, Arc::clone(&entry.lifetime), subscribed)),
                    }
                }
                None => None,
            };

            match hit {
                Some((query, lifetime, subscribed)) => {
                    tracing::trace!(?key, "query cache hit");
                    (query, lifetime, subscribed, None)
                }
                None => {
                    tracing::debug!(?key, "query cache miss");
                    let query = UnifiedQuery::new(key.clone(), fetch.clone(), self.inner.runtime.clone());
                    let lifetime = Arc::new(LifetimeManager::new(
                        self.inner.factory.create(key, &self.inner.runtime),
                        self.evictor(cache_key.clone()),
                    ));
                    let subscribed = lifetime.on_subscribed();

                    let entry = Entry {
                        query: Box::new(query.clone()),
                        lifetime: Arc::clone(&lifetime),
                    };
                    // An entry that was invalidated but not removed yet is replaced.
                    let replaced = entries.insert(cache_key, entry);
                    (query, lifetime, subscribed, replaced)
                }
            }
        };

        if let Some(stale) = replaced {
            stale.query.dispose();
        }
        if subscribed == Subscribed::Reactivated {
            lifetime.reactivated();
        }
        Ok((query, QueryLease::new(lifetime)))
    }

    fn evictor(&self, key: CacheKey) -> Evict {
        let cache: Weak<CacheInner> = Arc::downgrade(&self.inner);
        Box::new(move |lifetime: &LifetimeManager| {
            if let Some(cache) = cache.upgrade() {
                cache.evict(&key, lifetime);
            }
        })
    }

    /// Whether an entry for `key` and `fetch` is cached.
    pub fn contains<T: 'static>(&self, key: &QueryKey, fetch: &QueryFn<T>) -> bool {
        let cache_key = CacheKey::new(key, fetch);
        self.inner
            .entries
            .lock()
            .as_ref()
            .is_some_and(|entries| entries.contains_key(&cache_key))
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().as_ref().map_or(0, IndexMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose every cached query and refuse further rentals. Idempotent.
    pub fn dispose(&self) {
        let entries = self.inner.entries.lock().take();
        let Some(entries) = entries else {
            return;
        };

        tracing::debug!(entries = entries.len(), "query cache disposed");
        for (_, entry) in entries {
            entry.query.dispose();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.entries.lock().is_none()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("len", &self.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Keeps a cache entry rented. Releasing (or dropping) the lease gives the
/// entry back to its invalidator.
pub struct QueryLease {
    lifetime: Arc<LifetimeManager>,
}

impl QueryLease {
    fn new(lifetime: Arc<LifetimeManager>) -> Self {
        Self { lifetime }
    }

    /// Release the lease now.
    pub fn release(self) {}

    /// Subscribers currently renting the same entry, this lease included.
    pub fn subscriber_count(&self) -> usize {
        self.lifetime.subscriber_count()
    }
}

impl Drop for QueryLease {
    fn drop(&mut self) {
        self.lifetime.on_unsubscribed();
    }
}

impl fmt::Debug for QueryLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryLease")
            .field("lifetime", &self.lifetime)
            .finish()
    }
}
