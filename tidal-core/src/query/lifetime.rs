//! Reference counting for cache entries.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::invalidator::{CacheInvalidator, TryInvalidate};

/// Removes an entry from its cache, given the entry's lifetime manager.
pub(crate) type Evict = Box<dyn Fn(&LifetimeManager) + Send + Sync>;

/// Outcome of [`LifetimeManager::on_subscribed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Subscribed {
    /// The entry is invalidated and was not counted.
    Refused,
    Counted,
    /// The first subscriber after the entry went idle.
    Reactivated,
}

#[derive(Debug, Default)]
struct Counts {
    subscribers: usize,
    invalidated: bool,
}

/// Tracks the subscribers of one cache entry and evicts it through its
/// invalidator once nobody is left.
///
/// The invalidator is always called outside the manager's lock, because an
/// immediate invalidator calls straight back into [`try_invalidate`].
/// Reactivation is left to the caller, which may hold the cache lock while
/// counting.
///
/// [`try_invalidate`]: LifetimeManager::try_invalidate
pub(crate) struct LifetimeManager {
    counts: Mutex<Counts>,
    invalidator: Box<dyn CacheInvalidator>,
    evict: Evict,
}

impl LifetimeManager {
    pub(crate) fn new(invalidator: Box<dyn CacheInvalidator>, evict: Evict) -> Self {
        Self {
            counts: Mutex::new(Counts::default()),
            invalidator,
            evict,
        }
    }

    /// Count a new subscriber.
    ///
    /// An entry that was already invalidated refuses the subscriber; the
    /// caller must then create a fresh entry. On [`Subscribed::Reactivated`]
    /// the caller must call [`reactivated`](Self::reactivated) once it holds
    /// no locks.
    pub(crate) fn on_subscribed(&self) -> Subscribed {
        let mut counts = self.counts.lock();
        if counts.invalidated {
            return Subscribed::Refused;
        }
        counts.subscribers += 1;
        if counts.subscribers == 1 {
            Subscribed::Reactivated
        } else {
            Subscribed::Counted
        }
    }

    /// Tell the invalidator the entry is in use again.
    pub(crate) fn reactivated(&self) {
        self.invalidator.on_query_reactivated();
    }

    /// Release one subscriber.
    pub(crate) fn on_unsubscribed(self: &Arc<Self>) {
        let deactivated = {
            let mut counts = self.counts.lock();
            if counts.subscribers == 0 {
                tracing::warn!("cache entry released more often than rented");
                return;
            }
            counts.subscribers -= 1;
            counts.subscribers == 0 && !counts.invalidated
        };
        if deactivated {
            let weak: Weak<Self> = Arc::downgrade(self);
            let try_invalidate: TryInvalidate =
                Arc::new(move || weak.upgrade().is_some_and(|lifetime| lifetime.try_invalidate()));
            self.invalidator.on_query_deactivated(try_invalidate);
        }
    }

    /// Evict the entry if it is still unreferenced and not yet evicted.
    pub(crate) fn try_invalidate(&self) -> bool {
        {
            let mut counts = self.counts.lock();
            if counts.invalidated || counts.subscribers > 0 {
                return false;
            }
            counts.invalidated = true;
        }
        (self.evict)(self);
        true
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.counts.lock().subscribers
    }
}

impl fmt::Debug for LifetimeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.counts.lock();
        f.debug_struct("LifetimeManager")
            .field("subscribers", &counts.subscribers)
            .field("invalidated", &counts.invalidated)
            .finish()
    }
}
