//! Subscriber identities and subscription disposers.
//!
//! Every registration on a notification stream gets a unique
//! [`SubscriberId`]. The registration hands back a [`Subscription`] that
//! removes exactly that registration when disposed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Unique identifier for a subscriber.
///
/// Each registration (ref observer, watch, computed) gets a unique ID so the
/// stream can remove exactly that registration later, even when the same
/// closure was registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

type Disposer = Box<dyn FnOnce() + Send>;

/// Handle returned by every `subscribe` call.
///
/// Disposing removes the registration. Disposing twice is a no-op. Dropping
/// the handle does *not* dispose it: a subscription lives as long as its
/// source unless disposed explicitly.
pub struct Subscription {
    disposer: Mutex<Option<Disposer>>,
}

impl Subscription {
    /// Create a subscription that runs `dispose` on first disposal.
    pub fn new<F>(dispose: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            disposer: Mutex::new(Some(Box::new(dispose))),
        }
    }

    /// A subscription with nothing to release.
    pub fn empty() -> Self {
        Self {
            disposer: Mutex::new(None),
        }
    }

    /// Release the registration. Idempotent.
    pub fn dispose(&self) {
        // Take the disposer before running it so a re-entrant dispose from
        // inside the disposer sees an empty slot.
        let disposer = self.disposer.lock().take();
        if let Some(dispose) = disposer {
            dispose();
        }
    }

    /// Whether this subscription has been disposed (or never held anything).
    pub fn is_disposed(&self) -> bool {
        self.disposer.lock().is_none()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn dispose_runs_once() {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        let subscription = Subscription::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!subscription.is_disposed());

        subscription.dispose();
        subscription.dispose();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(subscription.is_disposed());
    }

    #[test]
    fn dropping_does_not_dispose() {
        let calls = Arc::new(AtomicI32::new(0));
        let calls_clone = calls.clone();

        drop(Subscription::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_subscription_is_disposed() {
        let subscription = Subscription::empty();
        assert!(subscription.is_disposed());
        subscription.dispose();
    }
}
