//! Cache invalidation policies.
//!
//! An invalidator decides *when* an unreferenced cache entry is evicted. It
//! is told when its entry loses its last subscriber and when it gains one
//! again; eviction itself goes through the `try_invalidate` callback, which
//! is a no-op once the entry has been reactivated or already evicted.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::key::QueryKey;

/// Attempts to evict an entry. Returns whether it was evicted.
///
/// Safe to call any number of times, from any thread, at any time.
pub type TryInvalidate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A pluggable eviction policy for one cache entry.
pub trait CacheInvalidator: Send + Sync {
    /// The entry's subscriber count dropped to zero.
    fn on_query_deactivated(&self, try_invalidate: TryInvalidate);

    /// The entry's subscriber count rose from zero.
    fn on_query_reactivated(&self);
}

/// Evicts an entry as soon as its last subscriber leaves.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateInvalidator;

impl CacheInvalidator for ImmediateInvalidator {
    fn on_query_deactivated(&self, try_invalidate: TryInvalidate) {
        try_invalidate();
    }

    fn on_query_reactivated(&self) {}
}

/// Keeps entries until the cache is disposed.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverInvalidator;

impl CacheInvalidator for NeverInvalidator {
    fn on_query_deactivated(&self, _try_invalidate: TryInvalidate) {}

    fn on_query_reactivated(&self) {}
}

/// Evicts an entry once it has been unreferenced for a fixed delay.
///
/// Reactivation before the delay elapses cancels the pending eviction.
pub struct DelayedInvalidator {
    delay: Duration,
    runtime: Handle,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl DelayedInvalidator {
    pub fn new(delay: Duration, runtime: Handle) -> Self {
        Self {
            delay,
            runtime,
            pending: Mutex::new(None),
        }
    }

    fn cancel_pending(&self) {
        if let Some(timer) = self.pending.lock().take() {
            timer.abort();
        }
    }
}

impl CacheInvalidator for DelayedInvalidator {
    fn on_query_deactivated(&self, try_invalidate: TryInvalidate) {
        let delay = self.delay;
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if try_invalidate() {
                tracing::debug!(?delay, "cache entry expired");
            }
        });
        if let Some(previous) = self.pending.lock().replace(timer) {
            previous.abort();
        }
    }

    fn on_query_reactivated(&self) {
        self.cancel_pending();
    }
}

impl Drop for DelayedInvalidator {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

impl fmt::Debug for DelayedInvalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedInvalidator")
            .field("delay", &self.delay)
            .field("pending", &self.pending.lock().is_some())
            .finish()
    }
}

/// Creates the invalidator for each new cache entry.
pub trait InvalidatorFactory: Send + Sync {
    fn create(&self, key: &QueryKey, runtime: &Handle) -> Box<dyn CacheInvalidator>;
}

impl<F> InvalidatorFactory for F
where
    F: Fn(&QueryKey) -> Box<dyn CacheInvalidator> + Send + Sync,
{
    fn create(&self, key: &QueryKey, _runtime: &Handle) -> Box<dyn CacheInvalidator> {
        self(key)
    }
}

/// The built-in eviction policies, usable as an [`InvalidatorFactory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationPolicy {
    /// Evict as soon as the last subscriber leaves.
    Immediate,
    /// Evict after the entry has been unreferenced for this long.
    Delayed(Duration),
    /// Never evict; entries live until the cache is disposed.
    Never,
}

impl Default for InvalidationPolicy {
    fn default() -> Self {
        InvalidationPolicy::Delayed(Duration::from_secs(5 * 60))
    }
}

impl InvalidatorFactory for InvalidationPolicy {
    fn create(&self, _key: &QueryKey, runtime: &Handle) -> Box<dyn CacheInvalidator> {
        match *self {
            InvalidationPolicy::Immediate => Box::new(ImmediateInvalidator),
            InvalidationPolicy::Delayed(delay) => Box::new(DelayedInvalidator::new(delay, runtime.clone())),
            InvalidationPolicy::Never => Box::new(NeverInvalidator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, TryInvalidate) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let callback: TryInvalidate = Arc::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            true
        });
        (calls, callback)
    }

    #[test]
    fn immediate_invalidates_right_away() {
        let (calls, callback) = counting();
        ImmediateInvalidator.on_query_deactivated(callback);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_does_not_invalidate() {
        let (calls, callback) = counting();
        NeverInvalidator.on_query_deactivated(callback);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_waits_for_the_delay() {
        let (calls, callback) = counting();
        let invalidator = DelayedInvalidator::new(Duration::from_secs(60), Handle::current());

        invalidator.on_query_deactivated(callback);
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reactivation_cancels_pending_eviction() {
        let (calls, callback) = counting();
        let invalidator = DelayedInvalidator::new(Duration::from_secs(60), Handle::current());

        invalidator.on_query_deactivated(callback);
        tokio::time::sleep(Duration::from_secs(30)).await;
        invalidator.on_query_reactivated();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_cancels_pending_eviction() {
        let (calls, callback) = counting();
        let invalidator = DelayedInvalidator::new(Duration::from_secs(1), Handle::current());
        invalidator.on_query_deactivated(callback);
        drop(invalidator);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn policy_serializes_in_snake_case() {
        let json = serde_json::to_string(&InvalidationPolicy::Immediate).unwrap();
        assert_eq!(json, r#""immediate""#);

        let parsed: InvalidationPolicy =
            serde_json::from_str(r#"{"delayed":{"secs":30,"nanos":0}}"#).unwrap();
        assert_eq!(parsed, InvalidationPolicy::Delayed(Duration::from_secs(30)));
        assert_eq!(
            InvalidationPolicy::default(),
            InvalidationPolicy::Delayed(Duration::from_secs(300))
        );
    }
}
