//! Ref Implementation
//!
//! A Ref is the fundamental reactive primitive: a mutable cell that tells its
//! subscribers when its value changes.
//!
//! # How Refs Work
//!
//! 1. A write compares the new value against the current one with the ref's
//!    equality comparator. Equal writes are dropped silently.
//!
//! 2. An effective write stores the value and then synchronously notifies
//!    every subscriber, in subscription order, on the writer's thread.
//!
//! 3. A subscriber error stops delivery to later subscribers and is returned
//!    to the writer.
//!
//! # Thread Safety
//!
//! Every read and write goes through one mutex per ref, so concurrent writers
//! observe a consistent compare-and-swap. Notification happens after the
//! mutex is released.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::dependency::Dependency;
use super::stream::{observer, Event, NotificationStream, Observer};
use super::subscriber::Subscription;
use crate::error::ReactiveError;

/// Counter for generating unique ref IDs.
static REF_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique ref ID.
fn next_ref_id() -> u64 {
    REF_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Equality comparator deciding whether a write is a change.
pub type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Box a closure as an [`Equality`].
pub fn equality<T, F>(f: F) -> Equality<T>
where
    F: Fn(&T, &T) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// `PartialEq`-based equality, the default for refs and computed values.
pub fn default_equality<T: PartialEq + 'static>() -> Equality<T> {
    equality(|a: &T, b: &T| a == b)
}

/// Equality that treats every write as a change.
pub fn never_equal<T: 'static>() -> Equality<T> {
    equality(|_: &T, _: &T| false)
}

/// A mutable reactive cell holding a value of type T.
///
/// # Type Parameters
///
/// - `T`: The type of value stored in the ref. Must be Clone + Send + Sync.
///
/// # Example
///
/// ```rust
/// use tidal_core::reactive::Ref;
///
/// let count = Ref::new(0);
/// assert_eq!(count.get(), 0);
///
/// count.set(5).unwrap();
/// assert_eq!(count.get(), 5);
/// ```
pub struct Ref<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Unique identifier for this ref.
    id: u64,

    /// The current value. The single mutual-exclusion point for this ref.
    value: Arc<Mutex<T>>,

    equality: Equality<T>,

    /// Change notifications, carrying the value that was written.
    changed: NotificationStream<T>,
}

impl<T> Ref<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new ref compared with `PartialEq`.
    pub fn new(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(value, default_equality())
    }

    /// Create a new ref with a custom equality comparator.
    pub fn with_equality(value: T, equality: Equality<T>) -> Self {
        Self {
            id: next_ref_id(),
            value: Arc::new(Mutex::new(value)),
            equality,
            changed: NotificationStream::new(),
        }
    }

    /// Get the ref's unique ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get a clone of the current value.
    pub fn get(&self) -> T {
        self.value.lock().clone()
    }

    /// Read the current value without cloning it.
    ///
    /// The ref is locked while `f` runs; `f` must not write to this ref.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.lock())
    }

    /// Set a new value and notify subscribers if it changed.
    pub fn set(&self, value: T) -> Result<(), ReactiveError> {
        self.set_value(value, false).map(|_| ())
    }

    /// Set a new value, optionally withholding the notification.
    ///
    /// Returns whether the value effectively changed. A caller that
    /// suppressed the notification can flush it later with
    /// [`notify`](Ref::notify).
    pub fn set_value(&self, value: T, suppress_notification: bool) -> Result<bool, ReactiveError> {
        self.commit(move |_| value, suppress_notification)
    }

    /// Update the value using a function of the current value.
    ///
    /// The read, the comparison and the write happen under the ref's lock,
    /// so concurrent updates never lose a write. Returns whether the value
    /// effectively changed.
    pub fn update<F>(&self, f: F) -> Result<bool, ReactiveError>
    where
        F: FnOnce(&T) -> T,
    {
        self.commit(f, false)
    }

    fn commit<F>(&self, next: F, suppress_notification: bool) -> Result<bool, ReactiveError>
    where
        F: FnOnce(&T) -> T,
    {
        let snapshot = {
            let mut current = self.value.lock();
            let value = next(&*current);
            if (self.equality)(&*current, &value) {
                return Ok(false);
            }
            *current = value;
            (!suppress_notification).then(|| current.clone())
        };

        if let Some(snapshot) = snapshot {
            tracing::trace!(ref_id = self.id, "ref changed");
            self.changed.emit(&snapshot)?;
        }
        Ok(true)
    }

    /// Re-emit a notification with the current value, without comparing or
    /// changing it.
    pub fn notify(&self) -> Result<(), ReactiveError> {
        let snapshot = self.get();
        tracing::trace!(ref_id = self.id, "ref notified");
        self.changed.emit(&snapshot)
    }

    /// Register an observer called with every notified value.
    pub fn subscribe<F>(&self, on_change: F) -> Result<Subscription, ReactiveError>
    where
        F: Fn(&T) -> Result<(), ReactiveError> + Send + Sync + 'static,
    {
        self.changed.subscribe(observer(move |event: Event<'_, T>| match event {
            Event::Next(value) => on_change(value),
            Event::Completed | Event::Failed(_) => Ok(()),
        }))
    }

    /// Get the number of subscribers, watches and computed values included.
    pub fn subscriber_count(&self) -> usize {
        self.changed.observer_count()
    }
}

impl<T> Dependency for Ref<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn observe_changes(&self, downstream: Observer<()>) -> Result<Subscription, ReactiveError> {
        self.changed
            .subscribe(observer(move |event: Event<'_, T>| downstream(event.erase())))
    }
}

impl<T> Clone for Ref<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            value: Arc::clone(&self.value),
            equality: Arc::clone(&self.equality),
            changed: self.changed.clone(),
        }
    }
}

impl<T> Debug for Ref<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.id)
            .field("value", &self.get())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn counter_on(r: &Ref<i32>) -> (Arc<AtomicI32>, Subscription) {
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();
        let subscription = r
            .subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        (count, subscription)
    }

    #[test]
    fn ref_get_and_set() {
        let r = Ref::new(0);
        assert_eq!(r.get(), 0);

        r.set(42).unwrap();
        assert_eq!(r.get(), 42);
    }

    #[test]
    fn ref_update() {
        let r = Ref::new(10);
        assert!(r.update(|v| v + 5).unwrap());
        assert_eq!(r.get(), 15);
        assert!(!r.update(|v| *v).unwrap());
    }

    #[test]
    fn ref_notifies_subscribers() {
        let r = Ref::new(0);
        let (count, _sub) = counter_on(&r);

        assert_eq!(count.load(Ordering::SeqCst), 0);

        r.set(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        r.set(2).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn equal_writes_do_not_notify() {
        let r = Ref::new(0);
        let (count, _sub) = counter_on(&r);

        r.set(1).unwrap();
        r.set(1).unwrap();
        r.set(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_equality_gates_notifications() {
        // Equal when both values have the same parity.
        let r = Ref::with_equality(0, equality(|a: &i32, b: &i32| a % 2 == b % 2));
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();
        let _sub = r
            .subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        r.set(2).unwrap();
        assert_eq!(r.get(), 0);
        r.set(3).unwrap();
        assert_eq!(r.get(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_equal_notifies_every_write() {
        let r = Ref::with_equality(1, never_equal());
        let count = Arc::new(AtomicI32::new(0));
        let count_clone = count.clone();
        let _sub = r
            .subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        r.set(1).unwrap();
        r.set(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn suppressed_write_then_notify() {
        let r = Ref::new(0);
        let seen = Arc::new(AtomicI32::new(-1));
        let seen_clone = seen.clone();
        let _sub = r
            .subscribe(move |v| {
                seen_clone.store(*v, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(r.set_value(7, true).unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), -1);
        assert!(!r.set_value(7, true).unwrap());

        r.notify().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn notify_fires_without_change() {
        let r = Ref::new(3);
        let (count, _sub) = counter_on(&r);

        r.notify().unwrap();
        r.notify().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(r.get(), 3);
    }

    #[test]
    fn ref_unsubscribe() {
        let r = Ref::new(0);
        let (count, sub) = counter_on(&r);

        r.set(1).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.dispose();
        sub.dispose();
        r.set(2).unwrap();
        // Should not have been called again
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(r.subscriber_count(), 0);
    }

    #[test]
    fn subscriber_error_reaches_writer_and_stops_delivery() {
        let r = Ref::new(0);
        let _failing = r
            .subscribe(|v| {
                if *v == 13 {
                    Err(ReactiveError::observer(anyhow::anyhow!("unlucky")))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        let (later, _sub) = counter_on(&r);

        r.set(1).unwrap();
        assert_eq!(later.load(Ordering::SeqCst), 1);

        let err = r.set(13).unwrap_err();
        assert!(matches!(err, ReactiveError::Observer(_)));
        // The value was stored; only delivery was aborted.
        assert_eq!(r.get(), 13);
        assert_eq!(later.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ref_clone_shares_state() {
        let ref1 = Ref::new(0);
        let ref2 = ref1.clone();

        ref1.set(42).unwrap();
        assert_eq!(ref2.get(), 42);

        ref2.set(100).unwrap();
        assert_eq!(ref1.get(), 100);
    }

    #[test]
    fn ref_ids_are_unique() {
        let r1 = Ref::new(0);
        let r2 = Ref::new(0);
        let r3 = Ref::new(0);

        assert_ne!(r1.id(), r2.id());
        assert_ne!(r2.id(), r3.id());
        assert_ne!(r1.id(), r3.id());
    }

    #[test]
    fn concurrent_increments_are_serialized() {
        let r = Ref::new(0);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        r.update(|v| v + 1).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(r.get(), 800);
    }
}
