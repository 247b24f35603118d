//! The Dependency capability.
//!
//! Anything that can be watched exposes a change stream. Refs and computed
//! values implement [`Dependency`] directly; any other notification source
//! is adapted through a [`Trigger`].

use std::sync::Arc;

use super::stream::{NotificationStream, Observer};
use super::subscriber::Subscription;
use crate::error::ReactiveError;

/// A source that can be watched.
///
/// Observers receive one `Event::Next(&())` per change, and at most one
/// terminal event.
pub trait Dependency: Send + Sync {
    /// Register an observer on this source's change stream.
    fn observe_changes(&self, observer: Observer<()>) -> Result<Subscription, ReactiveError>;
}

impl<D: Dependency + ?Sized> Dependency for Arc<D> {
    fn observe_changes(&self, observer: Observer<()>) -> Result<Subscription, ReactiveError> {
        (**self).observe_changes(observer)
    }
}

impl<D: Dependency + ?Sized> Dependency for &D {
    fn observe_changes(&self, observer: Observer<()>) -> Result<Subscription, ReactiveError> {
        (**self).observe_changes(observer)
    }
}

/// Adapter turning an external notification source into a [`Dependency`].
///
/// Whatever drives the source calls [`fire`](Trigger::fire) on each change,
/// and [`complete`](Trigger::complete) or [`fail`](Trigger::fail) when it
/// stops.
#[derive(Clone, Default, Debug)]
pub struct Trigger {
    stream: NotificationStream<()>,
}

impl Trigger {
    /// Create a new open trigger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal a change to every watcher.
    pub fn fire(&self) -> Result<(), ReactiveError> {
        self.stream.emit(&())
    }

    /// Stop notifying; watchers drop this source from their dependency set.
    pub fn complete(&self) -> Result<(), ReactiveError> {
        self.stream.complete()
    }

    /// Fail the source; every watcher is torn down and the failure returned.
    pub fn fail(&self, err: impl Into<anyhow::Error>) -> Result<(), ReactiveError> {
        self.stream.fail(ReactiveError::dependency(err))
    }

    /// Number of registered watchers.
    pub fn observer_count(&self) -> usize {
        self.stream.observer_count()
    }
}

impl Dependency for Trigger {
    fn observe_changes(&self, observer: Observer<()>) -> Result<Subscription, ReactiveError> {
        self.stream.subscribe(observer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::stream::{observer, Event};
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn trigger_fires_observers() {
        let trigger = Trigger::new();
        let fired = Arc::new(AtomicI32::new(0));
        let fired_clone = fired.clone();

        let subscription = trigger
            .observe_changes(observer(move |event| {
                if let Event::Next(()) = event {
                    fired_clone.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }))
            .unwrap();

        trigger.fire().unwrap();
        trigger.fire().unwrap();
        subscription.dispose();
        trigger.fire().unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn trigger_failure_is_wrapped_as_dependency_error() {
        let trigger = Trigger::new();
        let _subscription = trigger
            .observe_changes(observer(|event| match event {
                Event::Failed(err) => Err(err.clone()),
                _ => Ok(()),
            }))
            .unwrap();

        let err = trigger.fail(anyhow::anyhow!("source broke")).unwrap_err();
        assert!(matches!(err, ReactiveError::Dependency(_)));
    }

    #[test]
    fn arc_dependency_delegates() {
        let trigger: Arc<dyn Dependency> = Arc::new(Trigger::new());
        let subscription = trigger.observe_changes(observer(|_| Ok(()))).unwrap();
        assert!(!subscription.is_disposed());
    }
}
