//! Notification Streams
//!
//! A notification stream is the broadcast point behind every reactive
//! source. Observers are called synchronously, on the emitting thread, in
//! subscription order.
//!
//! # Termination
//!
//! A stream may complete or fail exactly once. Termination is delivered to
//! every current observer and the observer list is cleared. Observers that
//! subscribe afterwards receive the terminal event immediately.
//!
//! # Locking
//!
//! The observer list is guarded by one mutex. Emission snapshots the list
//! under the lock and calls observers after releasing it, so an observer may
//! subscribe or unsubscribe on the same stream without deadlocking.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::subscriber::{SubscriberId, Subscription};
use crate::error::ReactiveError;

/// An event delivered to a stream observer.
#[derive(Debug)]
pub enum Event<'a, E> {
    /// The source produced a new value.
    Next(&'a E),
    /// The source will not produce any more values.
    Completed,
    /// The source failed and will not produce any more values.
    Failed(&'a ReactiveError),
}

impl<'a, E> Event<'a, E> {
    /// Drop the payload, keeping only the fact that something happened.
    pub fn erase(self) -> Event<'a, ()> {
        match self {
            Event::Next(_) => Event::Next(&()),
            Event::Completed => Event::Completed,
            Event::Failed(err) => Event::Failed(err),
        }
    }
}

impl<E> Clone for Event<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Event<'_, E> {}

/// A registered stream observer.
///
/// Returning an error aborts delivery of the current event to the remaining
/// observers and hands the error back to whoever triggered the emission.
pub type Observer<E> = Arc<dyn Fn(Event<'_, E>) -> Result<(), ReactiveError> + Send + Sync>;

/// Box a closure as an [`Observer`].
pub fn observer<E, F>(f: F) -> Observer<E>
where
    F: Fn(Event<'_, E>) -> Result<(), ReactiveError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Failed(ReactiveError),
}

struct StreamState<E> {
    observers: SmallVec<[(SubscriberId, Observer<E>); 4]>,
    terminal: Option<Terminal>,
}

/// A synchronous, multi-observer notification stream.
///
/// Clones share the same observer list.
pub struct NotificationStream<E> {
    state: Arc<Mutex<StreamState<E>>>,
}

impl<E: 'static> NotificationStream<E> {
    /// Create a new, open stream with no observers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StreamState {
                observers: SmallVec::new(),
                terminal: None,
            })),
        }
    }

    /// Register an observer.
    ///
    /// If the stream already terminated, the terminal event is delivered
    /// right away and an already-disposed subscription is returned.
    pub fn subscribe(&self, observer: Observer<E>) -> Result<Subscription, ReactiveError> {
        let id = SubscriberId::new();
        let mut state = self.state.lock();
        if let Some(terminal) = state.terminal.clone() {
            drop(state);
            match &terminal {
                Terminal::Completed => observer(Event::Completed)?,
                Terminal::Failed(err) => observer(Event::Failed(err))?,
            }
            return Ok(Subscription::empty());
        }
        state.observers.push((id, observer));
        drop(state);

        let weak: Weak<Mutex<StreamState<E>>> = Arc::downgrade(&self.state);
        Ok(Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                // Drop the removed observer after the lock is released.
                let removed = {
                    let mut state = state.lock();
                    match state.observers.iter().position(|(sid, _)| *sid == id) {
                        Some(index) => Some(state.observers.remove(index)),
                        None => None,
                    }
                };
                drop(removed);
            }
        }))
    }

    /// Deliver `value` to every current observer, in subscription order.
    ///
    /// The first observer error stops delivery and is returned.
    pub fn emit(&self, value: &E) -> Result<(), ReactiveError> {
        let observers = self.snapshot();
        for observer in observers {
            observer(Event::Next(value))?;
        }
        Ok(())
    }

    /// Complete the stream. Later calls are no-ops.
    ///
    /// Every observer is told, even if one of them fails; the first failure
    /// is returned.
    pub fn complete(&self) -> Result<(), ReactiveError> {
        self.terminate(Terminal::Completed)
    }

    /// Fail the stream with `err`. Later calls are no-ops.
    ///
    /// Every observer is told, even if one of them fails; the first failure
    /// is returned.
    pub fn fail(&self, err: ReactiveError) -> Result<(), ReactiveError> {
        self.terminate(Terminal::Failed(err))
    }

    /// Number of currently registered observers.
    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    /// Whether the stream has completed or failed.
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }

    fn snapshot(&self) -> SmallVec<[Observer<E>; 4]> {
        let state = self.state.lock();
        if state.terminal.is_some() {
            return SmallVec::new();
        }
        state.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
    }

    fn terminate(&self, terminal: Terminal) -> Result<(), ReactiveError> {
        let observers = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return Ok(());
            }
            state.terminal = Some(terminal.clone());
            std::mem::take(&mut state.observers)
        };

        let mut first_error = None;
        for (_, observer) in observers {
            let result = match &terminal {
                Terminal::Completed => observer(Event::Completed),
                Terminal::Failed(err) => observer(Event::Failed(err)),
            };
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<E: 'static> Default for NotificationStream<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for NotificationStream<E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<E: 'static> fmt::Debug for NotificationStream<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationStream")
            .field("observer_count", &self.observer_count())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn recorder(log: &Arc<PlMutex<Vec<String>>>, name: &'static str) -> Observer<i32> {
        let log = log.clone();
        observer(move |event| {
            let entry = match event {
                Event::Next(v) => format!("{name}:{v}"),
                Event::Completed => format!("{name}:done"),
                Event::Failed(_) => format!("{name}:failed"),
            };
            log.lock().push(entry);
            Ok(())
        })
    }

    #[test]
    fn emits_in_subscription_order() {
        let stream = NotificationStream::new();
        let log = Arc::new(PlMutex::new(Vec::new()));

        let _a = stream.subscribe(recorder(&log, "a")).unwrap();
        let _b = stream.subscribe(recorder(&log, "b")).unwrap();

        stream.emit(&1).unwrap();
        stream.emit(&2).unwrap();

        assert_eq!(*log.lock(), vec!["a:1", "b:1", "a:2", "b:2"]);
    }

    #[test]
    fn dispose_removes_only_that_observer() {
        let stream = NotificationStream::new();
        let log = Arc::new(PlMutex::new(Vec::new()));

        let a = stream.subscribe(recorder(&log, "a")).unwrap();
        let _b = stream.subscribe(recorder(&log, "b")).unwrap();
        a.dispose();
        a.dispose();

        stream.emit(&7).unwrap();
        assert_eq!(*log.lock(), vec!["b:7"]);
        assert_eq!(stream.observer_count(), 1);
    }

    #[test]
    fn observer_error_aborts_delivery() {
        let stream = NotificationStream::new();
        let reached = Arc::new(AtomicI32::new(0));
        let reached_clone = reached.clone();

        let _failing = stream
            .subscribe(observer(|_| Err(ReactiveError::observer(anyhow::anyhow!("nope")))))
            .unwrap();
        let _after = stream
            .subscribe(observer(move |_| {
                reached_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        assert!(stream.emit(&1).is_err());
        assert_eq!(reached.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn completion_reaches_everyone_and_clears() {
        let stream = NotificationStream::new();
        let log = Arc::new(PlMutex::new(Vec::new()));

        let _a = stream.subscribe(recorder(&log, "a")).unwrap();
        stream.complete().unwrap();
        stream.complete().unwrap();
        stream.emit(&3).unwrap();

        assert_eq!(*log.lock(), vec!["a:done"]);
        assert_eq!(stream.observer_count(), 0);

        // Late subscribers see the terminal event immediately.
        let late = stream.subscribe(recorder(&log, "late")).unwrap();
        assert!(late.is_disposed());
        assert_eq!(log.lock().last().map(String::as_str), Some("late:done"));
    }

    #[test]
    fn observer_may_unsubscribe_itself_during_emit() {
        let stream: NotificationStream<i32> = NotificationStream::new();
        let slot: Arc<PlMutex<Option<Subscription>>> = Arc::new(PlMutex::new(None));
        let calls = Arc::new(AtomicI32::new(0));

        let slot_clone = slot.clone();
        let calls_clone = calls.clone();
        let subscription = stream
            .subscribe(observer(move |_| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                if let Some(sub) = slot_clone.lock().as_ref() {
                    sub.dispose();
                }
                Ok(())
            }))
            .unwrap();
        *slot.lock() = Some(subscription);

        stream.emit(&1).unwrap();
        stream.emit(&2).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
