//! Computed Implementation
//!
//! A Computed is a read-only ref whose value is derived from other
//! dependencies by a compute function.
//!
//! # How Computed Values Work
//!
//! 1. On construction, the compute function runs once, synchronously, to
//!    seed a hidden ref. This first run is never scheduled.
//!
//! 2. A watch (without priming) re-runs the compute function on every
//!    dependency notification and writes the result into the hidden ref with
//!    the usual equality-gated `set`.
//!
//! 3. Because the hidden ref is a [`Dependency`], computed values chain into
//!    other computed values and watches.
//!
//! Re-evaluation is eager: one compute call per dependency notification,
//! nothing is batched or deferred to read time.
//!
//! # Failures
//!
//! A failing first evaluation fails construction. A failing re-evaluation is
//! returned to whoever triggered it and stops the computed value from
//! updating, like any failing watch effect.

use std::fmt::Debug;
use std::sync::Arc;

use super::cell::{default_equality, Equality, Ref};
use super::dependency::Dependency;
use super::scheduler::Scheduler;
use super::stream::Observer;
use super::subscriber::Subscription;
use super::watch::{Watch, WatchOptions};
use crate::error::ReactiveError;

/// Configuration for a computed value.
pub struct ComputedOptions<T> {
    /// Decides whether a recomputed value is a change worth notifying.
    pub equality: Equality<T>,

    /// Where re-evaluations run. `None` runs them on the notifying thread.
    pub scheduler: Option<Arc<dyn Scheduler>>,
}

impl<T: 'static> ComputedOptions<T> {
    /// Options using `equality` and no scheduler.
    pub fn with_equality(equality: Equality<T>) -> Self {
        Self {
            equality,
            scheduler: None,
        }
    }

    /// Route re-evaluations through `scheduler`.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }
}

impl<T: PartialEq + 'static> Default for ComputedOptions<T> {
    fn default() -> Self {
        Self::with_equality(default_equality())
    }
}

/// A derived, read-only reactive value.
///
/// # Type Parameters
///
/// - `T`: The type of the computed value. Must be Clone + Send + Sync.
///
/// # Example
///
/// ```rust
/// use tidal_core::reactive::{Computed, Ref};
///
/// let count = Ref::new(2);
/// let source = count.clone();
/// let doubled = Computed::new(&[&count], move || source.get() * 2).unwrap();
/// assert_eq!(doubled.get(), 4);
///
/// count.set(5).unwrap();
/// assert_eq!(doubled.get(), 10);
/// ```
pub struct Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The hidden ref holding the latest computed value.
    value: Ref<T>,

    /// The watch re-evaluating on dependency changes.
    watch: Watch,
}

impl<T> Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a computed value with an infallible compute function.
    pub fn new<F>(dependencies: &[&dyn Dependency], compute: F) -> Result<Self, ReactiveError>
    where
        T: PartialEq,
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::with_options(dependencies, ComputedOptions::default(), move || Ok(compute()))
    }

    /// Create a computed value whose compute function may fail.
    pub fn try_new<F>(dependencies: &[&dyn Dependency], compute: F) -> Result<Self, ReactiveError>
    where
        T: PartialEq,
        F: Fn() -> Result<T, ReactiveError> + Send + Sync + 'static,
    {
        Self::with_options(dependencies, ComputedOptions::default(), compute)
    }

    /// Create a computed value with explicit options.
    pub fn with_options<F>(
        dependencies: &[&dyn Dependency],
        options: ComputedOptions<T>,
        compute: F,
    ) -> Result<Self, ReactiveError>
    where
        F: Fn() -> Result<T, ReactiveError> + Send + Sync + 'static,
    {
        let initial = compute()?;
        let value = Ref::with_equality(initial, options.equality);

        let target = value.clone();
        let watch_options = WatchOptions {
            scheduler: options.scheduler,
            run_effect_now: false,
            runtime: None,
        };
        let watch = Watch::with_options(dependencies, watch_options, move || {
            let next = compute()?;
            target.set(next)
        })?;

        Ok(Self { value, watch })
    }

    /// Get the current value.
    pub fn get(&self) -> T {
        self.value.get()
    }

    /// Read the current value without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.value.with(f)
    }

    /// Register an observer called with every new value.
    pub fn subscribe<F>(&self, on_change: F) -> Result<Subscription, ReactiveError>
    where
        F: Fn(&T) -> Result<(), ReactiveError> + Send + Sync + 'static,
    {
        self.value.subscribe(on_change)
    }

    /// Number of times the compute function ran, the initial evaluation included.
    pub fn compute_count(&self) -> usize {
        self.watch.run_count() + 1
    }

    /// Number of observers of this computed value.
    pub fn subscriber_count(&self) -> usize {
        self.value.subscriber_count()
    }

    /// Stop tracking the dependencies. The last value stays readable.
    pub fn dispose(&self) {
        self.watch.dispose();
    }

    /// Whether the computed value stopped updating.
    pub fn is_disposed(&self) -> bool {
        self.watch.is_disposed()
    }

    /// The failure that stopped this computed value, if any.
    pub fn failure(&self) -> Option<ReactiveError> {
        self.watch.failure()
    }
}

impl<T> Dependency for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn observe_changes(&self, downstream: Observer<()>) -> Result<Subscription, ReactiveError> {
        self.value.observe_changes(downstream)
    }
}

impl<T> Clone for Computed<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            watch: self.watch.clone(),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Computed")
            .field("value", &self.get())
            .field("compute_count", &self.compute_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::cell::equality;
    use crate::reactive::scheduler::QueueScheduler;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[test]
    fn computes_once_on_construction() {
        let call_count = Arc::new(AtomicI32::new(0));
        let call_count_clone = call_count.clone();

        let computed = Computed::new(&[], move || {
            call_count_clone.fetch_add(1, Ordering::SeqCst);
            42
        })
        .unwrap();

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(computed.get(), 42);
        assert_eq!(computed.get(), 42);
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recomputes_once_per_notification() {
        let dep = Ref::new(1);
        let source = dep.clone();
        let computed = Computed::new(&[&dep], move || source.get() * 10).unwrap();

        for n in 2..=5 {
            dep.set(n).unwrap();
            assert_eq!(computed.get(), n * 10);
        }
        assert_eq!(computed.compute_count(), 5);

        // A forced notification recomputes even without a change.
        dep.notify().unwrap();
        assert_eq!(computed.compute_count(), 6);
    }

    #[test]
    fn computed_chains_into_computed() {
        let base = Ref::new(5);

        let source = base.clone();
        let doubled = Computed::new(&[&base], move || source.get() * 2).unwrap();

        let doubled_source = doubled.clone();
        let plus_ten = Computed::new(&[&doubled], move || doubled_source.get() + 10).unwrap();

        assert_eq!(doubled.get(), 10);
        assert_eq!(plus_ten.get(), 20);

        base.set(10).unwrap();
        assert_eq!(doubled.get(), 20);
        assert_eq!(plus_ten.get(), 30);
    }

    #[test]
    fn unchanged_result_does_not_notify_downstream() {
        let dep = Ref::new(1);
        let source = dep.clone();
        let parity = Computed::new(&[&dep], move || source.get() % 2).unwrap();

        let notified = Arc::new(AtomicI32::new(0));
        let notified_clone = notified.clone();
        let _sub = parity
            .subscribe(move |_| {
                notified_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        dep.set(3).unwrap();
        dep.set(5).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 0);

        dep.set(6).unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn custom_equality_applies_to_results() {
        let dep = Ref::new(1.0_f64);
        let source = dep.clone();
        let options = ComputedOptions::with_equality(equality(|a: &f64, b: &f64| (a - b).abs() < 0.5));
        let rounded = Computed::with_options(&[&dep], options, move || Ok(source.get())).unwrap();

        dep.set(1.2).unwrap();
        assert_eq!(rounded.get(), 1.0);
        dep.set(2.0).unwrap();
        assert_eq!(rounded.get(), 2.0);
    }

    #[test]
    fn failing_initial_compute_fails_construction() {
        let dep = Ref::new(0);
        let result: Result<Computed<i32>, _> = Computed::try_new(&[&dep], || {
            Err(ReactiveError::observer(anyhow::anyhow!("cannot start")))
        });
        assert!(result.is_err());
        assert_eq!(dep.subscriber_count(), 0);
    }

    #[test]
    fn failing_recompute_reaches_setter_and_stops_updates() {
        let dep = Ref::new(1);
        let source = dep.clone();
        let computed = Computed::try_new(&[&dep], move || {
            let v = source.get();
            if v < 0 {
                Err(ReactiveError::observer(anyhow::anyhow!("negative")))
            } else {
                Ok(v)
            }
        })
        .unwrap();

        assert!(dep.set(-1).is_err());
        assert!(computed.is_disposed());
        assert_eq!(computed.get(), 1);

        dep.set(7).unwrap();
        assert_eq!(computed.get(), 1);
    }

    #[test]
    fn scheduler_defers_recompute_but_not_initial_value() {
        let dep = Ref::new(1);
        let source = dep.clone();
        let queue = Arc::new(QueueScheduler::new());
        let options = ComputedOptions::default().with_scheduler(queue.clone());

        let computed = Computed::with_options(&[&dep], options, move || Ok(source.get() + 1)).unwrap();
        assert_eq!(computed.get(), 2);

        dep.set(5).unwrap();
        assert_eq!(computed.get(), 2);

        queue.run_pending().unwrap();
        assert_eq!(computed.get(), 6);
    }

    #[test]
    fn dispose_freezes_value() {
        let dep = Ref::new(1);
        let source = dep.clone();
        let computed = Computed::new(&[&dep], move || source.get()).unwrap();

        computed.dispose();
        computed.dispose();
        dep.set(2).unwrap();
        assert_eq!(computed.get(), 1);
    }
}
