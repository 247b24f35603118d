//! Watch Implementation
//!
//! A Watch runs a side effect every time one of an explicit list of
//! dependencies fires.
//!
//! # How Watches Work
//!
//! 1. The change streams of all dependencies are merged into one. Every
//!    notification on any of them runs the effect once.
//!
//! 2. `watch_effect` additionally runs the effect once before subscribing.
//!    That priming call is never routed through a scheduler.
//!
//! 3. With a scheduler, each notification becomes a task on that scheduler.
//!    Without one, the effect runs on the notifying thread.
//!
//! 4. The merge point handles one notification at a time. A notification
//!    raised by the effect itself (on the same thread) re-enters directly.
//!
//! # Teardown
//!
//! A watch ends when it is disposed, when every dependency has completed,
//! when any dependency fails, or when the effect fails. Failures are
//! returned to whoever triggered the notification. After teardown the effect
//! never starts again.
//!
//! # Locking
//!
//! A synchronous effect runs while its watch's merge point is held. Two
//! watches whose effects write into each other's dependencies from different
//! threads can therefore deadlock. Keep such cycles on one thread, or give
//! one of the watches a scheduler.
//!
//! # Async Effects
//!
//! The async forms spawn each invocation onto a tokio runtime without
//! waiting for the previous one, so invocations may overlap. Every
//! invocation receives the watch's [`CancelToken`], which is cancelled on
//! teardown.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;

use super::cancel::CancelToken;
use super::dependency::Dependency;
use super::scheduler::Scheduler;
use super::stream::{observer, Event};
use super::subscriber::{SubscriberId, Subscription};
use crate::error::ReactiveError;

type SyncEffect = Arc<dyn Fn() -> Result<(), ReactiveError> + Send + Sync>;
type AsyncEffect =
    Arc<dyn Fn(CancelToken) -> BoxFuture<'static, Result<(), ReactiveError>> + Send + Sync>;

enum EffectFn {
    Sync(SyncEffect),
    Async { effect: AsyncEffect, runtime: Handle },
}

/// Configuration for a watch.
#[derive(Clone, Default)]
pub struct WatchOptions {
    /// Where notifications are handled. `None` runs them on the notifying thread.
    pub scheduler: Option<Arc<dyn Scheduler>>,

    /// Run the effect once before subscribing.
    pub run_effect_now: bool,

    /// Runtime for async effects. `None` uses the caller's runtime.
    pub runtime: Option<Handle>,
}

impl WatchOptions {
    /// Route notifications through `scheduler`.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set whether the effect is primed before subscribing.
    pub fn run_effect_now(mut self, run_effect_now: bool) -> Self {
        self.run_effect_now = run_effect_now;
        self
    }

    /// Spawn async effects onto `runtime`.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl fmt::Debug for WatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchOptions")
            .field("scheduled", &self.scheduler.is_some())
            .field("run_effect_now", &self.run_effect_now)
            .finish()
    }
}

struct WatchInner {
    id: SubscriberId,
    effect: EffectFn,
    scheduler: Option<Arc<dyn Scheduler>>,

    /// Merge point. Serializes notifications across threads and lets the
    /// effect's own writes re-enter on the same thread.
    gate: ReentrantMutex<()>,

    subscriptions: Mutex<Vec<Subscription>>,

    /// Dependencies that have not completed yet.
    live_dependencies: AtomicUsize,

    disposed: AtomicBool,
    run_count: AtomicUsize,
    failure: Mutex<Option<ReactiveError>>,
    cancel: CancelToken,
}

impl WatchInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn on_event(self: &Arc<Self>, event: Event<'_, ()>) -> Result<(), ReactiveError> {
        match event {
            Event::Next(()) => self.dispatch(),
            Event::Completed => {
                if self.live_dependencies.fetch_sub(1, Ordering::SeqCst) == 1 {
                    tracing::debug!(watch = ?self.id, "all dependencies completed");
                    self.teardown();
                }
                Ok(())
            }
            Event::Failed(err) => {
                if self.is_disposed() {
                    return Ok(());
                }
                Err(self.fail(err.clone()))
            }
        }
    }

    fn dispatch(self: &Arc<Self>) -> Result<(), ReactiveError> {
        if self.is_disposed() {
            return Ok(());
        }
        match &self.scheduler {
            None => self.invoke(),
            Some(scheduler) => {
                let this = Arc::clone(self);
                scheduler.schedule(Box::new(move || this.invoke()))
            }
        }
    }

    fn invoke(self: &Arc<Self>) -> Result<(), ReactiveError> {
        let _gate = self.gate.lock();
        if self.is_disposed() {
            return Ok(());
        }
        self.run_count.fetch_add(1, Ordering::SeqCst);

        match &self.effect {
            EffectFn::Sync(effect) => effect().map_err(|err| self.fail(err)),
            EffectFn::Async { effect, runtime } => {
                let invocation = effect(self.cancel.clone());
                let this = Arc::clone(self);
                runtime.spawn(async move {
                    if let Err(err) = invocation.await {
                        tracing::error!(watch = ?this.id, error = %err, "async watch effect failed");
                        this.fail(err);
                    }
                });
                Ok(())
            }
        }
    }

    /// Record `err` (unless already torn down) and tear down. Returns `err`
    /// for propagation.
    fn fail(&self, err: ReactiveError) -> ReactiveError {
        if !self.is_disposed() {
            self.failure.lock().get_or_insert_with(|| err.clone());
            tracing::debug!(watch = ?self.id, error = %err, "watch failed");
        }
        self.teardown();
        err
    }

    fn adopt(&self, subscription: Subscription) {
        let mut subscriptions = self.subscriptions.lock();
        if self.is_disposed() {
            drop(subscriptions);
            subscription.dispose();
        } else {
            subscriptions.push(subscription);
        }
    }

    fn teardown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            subscription.dispose();
        }
        tracing::debug!(watch = ?self.id, "watch torn down");
    }
}

/// Handle to a running watch.
///
/// Clones control the same watch. Dropping the handle does not stop the
/// watch; call [`dispose`](Watch::dispose).
#[derive(Clone)]
pub struct Watch {
    inner: Arc<WatchInner>,
}

impl Watch {
    /// Start a watch with a synchronous effect.
    pub fn with_options<F>(
        dependencies: &[&dyn Dependency],
        options: WatchOptions,
        effect: F,
    ) -> Result<Self, ReactiveError>
    where
        F: Fn() -> Result<(), ReactiveError> + Send + Sync + 'static,
    {
        Self::start(dependencies, options, EffectFn::Sync(Arc::new(effect)))
    }

    /// Start a watch with a cancellable async effect.
    pub fn with_options_async<F, Fut>(
        dependencies: &[&dyn Dependency],
        options: WatchOptions,
        effect: F,
    ) -> Result<Self, ReactiveError>
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ReactiveError>> + Send + 'static,
    {
        let runtime = match &options.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|_| ReactiveError::NoRuntime("async watch"))?,
        };
        let effect: AsyncEffect = Arc::new(move |token| effect(token).boxed());
        Self::start(dependencies, options, EffectFn::Async { effect, runtime })
    }

    fn start(
        dependencies: &[&dyn Dependency],
        options: WatchOptions,
        effect: EffectFn,
    ) -> Result<Self, ReactiveError> {
        let inner = Arc::new(WatchInner {
            id: SubscriberId::new(),
            effect,
            scheduler: options.scheduler,
            gate: ReentrantMutex::new(()),
            subscriptions: Mutex::new(Vec::with_capacity(dependencies.len())),
            live_dependencies: AtomicUsize::new(dependencies.len()),
            disposed: AtomicBool::new(false),
            run_count: AtomicUsize::new(0),
            failure: Mutex::new(None),
            cancel: CancelToken::new(),
        });

        // Priming is never scheduled.
        if options.run_effect_now {
            inner.invoke()?;
        }

        if dependencies.is_empty() {
            inner.teardown();
            return Ok(Self { inner });
        }

        for dependency in dependencies {
            let target = Arc::clone(&inner);
            let subscription = dependency
                .observe_changes(observer(move |event| target.on_event(event)))
                .map_err(|err| inner.fail(err))?;
            inner.adopt(subscription);
        }

        tracing::trace!(watch = ?inner.id, dependencies = dependencies.len(), "watch started");
        Ok(Self { inner })
    }

    /// Stop the watch. Idempotent.
    ///
    /// A running async invocation is told to cancel but is not awaited.
    pub fn dispose(&self) {
        self.inner.teardown();
    }

    /// Whether the watch has ended, by disposal, completion or failure.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Number of times the effect has been invoked, priming included.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// The failure that tore this watch down, if any.
    pub fn failure(&self) -> Option<ReactiveError> {
        self.inner.failure.lock().clone()
    }

    /// Get the subscriber ID of this watch.
    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Run `effect` on every change of any dependency.
///
/// ```rust
/// use tidal_core::reactive::{watch, Ref};
///
/// let count = Ref::new(0);
/// let seen = Ref::new(0);
///
/// let source = count.clone();
/// let sink = seen.clone();
/// let handle = watch(&[&count], move || sink.set(source.get())).unwrap();
///
/// count.set(3).unwrap();
/// assert_eq!(seen.get(), 3);
/// handle.dispose();
/// ```
pub fn watch<F>(dependencies: &[&dyn Dependency], effect: F) -> Result<Watch, ReactiveError>
where
    F: Fn() -> Result<(), ReactiveError> + Send + Sync + 'static,
{
    Watch::with_options(dependencies, WatchOptions::default(), effect)
}

/// Like [`watch`], but also runs `effect` once before subscribing.
pub fn watch_effect<F>(dependencies: &[&dyn Dependency], effect: F) -> Result<Watch, ReactiveError>
where
    F: Fn() -> Result<(), ReactiveError> + Send + Sync + 'static,
{
    Watch::with_options(
        dependencies,
        WatchOptions::default().run_effect_now(true),
        effect,
    )
}

/// Async form of [`watch`]. Must be called within a tokio runtime.
pub fn watch_async<F, Fut>(dependencies: &[&dyn Dependency], effect: F) -> Result<Watch, ReactiveError>
where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReactiveError>> + Send + 'static,
{
    Watch::with_options_async(dependencies, WatchOptions::default(), effect)
}

/// Async form of [`watch_effect`]. Must be called within a tokio runtime.
pub fn watch_effect_async<F, Fut>(
    dependencies: &[&dyn Dependency],
    effect: F,
) -> Result<Watch, ReactiveError>
where
    F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ReactiveError>> + Send + 'static,
{
    Watch::with_options_async(
        dependencies,
        WatchOptions::default().run_effect_now(true),
        effect,
    )
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
