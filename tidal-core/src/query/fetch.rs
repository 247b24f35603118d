//! Fetch functions and fetch handles.
//!
//! A [`QueryFn`] is compared by identity, never by behavior: two separately
//! created functions are different cache entries even if they do the same
//! thing. Clone a `QueryFn` to share its identity.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;

use crate::reactive::CancelToken;

/// The future a fetch function returns.
pub type FetchFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

type FetchFn<T> = Arc<dyn Fn(CancelToken) -> FetchFuture<T> + Send + Sync>;

/// Identity of a fetch function, part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchFnId(usize);

/// An async fetch function producing values of type `T`.
pub struct QueryFn<T> {
    f: FetchFn<T>,
}

impl<T: Send + 'static> QueryFn<T> {
    /// Wrap a zero-argument async function.
    ///
    /// ```rust
    /// use tidal_core::query::QueryFn;
    ///
    /// let fetch = QueryFn::new(|| async { Ok(123) });
    /// let again = fetch.clone();
    /// assert_eq!(fetch.id(), again.id());
    /// assert_ne!(fetch.id(), QueryFn::new(|| async { Ok(123) }).id());
    /// ```
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |_token| f().boxed()),
        }
    }

    /// Wrap an async function that observes cancellation.
    pub fn cancellable<F, Fut>(f: F) -> Self
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |token| f(token).boxed()),
        }
    }

    /// Start one fetch.
    pub(crate) fn call(&self, token: CancelToken) -> FetchFuture<T> {
        (self.f)(token)
    }
}

impl<T> QueryFn<T> {
    /// The identity of this function.
    pub fn id(&self) -> FetchFnId {
        FetchFnId(Arc::as_ptr(&self.f) as *const () as usize)
    }
}

impl<T> Clone for QueryFn<T> {
    fn clone(&self) -> Self {
        Self {
            f: Arc::clone(&self.f),
        }
    }
}

impl<T> fmt::Debug for QueryFn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("QueryFn")
            .field(&(Arc::as_ptr(&self.f) as *const ()))
            .finish()
    }
}

/// Resolves once a fetch has written its outcome into query state.
///
/// Handles are cheap to clone; every clone resolves together. Dropping a
/// handle does not cancel the fetch.
#[derive(Clone)]
pub struct FetchHandle {
    done: Shared<BoxFuture<'static, ()>>,
}

impl FetchHandle {
    pub(crate) fn new(done: BoxFuture<'static, ()>) -> Self {
        Self {
            done: done.shared(),
        }
    }

    /// A handle that is already resolved.
    pub fn ready() -> Self {
        Self::new(futures_util::future::ready(()).boxed())
    }

    /// Whether the fetch has finished.
    pub fn is_finished(&self) -> bool {
        self.done.peek().is_some()
    }
}

impl Future for FetchHandle {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.done).poll(cx)
    }
}

impl fmt::Debug for FetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}
