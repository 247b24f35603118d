//! Async Queries
//!
//! This module layers deduplicated, cached async fetches on top of the
//! reactive core.
//!
//! # Layers
//!
//! ## Unified Queries
//!
//! A [`UnifiedQuery`] owns one fetch function bound to one [`QueryKey`] and
//! runs the fetch state machine (`Fetching` / `Success` / `Error` /
//! `Disabled`). Fetches run on a tokio runtime, never on the caller.
//!
//! ## The Shared Cache
//!
//! A [`QueryCache`] hands out unified queries keyed by query key and fetch
//! function identity, so equal requests share one fetch. Entries are
//! reference counted; a [`CacheInvalidator`] decides when an unreferenced
//! entry is evicted.
//!
//! ## Queries
//!
//! A [`Query`] is what application code holds. Its key comes from a
//! [`KeyProvider`] re-evaluated whenever one of the query's reactive
//! dependencies fires, and its state is the bound unified query's state
//! projected into a [`QueryState`].
//!
//! ## The Client
//!
//! A [`QueryClient`] owns the cache and creates queries. Disposing it
//! disables every query it created.

mod cache;
mod client;
mod consumer;
mod fetch;
mod invalidator;
mod key;
mod lifetime;
mod state;
mod unified;

pub use cache::{QueryCache, QueryLease};
pub use client::{QueryClient, QueryClientConfig};
pub use consumer::{KeyProvider, Query};
pub use fetch::{FetchFnId, FetchFuture, FetchHandle, QueryFn};
pub use invalidator::{
    CacheInvalidator, DelayedInvalidator, ImmediateInvalidator, InvalidationPolicy,
    InvalidatorFactory, NeverInvalidator, TryInvalidate,
};
pub use key::{DynEq, KeyComponent, KeyPart, QueryKey};
pub use state::{Prior, QueryState, QueryStatus, UnifiedQueryState};
pub use unified::UnifiedQuery;
