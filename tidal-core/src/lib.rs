//! Tidal Core
//!
//! This crate provides a small reactive core and a deduplicating async query
//! layer built on top of it. It implements:
//!
//! - Reactive primitives (refs, computed values, watches)
//! - Explicit dependency lists and pluggable notification scheduling
//! - Shared, reference-counted async queries with pluggable eviction
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Refs, computed values, the watch engine and schedulers
//! - `query`: Query keys, the unified query state machine, the shared cache
//!   and the query client
//! - `error`: Error types shared by both layers
//!
//! The crate logs through `tracing` and never installs a subscriber.
//!
//! # Example
//!
//! ```rust
//! use tidal_core::reactive::{watch_effect, Computed, Ref};
//!
//! // Create a ref
//! let count = Ref::new(1);
//!
//! // Create a derived value
//! let source = count.clone();
//! let doubled = Computed::new(&[&count], move || source.get() * 2).unwrap();
//!
//! // Create an effect
//! let seen = Ref::new(0);
//! let (sink, read) = (seen.clone(), doubled.clone());
//! let effect = watch_effect(&[&doubled], move || sink.set(read.get())).unwrap();
//! assert_eq!(seen.get(), 2);
//!
//! // Update the ref; the effect runs synchronously
//! count.set(5).unwrap();
//! assert_eq!(seen.get(), 10);
//!
//! effect.dispose();
//! ```

pub mod error;
pub mod query;
pub mod reactive;

pub use error::{FetchError, QueryError, ReactiveError};
