//! Reactive Primitives
//!
//! This module implements the reactive core: refs, computed values and
//! watches, plus the plumbing they share.
//!
//! # Concepts
//!
//! ## Refs
//!
//! A [`Ref`] is a container for mutable state. Writing a value that differs
//! (under the ref's equality comparator) from the current one notifies every
//! subscriber synchronously.
//!
//! ## Computed Values
//!
//! A [`Computed`] is a read-only value derived from other dependencies. It
//! re-evaluates eagerly, once per dependency notification.
//!
//! ## Watches
//!
//! A [`Watch`] runs a side effect whenever any of its dependencies fires.
//! [`watch_effect`] also runs it once up front.
//!
//! # Implementation Notes
//!
//! Dependencies are passed explicitly as a list of [`Dependency`] values;
//! nothing is tracked implicitly. Anything that can notify is adapted to
//! [`Dependency`], either directly (refs, computed values) or through a
//! [`Trigger`].
//!
//! No entity ever calls into observer code while holding its own lock.

mod cancel;
mod cell;
mod computed;
mod dependency;
mod scheduler;
mod stream;
mod subscriber;
mod watch;

pub use cancel::CancelToken;
pub use cell::{default_equality, equality, never_equal, Equality, Ref};
pub use computed::{Computed, ComputedOptions};
pub use dependency::{Dependency, Trigger};
pub use scheduler::{Immediate, QueueScheduler, Scheduler, Task, TokioScheduler};
pub use stream::{observer, Event, NotificationStream, Observer};
pub use subscriber::{SubscriberId, Subscription};
pub use watch::{watch, watch_async, watch_effect, watch_effect_async, Watch, WatchOptions};
