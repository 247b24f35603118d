//! Query keys.
//!
//! A [`QueryKey`] is an ordered, immutable tuple of opaque components. Two
//! keys are equal when they have the same number of components and the
//! components are pairwise equal. Components of different concrete types
//! never compare equal, so `"1"` and `1` are different components.

use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for values usable as a key component.
///
/// Automatically implemented for every `Hash + Eq + Debug + Send + Sync + 'static`
/// type.
pub trait KeyComponent: DynHash + DynEq + Debug + Send + Sync {
    /// Get the component as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> KeyComponent for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(KeyComponent);

/// One type-erased component of a [`QueryKey`].
#[derive(Clone)]
pub struct KeyPart(Arc<dyn KeyComponent>);

impl KeyPart {
    /// Wrap a value as a key component.
    pub fn new<K: KeyComponent + 'static>(value: K) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast the component to its original type.
    pub fn downcast<K: 'static>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref()
    }
}

impl PartialEq for KeyPart {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_any())
    }
}

impl Eq for KeyPart {}

impl Hash for KeyPart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Debug for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// An ordered tuple of components identifying a logical query.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    parts: Arc<[KeyPart]>,
}

impl QueryKey {
    /// Build a key from its components, in order.
    pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    /// A key with a single component.
    pub fn single<K: KeyComponent + 'static>(value: K) -> Self {
        Self::new([KeyPart::new(value)])
    }

    /// A new key with `value` appended.
    pub fn with<K: KeyComponent + 'static>(&self, value: K) -> Self {
        Self::new(self.parts.iter().cloned().chain([KeyPart::new(value)]))
    }

    /// The components of this key.
    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    /// The component at `index`, downcast to `K`.
    pub fn get<K: 'static>(&self, index: usize) -> Option<&K> {
        self.parts.get(index).and_then(KeyPart::downcast)
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the key has no components.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.parts.iter()).finish()
    }
}

impl From<&'static str> for QueryKey {
    fn from(value: &'static str) -> Self {
        Self::single(value)
    }
}

impl From<String> for QueryKey {
    fn from(value: String) -> Self {
        Self::single(value)
    }
}

/// Build a [`QueryKey`] from a list of components.
///
/// ```rust
/// use tidal_core::query_key;
///
/// let key = query_key!["users", 42_u64];
/// assert_eq!(key.len(), 2);
/// assert_eq!(key.get::<u64>(1), Some(&42));
/// ```
#[macro_export]
macro_rules! query_key {
    ($($part:expr),* $(,)?) => {
        $crate::query::QueryKey::new([$($crate::query::KeyPart::new($part)),*])
    };
}
