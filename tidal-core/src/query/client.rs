//! The query client and its configuration.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use super::cache::QueryCache;
use super::consumer::{KeyProvider, Query};
use super::fetch::QueryFn;
use super::invalidator::{InvalidationPolicy, InvalidatorFactory};
use super::key::QueryKey;
use crate::error::QueryError;
use crate::reactive::Dependency;

/// Configuration for a [`QueryClient`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryClientConfig {
    /// When unreferenced cache entries are evicted.
    pub invalidation: InvalidationPolicy,
}

/// Owns one shared query cache and creates queries against it.
///
/// # Example
///
/// ```rust
/// use tidal_core::query::{QueryClient, QueryClientConfig, QueryFn, QueryStatus};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), tidal_core::error::QueryError> {
/// let client = QueryClient::new(QueryClientConfig::default())?;
/// let query = client.query("answer", QueryFn::new(|| async { Ok(42) }))?;
///
/// query.refetch().await;
/// assert_eq!(query.state().status, QueryStatus::Success);
/// assert_eq!(query.state().data, Some(42));
///
/// client.dispose();
/// assert!(query.state().is_disabled());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueryClient {
    cache: QueryCache,
}

impl QueryClient {
    /// Create a client running fetches on the current tokio runtime.
    pub fn new(config: QueryClientConfig) -> Result<Self, QueryError> {
        let runtime = Handle::try_current().map_err(|_| QueryError::NoRuntime)?;
        Ok(Self::with_handle(config, runtime))
    }

    /// Create a client running fetches on `runtime`.
    pub fn with_handle(config: QueryClientConfig, runtime: Handle) -> Self {
        Self::with_factory(Arc::new(config.invalidation), runtime)
    }

    /// Create a client with a custom invalidator factory.
    pub fn with_factory(factory: Arc<dyn InvalidatorFactory>, runtime: Handle) -> Self {
        Self {
            cache: QueryCache::new(factory, runtime),
        }
    }

    /// Create a query whose key is re-evaluated whenever a dependency fires.
    pub fn create_query<T>(
        &self,
        key: impl Into<KeyProvider>,
        fetch: QueryFn<T>,
        dependencies: &[&dyn Dependency],
    ) -> Result<Query<T>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if self.cache.is_disposed() {
            return Err(QueryError::Disposed);
        }
        Query::new(self.cache.clone(), key.into(), fetch, dependencies)
    }

    /// Create a query for a fixed key.
    pub fn query<T>(&self, key: impl Into<QueryKey>, fetch: QueryFn<T>) -> Result<Query<T>, QueryError>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.create_query(KeyProvider::fixed(key.into()), fetch, &[])
    }

    /// The shared cache behind this client.
    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Dispose the cache, disabling every query created by this client.
    /// Idempotent.
    pub fn dispose(&self) {
        self.cache.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.cache.is_disposed()
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient").field("cache", &self.cache).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn config_defaults_and_parses() {
        let config: QueryClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, QueryClientConfig::default());
        assert_eq!(
            config.invalidation,
            InvalidationPolicy::Delayed(Duration::from_secs(300))
        );

        let config: QueryClientConfig =
            serde_json::from_str(r#"{"invalidation":"immediate"}"#).unwrap();
        assert_eq!(config.invalidation, InvalidationPolicy::Immediate);

        let json = serde_json::to_value(QueryClientConfig {
            invalidation: InvalidationPolicy::Never,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "invalidation": "never" }));
    }

    #[test]
    fn new_requires_a_runtime() {
        assert!(matches!(
            QueryClient::new(QueryClientConfig::default()),
            Err(QueryError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn disposed_client_refuses_new_queries() {
        let client = QueryClient::new(QueryClientConfig::default()).unwrap();
        client.dispose();
        client.dispose();
        assert!(client.is_disposed());

        let result = client.query("k", QueryFn::new(|| async { Ok(1) }));
        assert!(matches!(result, Err(QueryError::Disposed)));
    }
}
