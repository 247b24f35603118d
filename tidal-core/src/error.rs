//! Error types for the reactive core and the query layer.

use std::sync::Arc;

/// Errors raised while delivering notifications through the reactive graph.
///
/// A failure is delivered to every subscription it tears down, so the type is
/// cheap to clone: user errors are kept behind an `Arc`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReactiveError {
    /// A subscriber, compute function or watch effect failed.
    #[error("observer failed: {0}")]
    Observer(Arc<anyhow::Error>),

    /// A dependency's change stream failed.
    #[error("dependency failed: {0}")]
    Dependency(Arc<anyhow::Error>),

    /// An async form was requested outside of a tokio runtime.
    #[error("no tokio runtime available for {0}")]
    NoRuntime(&'static str),
}

impl ReactiveError {
    /// Wrap a user error raised by an observer, compute function or effect.
    pub fn observer(err: impl Into<anyhow::Error>) -> Self {
        ReactiveError::Observer(Arc::new(err.into()))
    }

    /// Wrap a user error raised by a dependency's change stream.
    pub fn dependency(err: impl Into<anyhow::Error>) -> Self {
        ReactiveError::Dependency(Arc::new(err.into()))
    }

    /// Returns the wrapped user error, if any.
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ReactiveError::Observer(e) | ReactiveError::Dependency(e) => Some(e),
            ReactiveError::NoRuntime(_) => None,
        }
    }
}

/// The error value a failed fetch leaves in query state.
pub type FetchError = Arc<anyhow::Error>;

/// Errors raised by the query cache, queries and the query client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// The query client (and its cache) has been disposed.
    #[error("query client has already been disposed")]
    Disposed,

    /// The in-flight fetch was cancelled before it produced a result.
    #[error("query fetch cancelled")]
    Cancelled,

    /// No tokio runtime is available to run fetches on.
    #[error("no tokio runtime available to run query fetches")]
    NoRuntime,

    /// A cache entry held a query of a different value type.
    #[error("cached query has a different value type")]
    TypeMismatch,

    /// Wiring the query into the reactive graph failed.
    #[error(transparent)]
    Reactive(#[from] ReactiveError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_error_keeps_user_error() {
        let err = ReactiveError::observer(anyhow::anyhow!("boom"));
        assert_eq!(err.to_string(), "observer failed: boom");
        assert_eq!(err.user_error().map(|e| e.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn disposed_is_distinct_from_other_errors() {
        let err = QueryError::Disposed;
        assert!(matches!(err, QueryError::Disposed));
        assert_eq!(err.to_string(), "query client has already been disposed");

        let wrapped: QueryError = ReactiveError::NoRuntime("fetch").into();
        assert!(matches!(wrapped, QueryError::Reactive(_)));
    }
}
