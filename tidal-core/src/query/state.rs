//! Query state types.

use crate::error::FetchError;

use super::key::QueryKey;

/// What a fetch in progress still remembers from before it started.
#[derive(Debug, Clone)]
pub enum Prior<T> {
    /// Nothing has been fetched yet.
    Empty,
    /// The previous fetch succeeded with this value.
    Data(T),
    /// The previous fetch failed with this error.
    Error(FetchError),
}

impl<T> Prior<T> {
    /// The stale value, if any.
    pub fn data(&self) -> Option<&T> {
        match self {
            Prior::Data(data) => Some(data),
            _ => None,
        }
    }

    /// The stale error, if any.
    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Prior::Error(err) => Some(err),
            _ => None,
        }
    }
}

/// State of one shared, deduplicated fetch.
///
/// ```text
///            refetch()                 completes
///  Success ────────────► Fetching(Data) ──────────► Success | Error
///  Error   ────────────► Fetching(Error)
///  (new)   ────────────► Fetching(Empty)
///  any     ── dispose ─► Disabled   (terminal)
/// ```
#[derive(Debug, Clone)]
pub enum UnifiedQueryState<T> {
    /// A fetch is in flight.
    Fetching(Prior<T>),
    /// The latest fetch succeeded.
    Success(T),
    /// The latest fetch failed.
    Error(FetchError),
    /// The query was disposed. No transition leaves this state.
    Disabled,
}

impl<T> UnifiedQueryState<T> {
    pub fn is_fetching(&self) -> bool {
        matches!(self, UnifiedQueryState::Fetching(_))
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, UnifiedQueryState::Disabled)
    }

    /// The freshest value available, stale or not.
    pub fn data(&self) -> Option<&T> {
        match self {
            UnifiedQueryState::Success(data) => Some(data),
            UnifiedQueryState::Fetching(prior) => prior.data(),
            _ => None,
        }
    }

    /// The freshest error available, stale or not.
    pub fn error(&self) -> Option<&FetchError> {
        match self {
            UnifiedQueryState::Error(err) => Some(err),
            UnifiedQueryState::Fetching(prior) => prior.error(),
            _ => None,
        }
    }

    /// What a new fetch starting from this state should remember.
    pub(crate) fn into_prior(self) -> Prior<T> {
        match self {
            UnifiedQueryState::Success(data) => Prior::Data(data),
            UnifiedQueryState::Error(err) => Prior::Error(err),
            UnifiedQueryState::Fetching(prior) => prior,
            UnifiedQueryState::Disabled => Prior::Empty,
        }
    }

    /// The state a cancelled fetch falls back to.
    pub(crate) fn settle(prior: Prior<T>, cancelled: FetchError) -> Self {
        match prior {
            Prior::Data(data) => UnifiedQueryState::Success(data),
            Prior::Error(err) => UnifiedQueryState::Error(err),
            Prior::Empty => UnifiedQueryState::Error(cancelled),
        }
    }
}

/// Coarse status of a consumer-facing query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    /// No key, or the query was disposed.
    Disabled,
    /// First fetch in flight, nothing to show yet.
    Loading,
    /// A refetch is in flight; stale data or a stale error is available.
    Fetching,
    /// Idle with data.
    Success,
    /// Idle with an error.
    Error,
}

/// The state a consumer-facing [`Query`](super::Query) exposes.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub status: QueryStatus,
    pub key: Option<QueryKey>,
    pub data: Option<T>,
    pub error: Option<FetchError>,
}

impl<T: Clone> QueryState<T> {
    /// The disabled state.
    pub fn disabled() -> Self {
        Self {
            status: QueryStatus::Disabled,
            key: None,
            data: None,
            error: None,
        }
    }

    /// Project a shared query's state under the key it is bound to.
    pub fn project(key: &QueryKey, state: &UnifiedQueryState<T>) -> Self {
        let status = match state {
            UnifiedQueryState::Fetching(Prior::Empty) => QueryStatus::Loading,
            UnifiedQueryState::Fetching(_) => QueryStatus::Fetching,
            UnifiedQueryState::Success(_) => QueryStatus::Success,
            UnifiedQueryState::Error(_) => QueryStatus::Error,
            UnifiedQueryState::Disabled => return Self::disabled(),
        };
        Self {
            status,
            key: Some(key.clone()),
            data: state.data().cloned(),
            error: state.error().cloned(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.status == QueryStatus::Disabled
    }

    /// Whether a fetch is in flight.
    pub fn is_fetching(&self) -> bool {
        matches!(self.status, QueryStatus::Loading | QueryStatus::Fetching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn refetch_keeps_prior_outcome() {
        let success: UnifiedQueryState<i32> = UnifiedQueryState::Success(5);
        let fetching = UnifiedQueryState::Fetching(success.into_prior());
        assert_eq!(fetching.data(), Some(&5));
        assert!(fetching.is_fetching());

        let err: FetchError = Arc::new(anyhow::anyhow!("offline"));
        let failed: UnifiedQueryState<i32> = UnifiedQueryState::Error(err);
        let fetching = UnifiedQueryState::Fetching(failed.into_prior());
        assert_eq!(fetching.error().map(|e| e.to_string()), Some("offline".into()));
        assert_eq!(fetching.data(), None);
    }

    #[test]
    fn settle_falls_back_to_prior() {
        let cancelled: FetchError = Arc::new(anyhow::anyhow!("cancelled"));
        assert!(matches!(
            UnifiedQueryState::settle(Prior::Data(1), cancelled.clone()),
            UnifiedQueryState::Success(1)
        ));
        assert!(matches!(
            UnifiedQueryState::<i32>::settle(Prior::Empty, cancelled),
            UnifiedQueryState::Error(_)
        ));
    }

    #[test]
    fn projection_maps_statuses() {
        let key = QueryKey::from("Q1");

        let loading = QueryState::project(&key, &UnifiedQueryState::<i32>::Fetching(Prior::Empty));
        assert_eq!(loading.status, QueryStatus::Loading);
        assert_eq!(loading.key, Some(key.clone()));
        assert!(loading.is_fetching());

        let stale = QueryState::project(&key, &UnifiedQueryState::Fetching(Prior::Data(123)));
        assert_eq!(stale.status, QueryStatus::Fetching);
        assert_eq!(stale.data, Some(123));

        let done = QueryState::project(&key, &UnifiedQueryState::Success(456));
        assert_eq!(done.status, QueryStatus::Success);
        assert!(!done.is_fetching());

        let disabled = QueryState::project(&key, &UnifiedQueryState::<i32>::Disabled);
        assert!(disabled.is_disabled());
        assert_eq!(disabled.key, None);
    }
}
