//! Fixed-window admission decisions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::error::Result;
use crate::store::{expiry_after, CounterStore};

/// The verdict for one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the unit may proceed.
    pub allowed: bool,
    /// Units left in the current window, never negative.
    pub remaining: i64,
    /// When the current window ends. Best-effort for networked stores.
    pub reset_at: DateTime<Utc>,
    /// The limit the decision was made against, as given.
    pub limit: i64,
}

impl Decision {
    /// Time until the window resets, zero if it already has.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        (self.reset_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Count one unit against `key` and decide whether it is admitted.
///
/// Up to `limit` units are admitted per window; a `limit` of zero or less
/// denies everything. Store failures are returned as-is: whether to fail
/// open or closed is left to the caller.
pub async fn check<S>(store: &S, key: &str, limit: i64, window: Duration) -> Result<Decision>
where
    S: CounterStore + ?Sized,
{
    let state = store.increment(key, window).await?;

    let (allowed, remaining) = if limit <= 0 {
        (false, 0)
    } else {
        (state.count <= limit, limit.saturating_sub(state.count).max(0))
    };

    let reset_at = match state.expires_at {
        Some(expires_at) => expires_at,
        None => read_back_expiry(store, key, window).await,
    };

    trace!(
        store = store.name(),
        key,
        count = state.count,
        limit,
        allowed,
        remaining,
        "Admission decision made"
    );

    if !allowed {
        debug!(key, count = state.count, limit, "Rate limit exceeded");
    }

    Ok(Decision {
        allowed,
        remaining,
        reset_at,
        limit,
    })
}

async fn read_back_expiry<S>(store: &S, key: &str, window: Duration) -> DateTime<Utc>
where
    S: CounterStore + ?Sized,
{
    match store.get(key).await {
        Ok(state) => state
            .expires_at
            .unwrap_or_else(|| expiry_after(Utc::now(), window)),
        Err(e) => {
            debug!(key, error = %e, "Could not read window expiry, approximating");
            expiry_after(Utc::now(), window)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures::future::join_all;

    use crate::advisory::Environment;
    use crate::error::TollgateError;
    use crate::store::{MemoryStore, MemoryStoreConfig, WindowState};

    fn test_store() -> MemoryStore {
        MemoryStore::with_environment(MemoryStoreConfig::default(), &Environment::default())
    }

    /// A networked store whose backend is never reachable.
    struct UnreachableStore;

    #[async_trait]
    impl CounterStore for UnreachableStore {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn get(&self, _key: &str) -> Result<WindowState> {
            Err(TollgateError::BackendUnavailable("connection refused".to_string()))
        }

        async fn increment(&self, _key: &str, _window: Duration) -> Result<WindowState> {
            Err(TollgateError::BackendUnavailable("connection refused".to_string()))
        }

        async fn reset(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn reset_all(&self, _pattern: &str) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Counts correctly but never reports expiries.
    struct NoExpiryStore(MemoryStore);

    #[async_trait]
    impl CounterStore for NoExpiryStore {
        fn name(&self) -> &'static str {
            "no-expiry"
        }

        async fn get(&self, key: &str) -> Result<WindowState> {
            let state = self.0.get(key).await?;
            Ok(WindowState {
                expires_at: None,
                ..state
            })
        }

        async fn increment(&self, key: &str, window: Duration) -> Result<WindowState> {
            let state = self.0.increment(key, window).await?;
            Ok(WindowState {
                expires_at: None,
                ..state
            })
        }

        async fn reset(&self, key: &str) -> Result<()> {
            self.0.reset(key).await
        }

        async fn reset_all(&self, pattern: &str) -> Result<()> {
            self.0.reset_all(pattern).await
        }

        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn test_limit_five_per_minute() {
        let store = test_store();
        let window = Duration::from_secs(60);

        for expected_remaining in [4, 3, 2, 1, 0] {
            let decision = check(&store, "user:123", 5, window).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.limit, 5);
        }

        let decision = check(&store, "user:123", 5, window).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 5);
    }

    #[tokio::test]
    async fn test_remaining_stays_clamped_when_far_over_limit() {
        let store = test_store();
        for _ in 0..10 {
            check(&store, "k", 2, Duration::from_secs(60)).await.unwrap();
        }
        let decision = check(&store, "k", 2, Duration::from_secs(60)).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_zero_and_negative_limits_always_deny() {
        let store = test_store();
        for limit in [0, -1, -100] {
            for _ in 0..3 {
                let decision = check(&store, "blocked", limit, Duration::from_secs(60))
                    .await
                    .unwrap();
                assert!(!decision.allowed);
                assert_eq!(decision.remaining, 0);
                assert_eq!(decision.limit, limit);
            }
        }
    }

    #[tokio::test]
    async fn test_large_limit() {
        let store = test_store();
        let decision = check(&store, "k", 1_000_000, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 999_999);
    }

    #[tokio::test]
    async fn test_window_expiry_resets_counting() {
        let store = test_store();
        let window = Duration::from_millis(100);

        check(&store, "k", 1, window).await.unwrap();
        assert!(!check(&store, "k", 1, window).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let decision = check(&store, "k", 1, window).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_reset_at_is_window_expiry() {
        let store = test_store();
        let window = Duration::from_secs(60);
        let before = Utc::now();

        let first = check(&store, "k", 10, window).await.unwrap();
        let second = check(&store, "k", 10, window).await.unwrap();

        assert_eq!(first.reset_at, second.reset_at);
        assert!(first.reset_at >= expiry_after(before, window));
        let retry = first.retry_after(Utc::now());
        assert!(retry <= window && retry > Duration::from_secs(55));
    }

    #[tokio::test]
    async fn test_reset_at_approximated_without_expiry() {
        let store = NoExpiryStore(test_store());
        let window = Duration::from_secs(30);
        let before = Utc::now();

        let decision = check(&store, "k", 3, window).await.unwrap();

        assert!(decision.allowed);
        assert!(decision.reset_at >= expiry_after(before, window));
        assert!(decision.reset_at <= expiry_after(Utc::now(), window));
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let err = check(&UnreachableStore, "k", 10, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_backend());
    }

    #[tokio::test]
    async fn test_dyn_store() {
        let store: Arc<dyn CounterStore> = Arc::new(test_store());
        let decision = check(store.as_ref(), "k", 1, Duration::from_secs(1)).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_concurrent_checks_get_distinct_remaining() {
        let store = Arc::new(test_store());

        let checks = (0..50).map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                check(store.as_ref(), "fresh", 100, Duration::from_secs(60)).await
            })
        });
        let decisions: Vec<Decision> = join_all(checks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert!(decisions.iter().all(|d| d.allowed));
        let mut remaining: Vec<i64> = decisions.iter().map(|d| d.remaining).collect();
        remaining.sort_unstable();
        assert_eq!(remaining, (50..100).collect::<Vec<i64>>());
    }
}
