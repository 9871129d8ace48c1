use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep_until, timeout_at, Instant};

use super::{DataStore, DatabaseError};
use crate::warn_with_trace;

/// Deadline applied when the caller does not supply one
pub const DEFAULT_STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Linear backoff unit: the nth retry waits `n * BACKOFF_STEP`
pub const BACKOFF_STEP: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum StatusCheckError {
    #[error("Database status check deadline exceeded after {attempts} attempt(s)")]
    DeadlineExceeded { attempts: u32 },

    #[error("Database status query failed: {source}")]
    Query {
        #[source]
        source: DatabaseError,
    },

    #[error("Database status query returned an unexpected result")]
    UnexpectedResult,
}

/// Sleep before retrying after the given (1-based) failed attempt
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    BACKOFF_STEP.saturating_mul(attempt)
}

/// Wait until the store answers a ping, then confirm it with `SELECT TRUE`.
///
/// Failed pings are logged and retried with linear backoff. Every probe and
/// every sleep is bounded by `deadline` (10 seconds from now when `None`), so
/// the call returns `DeadlineExceeded` no later than the deadline.
pub async fn check_status(
    store: &dyn DataStore,
    deadline: Option<Instant>,
) -> Result<(), StatusCheckError> {
    let deadline = deadline.unwrap_or_else(|| Instant::now() + DEFAULT_STATUS_CHECK_TIMEOUT);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        match timeout_at(deadline, store.ping()).await {
            Ok(Ok(())) => break,
            Ok(Err(e)) => {
                warn_with_trace!(attempt = attempts, error = %e, "Database ping failed");
            }
            Err(_) => return Err(StatusCheckError::DeadlineExceeded { attempts }),
        }

        if Instant::now() >= deadline {
            return Err(StatusCheckError::DeadlineExceeded { attempts });
        }

        sleep_until((Instant::now() + backoff_for_attempt(attempts)).min(deadline)).await;

        if Instant::now() >= deadline {
            return Err(StatusCheckError::DeadlineExceeded { attempts });
        }
    }

    if Instant::now() >= deadline {
        return Err(StatusCheckError::DeadlineExceeded { attempts });
    }

    match timeout_at(deadline, store.select_true()).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(StatusCheckError::UnexpectedResult),
        Ok(Err(source)) => Err(StatusCheckError::Query { source }),
        Err(_) => Err(StatusCheckError::DeadlineExceeded { attempts }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::mocks::{connection_refused, MockStore};
    use crate::database::PoolStats;
    use async_trait::async_trait;

    #[test]
    fn test_backoff_is_linear() {
        assert_eq!(backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff_for_attempt(5), Duration::from_secs(1));
        assert_eq!(backoff_for_attempt(u32::MAX), Duration::from_millis(200) * u32::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_first_probe() {
        let mut store = MockStore::new();
        store.expect_ping().times(1).returning(|| Ok(()));
        store.expect_select_true().times(1).returning(|| Ok(true));

        let start = Instant::now();
        check_status(&store, None).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reachable_on_third_probe() {
        let mut store = MockStore::new();
        let mut calls = 0;
        store.expect_ping().times(3).returning(move || {
            calls += 1;
            if calls < 3 {
                Err(connection_refused())
            } else {
                Ok(())
            }
        });
        store.expect_select_true().times(1).returning(|| Ok(true));

        let start = Instant::now();
        check_status(&store, None).await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(700), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_reachable_exceeds_default_deadline() {
        let mut store = MockStore::new();
        store.expect_ping().returning(|| Err(connection_refused()));
        store.expect_select_true().never();

        let start = Instant::now();
        let result = check_status(&store, None).await;

        // 200ms + 400ms + ... + 1800ms = 9s, the tenth sleep is cut at the deadline
        assert!(matches!(
            result,
            Err(StatusCheckError::DeadlineExceeded { attempts: 10 })
        ));
        assert_eq!(start.elapsed(), DEFAULT_STATUS_CHECK_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_caller_deadline() {
        let mut store = MockStore::new();
        store.expect_ping().returning(|| Err(connection_refused()));

        let start = Instant::now();
        let result = check_status(&store, Some(start + Duration::from_millis(500))).await;

        assert!(matches!(
            result,
            Err(StatusCheckError::DeadlineExceeded { attempts: 2 })
        ));
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_still_probes_once() {
        let mut store = MockStore::new();
        store.expect_ping().times(1).returning(|| Err(connection_refused()));

        let result = check_status(&store, Some(Instant::now())).await;
        assert!(matches!(
            result,
            Err(StatusCheckError::DeadlineExceeded { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_query_error() {
        let mut store = MockStore::new();
        store.expect_ping().returning(|| Ok(()));
        store
            .expect_select_true()
            .returning(|| Err(DatabaseError::Sqlx(sqlx::Error::RowNotFound)));

        let result = check_status(&store, None).await;
        assert!(matches!(result, Err(StatusCheckError::Query { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmation_query_unexpected_value() {
        let mut store = MockStore::new();
        store.expect_ping().returning(|| Ok(()));
        store.expect_select_true().returning(|| Ok(false));

        let result = check_status(&store, None).await;
        assert!(matches!(result, Err(StatusCheckError::UnexpectedResult)));
    }

    struct HangingStore;

    #[async_trait]
    impl DataStore for HangingStore {
        async fn ping(&self) -> Result<(), DatabaseError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn select_true(&self) -> Result<bool, DatabaseError> {
            Ok(true)
        }

        fn stats(&self) -> PoolStats {
            PoolStats::default()
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_is_cut_at_deadline() {
        let start = Instant::now();
        let result = check_status(&HangingStore, Some(start + Duration::from_secs(2))).await;

        assert!(matches!(
            result,
            Err(StatusCheckError::DeadlineExceeded { attempts: 1 })
        ));
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
