//! Deadlines for repository and collaborator calls.
//!
//! Every outbound await in the engine goes through [`bounded`]. An elapsed
//! deadline becomes [`AuthEngineError::Unavailable`]; it is never read as a
//! pass or a fail of the security check that was waiting on it.

use std::future::Future;
use std::time::Duration;

use crate::error::{AuthEngineError, Result};

/// Await `fut` for at most `timeout`.
///
/// `what` names the call in the resulting error and log line.
pub(crate) async fn bounded<T, E, F>(timeout: Duration, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: Into<AuthEngineError>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(inner) => inner.map_err(Into::into),
        Err(_) => {
            tracing::warn!(
                call = what,
                timeout_ms = timeout.as_millis() as u64,
                "call exceeded deadline"
            );
            Err(AuthEngineError::Unavailable {
                reason: format!("{what} timed out after {} ms", timeout.as_millis()),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryError;

    #[tokio::test]
    async fn passes_through_success() {
        let out = bounded(Duration::from_secs(1), "fast", async {
            Ok::<_, RepositoryError>(7)
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn elapsed_deadline_is_unavailable() {
        let result = bounded(Duration::from_millis(10), "slow", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, RepositoryError>(())
        })
        .await;
        match result {
            Err(AuthEngineError::Unavailable { reason }) => {
                assert!(reason.contains("slow timed out"));
            }
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repository_error_is_unavailable() {
        let result = bounded(Duration::from_secs(1), "broken", async {
            Err::<(), _>(RepositoryError::Backend {
                reason: "disk full".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(AuthEngineError::Unavailable { .. })));
    }
}
