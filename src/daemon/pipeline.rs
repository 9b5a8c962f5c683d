//! Per-tile render and store steps with timeout, retry and backoff.

use std::future::Future;
use std::time::Duration;

use metrics::counter;

use crate::domain::job::{FailureReason, RetryConfig};
use crate::render::RenderError;
use crate::tile_store::StoreError;
use crate::tiles::TileCoord;

/// Which external call a tile step makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Render,
    Store,
}

impl Step {
    fn label(self) -> &'static str {
        match self {
            Step::Render => "render",
            Step::Store => "store",
        }
    }

    fn exhausted(self, tile: TileCoord, attempts: u32, last_error: String) -> FailureReason {
        match self {
            Step::Render => FailureReason::RenderRetriesExhausted {
                tile,
                attempts,
                last_error,
            },
            Step::Store => FailureReason::StoreRetriesExhausted {
                tile,
                attempts,
                last_error,
            },
        }
    }

    fn rejected(self, tile: TileCoord, error: String) -> FailureReason {
        match self {
            Step::Render => FailureReason::RenderRejected { tile, error },
            Step::Store => FailureReason::StoreRejected { tile, error },
        }
    }
}

/// A failed attempt, reduced to what the retry loop needs.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Retryable(String),
    Permanent(String),
}

impl From<RenderError> for AttemptError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::Retryable(msg) => AttemptError::Retryable(msg),
            RenderError::Permanent(msg) => AttemptError::Permanent(msg),
        }
    }
}

impl From<StoreError> for AttemptError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Retryable(msg) => AttemptError::Retryable(msg),
            StoreError::Permanent(msg) => AttemptError::Permanent(msg),
        }
    }
}

/// Run `call` until it succeeds, fails permanently, or runs out of attempts.
///
/// Each attempt is bounded by `timeout`; a timeout is treated like a
/// retryable error. Between attempts the task sleeps for
/// `retry.backoff(n)`.
pub(crate) async fn run_step<F, Fut, V, E>(
    step: Step,
    tile: TileCoord,
    retry: &RetryConfig,
    timeout: Duration,
    mut call: F,
) -> Result<V, FailureReason>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<V, E>>,
    E: Into<AttemptError>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let (error, reason) = match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => (e.into(), step.label()),
            Err(_) => (
                AttemptError::Retryable(format!(
                    "{} timed out after {}ms",
                    step.label(),
                    timeout.as_millis()
                )),
                "timeout",
            ),
        };

        match error {
            AttemptError::Permanent(message) => {
                tracing::warn!(step = step.label(), %tile, attempts, error = %message, "Tile step failed permanently");
                return Err(step.rejected(tile, message));
            }
            AttemptError::Retryable(message) => {
                if !retry.allows_another(attempts) {
                    tracing::warn!(step = step.label(), %tile, attempts, error = %message, "Tile step out of retries");
                    return Err(step.exhausted(tile, attempts, message));
                }
                let delay = retry.backoff(attempts - 1);
                counter!("georeferencer_tile_render_retries_total", "reason" => reason).increment(1);
                tracing::warn!(
                    step = step.label(),
                    %tile,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Retrying tile step"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            backoff_ms: 1,
            backoff_factor: 2,
            max_backoff_ms: 5,
        }
    }

    const TILE: TileCoord = TileCoord { z: 3, x: 1, y: 2 };

    #[tokio::test]
    async fn test_retryable_errors_then_success() {
        let calls = AtomicU32::new(0);
        let result = run_step(Step::Render, TILE, &fast_retry(), Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(RenderError::Retryable("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let result: Result<(), _> =
            run_step(Step::Store, TILE, &fast_retry(), Duration::from_secs(1), || async {
                Err(StoreError::Retryable("503".into()))
            })
            .await;
        assert_eq!(
            result,
            Err(FailureReason::StoreRetriesExhausted {
                tile: TILE,
                attempts: 3,
                last_error: "503".into()
            })
        );
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            run_step(Step::Render, TILE, &fast_retry(), Duration::from_secs(1), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RenderError::Permanent("corrupt raster".into())) }
            })
            .await;
        assert!(matches!(result, Err(FailureReason::RenderRejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_retryable() {
        let calls = AtomicU32::new(0);
        let result = run_step(Step::Render, TILE, &fast_retry(), Duration::from_millis(20), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, RenderError>(n)
            }
        })
        .await;
        assert_eq!(result, Ok(1));
    }
}
