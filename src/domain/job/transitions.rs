//! State transitions for tile jobs using the typestate pattern.
//!
//! ```text
//! TileJob<Queued> ──into_running()──> TileJob<Running> ──succeed()──> TileJob<Succeeded>
//!       │                                   │
//!       │                                   ├──fail()──────> TileJob<Failed>
//!       │                                   ├──cancel()────> TileJob<Canceled>
//!       │                                   └──release()───> TileJob<Queued | Canceled>
//!       └──into_canceled()──> TileJob<Canceled>
//!
//! TileJob<Failed | Canceled> ──resubmission()──> TileJob<Queued>   (new job id)
//! ```
//!
//! Queued transitions are pure: storage applies them inside its own atomic
//! claim/cancel operations, since a queued job can be raced by a claiming
//! worker and a canceling user. Running transitions belong to the single
//! worker that owns the job and are persisted directly, except `release()`,
//! which storage applies to a running job whose worker stopped sending
//! heartbeats.
//!
//! Terminal jobs are never mutated. A retry is a new queued job that points
//! back at the original through `retry_of`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::domain::document::UserId;
use crate::error::Result;
use crate::manager::Storage;

use super::state::{
    AnyTileJob, Canceled, Failed, FailureReason, Queued, Running, StepProgress, Succeeded,
    TileJob, TileJobData, TileJobId, WorkerId,
};

impl TileJob<Queued> {
    pub fn new(data: TileJobData) -> Self {
        Self {
            state: Queued {
                queued_at: data.created_at,
            },
            data,
        }
    }

    pub fn into_running(self, worker_id: WorkerId) -> TileJob<Running> {
        let now = Utc::now();
        TileJob {
            state: Running {
                worker_id,
                queued_at: self.state.queued_at,
                started_at: now,
                heartbeat_at: now,
            },
            data: self.data,
        }
    }

    pub fn into_canceled(self) -> TileJob<Canceled> {
        TileJob {
            state: Canceled {
                started_at: None,
                canceled_at: Utc::now(),
            },
            data: self.data,
        }
    }
}

impl TileJob<Running> {
    /// Persist the current `progress` and refresh the heartbeat.
    pub async fn record_progress<S: Storage + ?Sized>(&mut self, storage: &S) -> Result<()> {
        self.state.heartbeat_at = Utc::now();
        storage.persist(self).await
    }

    /// Whether the worker's last heartbeat is older than `cutoff`.
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.state.heartbeat_at < cutoff
    }

    /// Take the job away from a worker that stopped sending heartbeats.
    ///
    /// The job goes back to the queue with its progress, so the next worker
    /// resumes after the last completed zoom level. A pending cancel request
    /// is honored instead.
    pub fn release(self, cancel_requested: bool) -> AnyTileJob {
        if cancel_requested {
            return self.into_canceled().into();
        }
        let mut data = self.data;
        data.progress.current_zoom = None;
        TileJob {
            state: Queued {
                queued_at: self.state.queued_at,
            },
            data,
        }
        .into()
    }

    fn into_canceled(self) -> TileJob<Canceled> {
        TileJob {
            state: Canceled {
                started_at: Some(self.state.started_at),
                canceled_at: Utc::now(),
            },
            data: self.data,
        }
    }

    pub async fn succeed<S: Storage + ?Sized>(self, storage: &S) -> Result<TileJob<Succeeded>> {
        let job = TileJob {
            state: Succeeded {
                started_at: self.state.started_at,
                completed_at: Utc::now(),
            },
            data: self.data,
        };
        storage.persist(&job).await?;
        counter!("georeferencer_tile_jobs_total", "outcome" => "succeeded").increment(1);
        Ok(job)
    }

    pub async fn fail<S: Storage + ?Sized>(
        self,
        reason: FailureReason,
        storage: &S,
    ) -> Result<TileJob<Failed>> {
        counter!(
            "georeferencer_tile_jobs_total",
            "outcome" => "failed",
            "reason" => reason.label()
        )
        .increment(1);
        let job = TileJob {
            state: Failed {
                reason,
                started_at: Some(self.state.started_at),
                failed_at: Utc::now(),
            },
            data: self.data,
        };
        storage.persist(&job).await?;
        Ok(job)
    }

    pub async fn cancel<S: Storage + ?Sized>(self, storage: &S) -> Result<TileJob<Canceled>> {
        let job = self.into_canceled();
        storage.persist(&job).await?;
        counter!("georeferencer_tile_jobs_total", "outcome" => "canceled").increment(1);
        Ok(job)
    }
}

/// Completed zoom levels carry over so the retry can skip them. The tile
/// count is recomputed when the retry starts.
fn resubmit(data: &TileJobData, requested_by: UserId) -> TileJob<Queued> {
    TileJob::new(TileJobData {
        id: TileJobId::new(),
        document_id: data.document_id,
        organization_id: data.organization_id,
        requested_by,
        zoom_levels: data.zoom_levels.clone(),
        priority: data.priority,
        created_at: Utc::now(),
        retry_of: Some(data.id),
        progress: StepProgress {
            zooms_completed: data.progress.zooms_completed.clone(),
            rendered_with: data.progress.rendered_with,
            ..StepProgress::new(data.progress.tiles_total)
        },
    })
}

impl TileJob<Failed> {
    /// A fresh queued job for the same document, zooms and priority.
    pub fn resubmission(&self, requested_by: UserId) -> TileJob<Queued> {
        resubmit(&self.data, requested_by)
    }
}

impl TileJob<Canceled> {
    /// A fresh queued job for the same document, zooms and priority.
    pub fn resubmission(&self, requested_by: UserId) -> TileJob<Queued> {
        resubmit(&self.data, requested_by)
    }
}

/// Per-tile retry policy for render and store calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per tile step, including the first.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
        }
    }
}

impl From<&crate::daemon::DaemonConfig> for RetryConfig {
    fn from(config: &crate::daemon::DaemonConfig) -> Self {
        config.retry
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_attempt` (0 for the first retry):
    /// `backoff_ms * backoff_factor ^ retry_attempt`, capped at `max_backoff_ms`.
    pub fn backoff(&self, retry_attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(retry_attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
