//! Tile job types.
//!
//! Jobs use the typestate pattern: a `TileJob<Queued>` only offers the
//! operations valid for a queued job, and transitions return a job of the
//! next state type.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::document::{DocumentId, FitId, OrganizationId, UserId};
use crate::domain::uuid_id;
use crate::tiles::TileCoord;

uuid_id!(
    /// Unique identifier for a tile job.
    TileJobId
);
uuid_id!(
    /// Unique identifier for a worker process running jobs.
    WorkerId
);

/// Priority assigned when the caller does not choose one.
pub const DEFAULT_PRIORITY: u8 = 5;

/// Stored state of a job, used for filtering and for the `state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }

    /// Queued and running jobs block new submissions for their document.
    pub fn is_live(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker trait for valid job states.
pub trait TileJobState: Send + Sync {}

/// A tile generation job for one document.
///
/// The generic parameter `T` is the current state of the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileJob<T: TileJobState> {
    pub state: T,
    pub data: TileJobData,
}

/// State-independent job data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileJobData {
    pub id: TileJobId,
    pub document_id: DocumentId,
    pub organization_id: OrganizationId,
    pub requested_by: UserId,
    /// Sorted, deduplicated zoom levels.
    pub zoom_levels: Vec<u8>,
    /// Higher runs first.
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    /// The failed or canceled job this one re-runs, if any.
    pub retry_of: Option<TileJobId>,
    pub progress: StepProgress,
}

/// How far a job has got. Updated by the worker after every tile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub tiles_total: u64,
    pub tiles_done: u64,
    pub current_zoom: Option<u8>,
    pub zooms_completed: Vec<u8>,
    /// Fit the completed zoom levels were rendered with. A worker only
    /// skips completed zoom levels while this is still the active fit.
    #[serde(default)]
    pub rendered_with: Option<FitId>,
}

impl StepProgress {
    pub fn new(tiles_total: u64) -> Self {
        Self {
            tiles_total,
            ..Self::default()
        }
    }

    /// Fraction of tiles done, in [0, 1].
    pub fn fraction(&self) -> f64 {
        if self.tiles_total == 0 {
            1.0
        } else {
            (self.tiles_done as f64 / self.tiles_total as f64).min(1.0)
        }
    }
}

// ============================================================================
// Job States
// ============================================================================

/// Waiting for a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queued {
    pub queued_at: DateTime<Utc>,
}

impl TileJobState for Queued {}

/// Being rendered by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Running {
    pub worker_id: WorkerId,
    pub queued_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// Last time the worker persisted progress. A job whose heartbeat is
    /// older than the daemon's running timeout is taken back by the next
    /// claim.
    pub heartbeat_at: DateTime<Utc>,
}

impl TileJobState for Running {}

/// Every tile was rendered and stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Succeeded {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl TileJobState for Succeeded {}

/// Why a job stopped before finishing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "details")]
pub enum FailureReason {
    /// A tile kept failing with transient render errors (or timeouts).
    RenderRetriesExhausted {
        tile: TileCoord,
        attempts: u32,
        last_error: String,
    },

    /// The renderer refused a tile outright.
    RenderRejected { tile: TileCoord, error: String },

    /// Storing a rendered tile kept failing with transient errors.
    StoreRetriesExhausted {
        tile: TileCoord,
        attempts: u32,
        last_error: String,
    },

    /// The tile store refused a tile outright.
    StoreRejected { tile: TileCoord, error: String },

    /// The document lost (or never had) an active transform.
    DocumentNotGeoreferenced,

    /// The worker task ended unexpectedly.
    WorkerTerminated { error: String },
}

impl FailureReason {
    /// Returns true if the failure came from transient conditions, so a
    /// retry job may succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            FailureReason::RenderRetriesExhausted { .. } => true,
            FailureReason::RenderRejected { .. } => false,
            FailureReason::StoreRetriesExhausted { .. } => true,
            FailureReason::StoreRejected { .. } => false,
            FailureReason::DocumentNotGeoreferenced => false,
            FailureReason::WorkerTerminated { .. } => true,
        }
    }

    /// Returns a human-readable error message for this failure reason.
    pub fn to_error_message(&self) -> String {
        match self {
            FailureReason::RenderRetriesExhausted {
                tile,
                attempts,
                last_error,
            } => format!(
                "Rendering tile {} failed after {} attempts: {}",
                tile, attempts, last_error
            ),
            FailureReason::RenderRejected { tile, error } => {
                format!("Renderer rejected tile {}: {}", tile, error)
            }
            FailureReason::StoreRetriesExhausted {
                tile,
                attempts,
                last_error,
            } => format!(
                "Storing tile {} failed after {} attempts: {}",
                tile, attempts, last_error
            ),
            FailureReason::StoreRejected { tile, error } => {
                format!("Tile store rejected tile {}: {}", tile, error)
            }
            FailureReason::DocumentNotGeoreferenced => {
                "Document has no active transform".to_string()
            }
            FailureReason::WorkerTerminated { error } => {
                format!("Worker terminated unexpectedly: {}", error)
            }
        }
    }

    /// Low-cardinality label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::RenderRetriesExhausted { .. } => "render_retries_exhausted",
            FailureReason::RenderRejected { .. } => "render_rejected",
            FailureReason::StoreRetriesExhausted { .. } => "store_retries_exhausted",
            FailureReason::StoreRejected { .. } => "store_rejected",
            FailureReason::DocumentNotGeoreferenced => "not_georeferenced",
            FailureReason::WorkerTerminated { .. } => "worker_terminated",
        }
    }
}

/// Job stopped with an unrecoverable error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failed {
    pub reason: FailureReason,
    pub started_at: Option<DateTime<Utc>>,
    pub failed_at: DateTime<Utc>,
}

impl TileJobState for Failed {}

/// Job was canceled by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Canceled {
    pub started_at: Option<DateTime<Utc>>,
    pub canceled_at: DateTime<Utc>,
}

impl TileJobState for Canceled {}

// ============================================================================
// Unified Job Representation
// ============================================================================

/// A job in any state, for storage and status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", content = "job", rename_all = "lowercase")]
pub enum AnyTileJob {
    Queued(TileJob<Queued>),
    Running(TileJob<Running>),
    Succeeded(TileJob<Succeeded>),
    Failed(TileJob<Failed>),
    Canceled(TileJob<Canceled>),
}

impl AnyTileJob {
    pub fn id(&self) -> TileJobId {
        self.data().id
    }

    pub fn data(&self) -> &TileJobData {
        match self {
            AnyTileJob::Queued(j) => &j.data,
            AnyTileJob::Running(j) => &j.data,
            AnyTileJob::Succeeded(j) => &j.data,
            AnyTileJob::Failed(j) => &j.data,
            AnyTileJob::Canceled(j) => &j.data,
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            AnyTileJob::Queued(_) => JobState::Queued,
            AnyTileJob::Running(_) => JobState::Running,
            AnyTileJob::Succeeded(_) => JobState::Succeeded,
            AnyTileJob::Failed(_) => JobState::Failed,
            AnyTileJob::Canceled(_) => JobState::Canceled,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match self {
            AnyTileJob::Failed(j) => Some(&j.state.reason),
            _ => None,
        }
    }

    pub fn into_queued(self) -> Option<TileJob<Queued>> {
        match self {
            AnyTileJob::Queued(j) => Some(j),
            _ => None,
        }
    }

    pub fn into_running(self) -> Option<TileJob<Running>> {
        match self {
            AnyTileJob::Running(j) => Some(j),
            _ => None,
        }
    }

    /// Read-only snapshot for status queries.
    pub fn status(&self) -> JobStatus {
        let data = self.data();
        JobStatus {
            job_id: data.id,
            document_id: data.document_id,
            state: self.state(),
            zoom_levels: data.zoom_levels.clone(),
            priority: data.priority,
            progress: data.progress.clone(),
            failure: self.failure_reason().cloned(),
            error_message: self.failure_reason().map(FailureReason::to_error_message),
            retry_of: data.retry_of,
            created_at: data.created_at,
        }
    }
}

macro_rules! impl_from_job {
    ($($state:ident),*) => {
        $(
            impl From<TileJob<$state>> for AnyTileJob {
                fn from(job: TileJob<$state>) -> Self {
                    AnyTileJob::$state(job)
                }
            }
        )*
    };
}

impl_from_job!(Queued, Running, Succeeded, Failed, Canceled);

/// Status information for a job, as returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: TileJobId,
    pub document_id: DocumentId,
    pub state: JobState,
    pub zoom_levels: Vec<u8>,
    pub priority: u8,
    pub progress: StepProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<TileJobId>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> TileJobData {
        TileJobData {
            id: TileJobId::new(),
            document_id: DocumentId::new(),
            organization_id: OrganizationId::new(),
            requested_by: UserId::new(),
            zoom_levels: vec![0, 1],
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
            retry_of: None,
            progress: StepProgress::new(5),
        }
    }

    #[test]
    fn test_live_states() {
        assert!(JobState::Queued.is_live());
        assert!(JobState::Running.is_live());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Canceled.is_terminal());
    }

    #[test]
    fn test_failure_reason_retriability() {
        let tile = TileCoord::new(1, 0, 0);
        assert!(
            FailureReason::RenderRetriesExhausted {
                tile,
                attempts: 3,
                last_error: "timeout".into()
            }
            .is_retriable()
        );
        assert!(
            !FailureReason::RenderRejected {
                tile,
                error: "bad".into()
            }
            .is_retriable()
        );
        assert!(!FailureReason::DocumentNotGeoreferenced.is_retriable());
        assert!(
            FailureReason::StoreRejected {
                tile,
                error: "403".into()
            }
            .to_error_message()
            .contains("1/0/0")
        );
    }

    #[test]
    fn test_any_job_serde_round_trip_keeps_state() {
        let job = AnyTileJob::from(TileJob {
            state: Failed {
                reason: FailureReason::DocumentNotGeoreferenced,
                started_at: None,
                failed_at: Utc::now(),
            },
            data: data(),
        });
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["state"], "failed");
        let back: AnyTileJob = serde_json::from_value(json).unwrap();
        assert_eq!(back.state(), JobState::Failed);
        assert_eq!(back.id(), job.id());
        let status = back.status();
        assert_eq!(status.failure, Some(FailureReason::DocumentNotGeoreferenced));
        assert!(status.error_message.is_some());
    }

    #[test]
    fn test_progress_fraction() {
        let mut progress = StepProgress::new(4);
        assert_eq!(progress.fraction(), 0.0);
        progress.tiles_done = 1;
        assert_eq!(progress.fraction(), 0.25);
        assert_eq!(StepProgress::new(0).fraction(), 1.0);
    }
}
