//! Persistence traits for documents, the fit ledger and tile jobs.
//!
//! Implementations must make the multi-step operations below atomic:
//! committing a fit against an expected document version, creating a job
//! while no other live job exists for the document, and claiming or
//! canceling a queued job. The type system ensures valid job state
//! transitions, so `persist` does not re-validate them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::control_point::ControlPoint;
use crate::domain::document::{Document, DocumentId, FitId, FitRecord};
use crate::domain::job::{AnyTileJob, Queued, Running, TileJob, TileJobId, TileJobState, WorkerId};
use crate::error::Result;
use crate::geometry::FitOutcome;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

#[async_trait]
pub trait Storage: Send + Sync {
    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    async fn create_document(&self, document: Document) -> Result<Document>;

    async fn get_document(&self, document_id: DocumentId) -> Result<Document>;

    /// Append `record` to the ledger and make it the document's active fit.
    ///
    /// If the document's version no longer equals `expected_version`, the
    /// record is still appended (with `activated = false`) and
    /// `ConcurrentModification` is returned.
    async fn commit_fit(
        &self,
        expected_version: u64,
        record: FitRecord,
        outcome: FitOutcome,
    ) -> Result<Document>;

    /// Re-activate a fit already in the ledger, with freshly derived
    /// accuracy and bounds. Same version check as [`Storage::commit_fit`],
    /// but nothing is appended.
    async fn activate_fit(
        &self,
        document_id: DocumentId,
        expected_version: u64,
        fit_id: FitId,
        control_points: Vec<ControlPoint>,
        outcome: FitOutcome,
    ) -> Result<Document>;

    // ------------------------------------------------------------------
    // Ledger
    // ------------------------------------------------------------------

    /// Every fit for a document, oldest first.
    async fn list_fits(&self, document_id: DocumentId) -> Result<Vec<FitRecord>>;

    async fn get_fit(&self, fit_id: FitId) -> Result<FitRecord>;

    // ------------------------------------------------------------------
    // Tile jobs
    // ------------------------------------------------------------------

    /// Insert a queued job, failing with `JobAlreadyActive` if the document
    /// already has a queued or running job.
    async fn create_job(&self, job: TileJob<Queued>) -> Result<TileJob<Queued>>;

    async fn get_job(&self, job_id: TileJobId) -> Result<AnyTileJob>;

    /// Jobs for a document, newest first.
    async fn list_jobs(&self, document_id: DocumentId) -> Result<Vec<AnyTileJob>>;

    /// Atomically move the best queued job (highest priority, then oldest)
    /// to running.
    ///
    /// Running jobs whose heartbeat is older than `lease` are released
    /// first (see [`TileJob::release`]), so a job left behind by a crashed
    /// worker is requeued, or canceled if a cancel was requested, and may be
    /// the one claimed here.
    async fn claim_next_job(
        &self,
        worker_id: WorkerId,
        lease: Duration,
    ) -> Result<Option<TileJob<Running>>>;

    /// Atomically move a specific queued job to running.
    async fn start_job(&self, job_id: TileJobId, worker_id: WorkerId) -> Result<TileJob<Running>>;

    /// Cancel a queued job immediately, or flag a running job so its worker
    /// stops before the next tile. Returns the job as stored afterwards.
    async fn request_cancel(&self, job_id: TileJobId) -> Result<AnyTileJob>;

    async fn is_cancel_requested(&self, job_id: TileJobId) -> Result<bool>;

    /// Update an existing job's state in storage.
    async fn persist<T: TileJobState + Clone>(&self, job: &TileJob<T>) -> Result<()>
    where
        AnyTileJob: From<TileJob<T>>;
}

/// Heartbeats older than this instant mark an abandoned job.
pub(crate) fn lease_cutoff(lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(lease)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
