//! In-process storage backend.
//!
//! All state sits behind one mutex, so every trait operation is a single
//! critical section and the document-version and one-live-job checks are
//! trivially atomic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;

use crate::domain::control_point::ControlPoint;
use crate::domain::document::{Document, DocumentId, FitId, FitRecord};
use crate::domain::job::{
    AnyTileJob, JobState, Queued, Running, TileJob, TileJobId, TileJobState, WorkerId,
};
use crate::error::{GeoreferenceError, Result};
use crate::geometry::FitOutcome;
use crate::manager::{Storage, lease_cutoff};

struct JobRow {
    job: AnyTileJob,
    cancel_requested: bool,
    /// Insertion order, for FIFO within a priority.
    seq: u64,
}

#[derive(Default)]
struct State {
    documents: HashMap<DocumentId, Document>,
    fits: Vec<FitRecord>,
    jobs: HashMap<TileJobId, JobRow>,
    next_seq: u64,
}

impl State {
    fn document_mut(&mut self, document_id: DocumentId) -> Result<&mut Document> {
        self.documents
            .get_mut(&document_id)
            .ok_or(GeoreferenceError::DocumentNotFound(document_id))
    }

    fn check_version(document: &Document, expected_version: u64) -> Result<()> {
        if document.version != expected_version {
            return Err(GeoreferenceError::ConcurrentModification {
                document_id: document.id,
                expected: expected_version,
                actual: document.version,
            });
        }
        Ok(())
    }

    /// Release every running job whose heartbeat is older than `cutoff`.
    fn release_expired(&mut self, cutoff: DateTime<Utc>) {
        for row in self.jobs.values_mut() {
            let AnyTileJob::Running(running) = &row.job else {
                continue;
            };
            if !running.lease_expired(cutoff) {
                continue;
            }
            let released = running.clone().release(row.cancel_requested);
            tracing::warn!(
                job_id = %released.id(),
                worker_id = %running.state.worker_id,
                heartbeat_at = %running.state.heartbeat_at,
                released_to = %released.state(),
                "Released tile job from unresponsive worker"
            );
            counter!("georeferencer_tile_jobs_released_total", "to" => released.state().as_str())
                .increment(1);
            row.job = released;
        }
    }

    fn live_job_for(&self, document_id: DocumentId) -> Option<TileJobId> {
        self.jobs
            .values()
            .find(|row| row.job.is_live() && row.job.data().document_id == document_id)
            .map(|row| row.job.id())
    }
}

/// Storage backed by process memory. State is lost on drop.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Mutex<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn invalid_state(job: &AnyTileJob, expected: JobState) -> GeoreferenceError {
    GeoreferenceError::InvalidState(job.id(), job.state().to_string(), expected.to_string())
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_document(&self, document: Document) -> Result<Document> {
        self.state
            .lock()
            .documents
            .insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, document_id: DocumentId) -> Result<Document> {
        self.state
            .lock()
            .documents
            .get(&document_id)
            .cloned()
            .ok_or(GeoreferenceError::DocumentNotFound(document_id))
    }

    async fn commit_fit(
        &self,
        expected_version: u64,
        mut record: FitRecord,
        outcome: FitOutcome,
    ) -> Result<Document> {
        let mut state = self.state.lock();
        let document = state.document_mut(record.document_id)?;

        if let Err(e) = State::check_version(document, expected_version) {
            record.activated = false;
            state.fits.push(record);
            return Err(e);
        }

        document.activate(record.id, record.control_points.clone(), outcome);
        let updated = document.clone();
        record.activated = true;
        state.fits.push(record);
        Ok(updated)
    }

    async fn activate_fit(
        &self,
        document_id: DocumentId,
        expected_version: u64,
        fit_id: FitId,
        control_points: Vec<ControlPoint>,
        outcome: FitOutcome,
    ) -> Result<Document> {
        let mut state = self.state.lock();
        if !state
            .fits
            .iter()
            .any(|f| f.id == fit_id && f.document_id == document_id)
        {
            return Err(GeoreferenceError::FitNotFound(fit_id));
        }
        let document = state.document_mut(document_id)?;
        State::check_version(document, expected_version)?;
        document.activate(fit_id, control_points, outcome);
        Ok(document.clone())
    }

    async fn list_fits(&self, document_id: DocumentId) -> Result<Vec<FitRecord>> {
        Ok(self
            .state
            .lock()
            .fits
            .iter()
            .filter(|f| f.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn get_fit(&self, fit_id: FitId) -> Result<FitRecord> {
        self.state
            .lock()
            .fits
            .iter()
            .find(|f| f.id == fit_id)
            .cloned()
            .ok_or(GeoreferenceError::FitNotFound(fit_id))
    }

    async fn create_job(&self, job: TileJob<Queued>) -> Result<TileJob<Queued>> {
        let mut state = self.state.lock();
        let document_id = job.data.document_id;
        if let Some(job_id) = state.live_job_for(document_id) {
            return Err(GeoreferenceError::JobAlreadyActive {
                document_id,
                job_id,
            });
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job.data.id,
            JobRow {
                job: job.clone().into(),
                cancel_requested: false,
                seq,
            },
        );
        Ok(job)
    }

    async fn get_job(&self, job_id: TileJobId) -> Result<AnyTileJob> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .map(|row| row.job.clone())
            .ok_or(GeoreferenceError::JobNotFound(job_id))
    }

    async fn list_jobs(&self, document_id: DocumentId) -> Result<Vec<AnyTileJob>> {
        let state = self.state.lock();
        let mut rows: Vec<&JobRow> = state
            .jobs
            .values()
            .filter(|row| row.job.data().document_id == document_id)
            .collect();
        rows.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(rows.into_iter().map(|row| row.job.clone()).collect())
    }

    async fn claim_next_job(
        &self,
        worker_id: WorkerId,
        lease: Duration,
    ) -> Result<Option<TileJob<Running>>> {
        let mut state = self.state.lock();
        state.release_expired(lease_cutoff(lease));
        let next = state
            .jobs
            .values()
            .filter(|row| row.job.state() == JobState::Queued)
            .max_by(|a, b| {
                a.job
                    .data()
                    .priority
                    .cmp(&b.job.data().priority)
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|row| row.job.id());

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(row) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        let Some(queued) = row.job.clone().into_queued() else {
            return Ok(None);
        };
        let running = queued.into_running(worker_id);
        row.job = running.clone().into();
        Ok(Some(running))
    }

    async fn start_job(&self, job_id: TileJobId, worker_id: WorkerId) -> Result<TileJob<Running>> {
        let mut state = self.state.lock();
        let row = state
            .jobs
            .get_mut(&job_id)
            .ok_or(GeoreferenceError::JobNotFound(job_id))?;
        let queued = row
            .job
            .clone()
            .into_queued()
            .ok_or_else(|| invalid_state(&row.job, JobState::Queued))?;
        let running = queued.into_running(worker_id);
        row.job = running.clone().into();
        Ok(running)
    }

    async fn request_cancel(&self, job_id: TileJobId) -> Result<AnyTileJob> {
        let mut state = self.state.lock();
        let row = state
            .jobs
            .get_mut(&job_id)
            .ok_or(GeoreferenceError::JobNotFound(job_id))?;
        match row.job.clone() {
            AnyTileJob::Queued(job) => {
                row.job = job.into_canceled().into();
            }
            AnyTileJob::Running(_) => {
                row.cancel_requested = true;
            }
            other => {
                return Err(GeoreferenceError::InvalidState(
                    job_id,
                    other.state().to_string(),
                    "queued or running".to_string(),
                ));
            }
        }
        Ok(row.job.clone())
    }

    async fn is_cancel_requested(&self, job_id: TileJobId) -> Result<bool> {
        self.state
            .lock()
            .jobs
            .get(&job_id)
            .map(|row| row.cancel_requested)
            .ok_or(GeoreferenceError::JobNotFound(job_id))
    }

    async fn persist<T: TileJobState + Clone>(&self, job: &TileJob<T>) -> Result<()>
    where
        AnyTileJob: From<TileJob<T>>,
    {
        let mut state = self.state.lock();
        let row = state
            .jobs
            .get_mut(&job.data.id)
            .ok_or(GeoreferenceError::JobNotFound(job.data.id))?;
        row.job = AnyTileJob::from(job.clone());
        Ok(())
    }
}
