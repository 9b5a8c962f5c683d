//! Request-path operations: georeferencing documents and submitting tile
//! jobs.
//!
//! Every operation authorizes the caller against the organization first.
//! Resources that belong to another organization are reported as not found,
//! so a caller learns nothing about documents or jobs outside its own
//! organizations.

use std::sync::Arc;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};

use crate::access::{AccessControl, Permission};
use crate::domain::control_point::{ControlPoint, TransformFamily};
use crate::domain::document::{Document, DocumentId, DocumentInput, FitId, FitRecord, OrganizationId, UserId};
use crate::domain::job::{
    AnyTileJob, DEFAULT_PRIORITY, JobStatus, Queued, StepProgress, TileJob, TileJobData, TileJobId,
};
use crate::error::{GeoreferenceError, Result};
use crate::geometry::{self, AccuracyReport, FitConfig, FitOutcome, FittedTransform, GeoBounds};
use crate::manager::Storage;
use crate::quota::QuotaGate;
use crate::tiles;

/// Result of a successful georeference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoreferenceResponse {
    pub success: bool,
    pub fit_id: FitId,
    pub rmse_meters: f64,
    pub bounds: GeoBounds,
    pub transform: FittedTransform,
    pub accuracy: AccuracyReport,
    pub document_version: u64,
}

/// Result of queuing a tile job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateTilesResponse {
    pub job_id: TileJobId,
    pub estimated_tile_count: u64,
}

pub struct GeoreferenceService<S, A, Q>
where
    S: Storage,
    A: AccessControl,
    Q: QuotaGate,
{
    storage: Arc<S>,
    access: Arc<A>,
    quota: Arc<Q>,
    config: FitConfig,
}

impl<S, A, Q> GeoreferenceService<S, A, Q>
where
    S: Storage + 'static,
    A: AccessControl + 'static,
    Q: QuotaGate + 'static,
{
    pub fn new(storage: Arc<S>, access: Arc<A>, quota: Arc<Q>, config: FitConfig) -> Self {
        Self {
            storage,
            access,
            quota,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Load a document, hiding documents of other organizations.
    async fn load_document(
        &self,
        organization_id: OrganizationId,
        document_id: DocumentId,
    ) -> Result<Document> {
        let document = self.storage.get_document(document_id).await?;
        if document.organization_id != organization_id {
            return Err(GeoreferenceError::DocumentNotFound(document_id));
        }
        Ok(document)
    }

    async fn load_job(&self, organization_id: OrganizationId, job_id: TileJobId) -> Result<AnyTileJob> {
        let job = self.storage.get_job(job_id).await?;
        if job.data().organization_id != organization_id {
            return Err(GeoreferenceError::JobNotFound(job_id));
        }
        Ok(job)
    }

    /// Register an uploaded document. It starts without a transform.
    #[tracing::instrument(skip(self, input), fields(user = %user, organization_id = %organization_id))]
    pub async fn create_document(
        &self,
        user: UserId,
        organization_id: OrganizationId,
        input: DocumentInput,
    ) -> Result<Document> {
        self.access
            .authorize(user, organization_id, Permission::Georeference)
            .await?;
        let document = self
            .storage
            .create_document(Document::new(organization_id, user, input))
            .await?;
        tracing::info!(document_id = %document.id, "Document registered");
        Ok(document)
    }

    /// Fit a transform to `control_points` and make it the document's
    /// active transform. The family defaults to affine.
    ///
    /// The fit runs on the blocking pool. If another fit is committed for
    /// the same document in the meantime, this one is still recorded in the
    /// ledger but not activated, and `ConcurrentModification` is returned.
    #[tracing::instrument(
        skip(self, control_points),
        fields(user = %user, document_id = %document_id, points = control_points.len())
    )]
    pub async fn georeference(
        &self,
        user: UserId,
        document_id: DocumentId,
        organization_id: OrganizationId,
        control_points: Vec<ControlPoint>,
        family: Option<TransformFamily>,
    ) -> Result<GeoreferenceResponse> {
        self.access
            .authorize(user, organization_id, Permission::Georeference)
            .await?;
        let document = self.load_document(organization_id, document_id).await?;
        let family = family.unwrap_or_default();
        let expected_version = document.version;

        let outcome = {
            let points = control_points.clone();
            let raster_size = document.raster_size();
            let config = self.config.clone();
            tokio::task::spawn_blocking(move || {
                geometry::fit_control_points(&points, family, raster_size, &config)
            })
            .await
            .map_err(|e| anyhow::anyhow!("fit task failed: {}", e))?
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                counter!(
                    "georeferencer_fits_total",
                    "family" => family.label(),
                    "outcome" => "rejected"
                )
                .increment(1);
                tracing::info!(%family, error = %e, "Fit rejected");
                return Err(e);
            }
        };

        let record = FitRecord::new(document_id, user, control_points, &outcome);
        let fit_id = record.id;
        let response = GeoreferenceResponse {
            success: true,
            fit_id,
            rmse_meters: outcome.accuracy.rmse_meters,
            bounds: outcome.bounds,
            transform: outcome.transform.clone(),
            accuracy: outcome.accuracy.clone(),
            document_version: expected_version + 1,
        };

        match self.storage.commit_fit(expected_version, record, outcome).await {
            Ok(updated) => {
                counter!(
                    "georeferencer_fits_total",
                    "family" => family.label(),
                    "outcome" => "activated"
                )
                .increment(1);
                histogram!("georeferencer_fit_rmse_meters", "family" => family.label())
                    .record(response.rmse_meters);
                tracing::info!(
                    fit_id = %fit_id,
                    %family,
                    rmse_meters = response.rmse_meters,
                    version = updated.version,
                    "Document georeferenced"
                );
                Ok(GeoreferenceResponse {
                    document_version: updated.version,
                    ..response
                })
            }
            Err(e @ GeoreferenceError::ConcurrentModification { .. }) => {
                counter!(
                    "georeferencer_fits_total",
                    "family" => family.label(),
                    "outcome" => "conflict"
                )
                .increment(1);
                tracing::warn!(fit_id = %fit_id, error = %e, "Fit lost a concurrent update, recorded without activation");
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Make an earlier fit active again. Accuracy and bounds are recomputed
    /// from the fit's stored transform and control points.
    #[tracing::instrument(skip(self), fields(user = %user, document_id = %document_id, fit_id = %fit_id))]
    pub async fn activate_fit(
        &self,
        user: UserId,
        document_id: DocumentId,
        organization_id: OrganizationId,
        fit_id: FitId,
    ) -> Result<Document> {
        self.access
            .authorize(user, organization_id, Permission::Georeference)
            .await?;
        let document = self.load_document(organization_id, document_id).await?;
        let record = self.storage.get_fit(fit_id).await?;
        if record.document_id != document_id {
            return Err(GeoreferenceError::FitNotFound(fit_id));
        }

        let FitRecord {
            transform,
            control_points,
            ..
        } = record;
        let raster_size = document.raster_size();
        let outcome: FitOutcome = {
            let points = control_points.clone();
            tokio::task::spawn_blocking(move || geometry::derive(transform, &points, raster_size))
                .await
                .map_err(|e| anyhow::anyhow!("derive task failed: {}", e))??
        };

        let updated = self
            .storage
            .activate_fit(document_id, document.version, fit_id, control_points, outcome)
            .await?;
        tracing::info!(version = updated.version, "Fit re-activated");
        Ok(updated)
    }

    /// The document's fit ledger, oldest first.
    pub async fn fit_history(
        &self,
        user: UserId,
        document_id: DocumentId,
        organization_id: OrganizationId,
    ) -> Result<Vec<FitRecord>> {
        self.access
            .authorize(user, organization_id, Permission::ViewJobs)
            .await?;
        self.load_document(organization_id, document_id).await?;
        self.storage.list_fits(document_id).await
    }

    /// Queue a tile job for a georeferenced document.
    ///
    /// Rejected while the document already has a queued or running job.
    #[tracing::instrument(skip(self), fields(user = %user, document_id = %document_id))]
    pub async fn generate_tiles(
        &self,
        user: UserId,
        document_id: DocumentId,
        organization_id: OrganizationId,
        zoom_levels: Vec<u8>,
        priority: Option<u8>,
    ) -> Result<GenerateTilesResponse> {
        self.access
            .authorize(user, organization_id, Permission::GenerateTiles)
            .await?;
        let document = self.load_document(organization_id, document_id).await?;
        let zoom_levels = tiles::normalize_zoom_levels(&zoom_levels)?;

        let job = TileJob::new(TileJobData {
            id: TileJobId::new(),
            document_id,
            organization_id,
            requested_by: user,
            zoom_levels,
            priority: priority.unwrap_or(DEFAULT_PRIORITY),
            created_at: chrono::Utc::now(),
            retry_of: None,
            progress: StepProgress::default(),
        });
        self.submit(&document, job).await
    }

    /// Queue a new job repeating a failed or canceled one.
    #[tracing::instrument(skip(self), fields(user = %user, job_id = %job_id))]
    pub async fn retry_job(
        &self,
        user: UserId,
        organization_id: OrganizationId,
        job_id: TileJobId,
    ) -> Result<GenerateTilesResponse> {
        self.access
            .authorize(user, organization_id, Permission::GenerateTiles)
            .await?;
        let job = self.load_job(organization_id, job_id).await?;
        let retry = match &job {
            AnyTileJob::Failed(failed) => failed.resubmission(user),
            AnyTileJob::Canceled(canceled) => canceled.resubmission(user),
            other => {
                return Err(GeoreferenceError::InvalidState(
                    job_id,
                    other.state().to_string(),
                    "failed or canceled".to_string(),
                ));
            }
        };
        let document = self
            .load_document(organization_id, job.data().document_id)
            .await?;
        self.submit(&document, retry).await
    }

    /// Shared tail of `generate_tiles` and `retry_job`: georeference check,
    /// tile estimate, quota, then the atomic insert.
    async fn submit(
        &self,
        document: &Document,
        mut job: TileJob<Queued>,
    ) -> Result<GenerateTilesResponse> {
        let Some(active) = &document.active else {
            reject("not_georeferenced");
            return Err(GeoreferenceError::NotGeoreferenced(document.id));
        };

        // Fail fast without spending quota. The insert below re-checks
        // atomically.
        if let Some(live) = self
            .storage
            .list_jobs(document.id)
            .await?
            .into_iter()
            .find(AnyTileJob::is_live)
        {
            reject("job_already_active");
            return Err(GeoreferenceError::JobAlreadyActive {
                document_id: document.id,
                job_id: live.id(),
            });
        }

        let estimated_tile_count = tiles::estimate_tile_count(&active.bounds, &job.data.zoom_levels);
        let organization_id = job.data.organization_id;
        let decision = self.quota.check(organization_id, estimated_tile_count).await?;
        if !decision.allowed {
            reject("quota_exceeded");
            tracing::warn!(
                requested = estimated_tile_count,
                remaining = decision.remaining,
                "Tile quota exceeded"
            );
            return Err(GeoreferenceError::QuotaExceeded {
                requested: estimated_tile_count,
                remaining: decision.remaining,
            });
        }

        job.data.progress.tiles_total = estimated_tile_count;
        let job = match self.storage.create_job(job).await {
            Ok(job) => job,
            Err(e) => {
                if let Err(release_error) = self.quota.release(organization_id, estimated_tile_count).await {
                    tracing::error!(error = %release_error, "Failed to release quota");
                }
                if matches!(e, GeoreferenceError::JobAlreadyActive { .. }) {
                    reject("job_already_active");
                }
                return Err(e);
            }
        };

        tracing::info!(
            job_id = %job.data.id,
            document_id = %document.id,
            zoom_levels = ?job.data.zoom_levels,
            priority = job.data.priority,
            estimated_tile_count,
            retry_of = ?job.data.retry_of.map(|id| id.to_string()),
            "Tile job queued"
        );
        Ok(GenerateTilesResponse {
            job_id: job.data.id,
            estimated_tile_count,
        })
    }

    pub async fn job_status(
        &self,
        user: UserId,
        organization_id: OrganizationId,
        job_id: TileJobId,
    ) -> Result<JobStatus> {
        self.access
            .authorize(user, organization_id, Permission::ViewJobs)
            .await?;
        Ok(self.load_job(organization_id, job_id).await?.status())
    }

    /// Jobs for a document, newest first.
    pub async fn list_jobs(
        &self,
        user: UserId,
        document_id: DocumentId,
        organization_id: OrganizationId,
    ) -> Result<Vec<JobStatus>> {
        self.access
            .authorize(user, organization_id, Permission::ViewJobs)
            .await?;
        self.load_document(organization_id, document_id).await?;
        Ok(self
            .storage
            .list_jobs(document_id)
            .await?
            .iter()
            .map(AnyTileJob::status)
            .collect())
    }

    /// Cancel a job. Queued jobs are canceled at once; running jobs stop
    /// before their next tile.
    #[tracing::instrument(skip(self), fields(user = %user, job_id = %job_id))]
    pub async fn cancel_job(
        &self,
        user: UserId,
        organization_id: OrganizationId,
        job_id: TileJobId,
    ) -> Result<JobStatus> {
        self.access
            .authorize(user, organization_id, Permission::GenerateTiles)
            .await?;
        self.load_job(organization_id, job_id).await?;
        let job = self.storage.request_cancel(job_id).await?;
        match &job {
            AnyTileJob::Canceled(_) => {
                counter!("georeferencer_tile_jobs_total", "outcome" => "canceled").increment(1);
                tracing::info!("Queued tile job canceled");
            }
            _ => tracing::info!(state = %job.state(), "Cancellation requested for running tile job"),
        }
        Ok(job.status())
    }
}

fn reject(reason: &'static str) {
    counter!("georeferencer_job_submissions_rejected_total", "reason" => reason).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::StaticAccessControl;
    use crate::domain::job::JobState;
    use crate::error::{ErrorKind, ValidationError};
    use crate::geometry::solver::tests::scenario_points;
    use crate::manager::memory::InMemoryStorage;
    use crate::quota::{FixedQuota, UnlimitedQuota};

    struct Fixture<Q: QuotaGate> {
        service: GeoreferenceService<InMemoryStorage, StaticAccessControl, Q>,
        user: UserId,
        org: OrganizationId,
    }

    fn fixture_with<Q: QuotaGate + 'static>(quota: Q) -> Fixture<Q> {
        let access = StaticAccessControl::new();
        let user = UserId::new();
        let org = OrganizationId::new();
        access.grant_all(user, org);
        Fixture {
            service: GeoreferenceService::new(
                Arc::new(InMemoryStorage::new()),
                Arc::new(access),
                Arc::new(quota),
                FitConfig::default(),
            ),
            user,
            org,
        }
    }

    fn fixture() -> Fixture<UnlimitedQuota> {
        fixture_with(UnlimitedQuota)
    }

    impl<Q: QuotaGate + 'static> Fixture<Q> {
        async fn document(&self) -> Document {
            self.service
                .create_document(
                    self.user,
                    self.org,
                    DocumentInput {
                        name: "sheet-12.tif".into(),
                        width_px: Some(100),
                        height_px: Some(100),
                    },
                )
                .await
                .unwrap()
        }

        async fn georeferenced(&self) -> Document {
            let doc = self.document().await;
            self.service
                .georeference(self.user, doc.id, self.org, scenario_points(), None)
                .await
                .unwrap();
            self.service.storage().get_document(doc.id).await.unwrap()
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_georeference_scenario() {
        let f = fixture();
        let doc = f.document().await;
        let response = f
            .service
            .georeference(f.user, doc.id, f.org, scenario_points(), Some(TransformFamily::Affine))
            .await
            .unwrap();

        assert!(response.success);
        assert!(response.rmse_meters < 1e-3);
        assert_eq!(response.document_version, 1);
        let p = response.transform.apply(50.0, 50.0);
        assert!((p.longitude - -121.9995).abs() < 1e-9);
        assert!((p.latitude - 37.0005).abs() < 1e-9);

        let history = f.service.fit_history(f.user, doc.id, f.org).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, response.fit_id);
        assert_eq!(history[0].point_count, 3);
    }

    #[tokio::test]
    async fn test_two_points_are_rejected_without_ledger_entry() {
        let f = fixture();
        let doc = f.document().await;
        let err = f
            .service
            .georeference(f.user, doc.id, f.org, scenario_points()[..2].to_vec(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GeoreferenceError::Validation(ValidationError::InsufficientPoints { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(f.service.fit_history(f.user, doc.id, f.org).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_rederives_accuracy() {
        let f = fixture();
        let doc = f.document().await;
        let first = f
            .service
            .georeference(f.user, doc.id, f.org, scenario_points(), None)
            .await
            .unwrap();

        let mut shifted = scenario_points();
        shifted.push(ControlPoint::new(100.0, 100.0, -121.999, 37.0012));
        let second = f
            .service
            .georeference(f.user, doc.id, f.org, shifted, None)
            .await
            .unwrap();
        assert!(second.rmse_meters > 1.0);

        let doc = f
            .service
            .activate_fit(f.user, doc.id, f.org, first.fit_id)
            .await
            .unwrap();
        let active = doc.active.unwrap();
        assert_eq!(active.fit_id, first.fit_id);
        assert!(active.accuracy.rmse_meters < 1e-3);
        assert_eq!(doc.version, 3);
        assert_eq!(f.service.fit_history(f.user, doc.id, f.org).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tiling_requires_active_transform() {
        let f = fixture();
        let doc = f.document().await;
        let err = f
            .service
            .generate_tiles(f.user, doc.id, f.org, vec![10], None)
            .await
            .unwrap_err();
        assert!(matches!(err, GeoreferenceError::NotGeoreferenced(id) if id == doc.id));
    }

    #[tokio::test]
    async fn test_second_submission_rejected_until_terminal() {
        let f = fixture();
        let doc = f.georeferenced().await;
        let first = f
            .service
            .generate_tiles(f.user, doc.id, f.org, vec![12, 10, 12], Some(7))
            .await
            .unwrap();
        assert!(first.estimated_tile_count >= 2);

        let err = f
            .service
            .generate_tiles(f.user, doc.id, f.org, vec![10], None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, GeoreferenceError::JobAlreadyActive { job_id, .. } if job_id == first.job_id)
        );

        let status = f.service.cancel_job(f.user, f.org, first.job_id).await.unwrap();
        assert_eq!(status.state, JobState::Canceled);

        let second = f
            .service
            .generate_tiles(f.user, doc.id, f.org, vec![10], None)
            .await
            .unwrap();
        let status = f.service.job_status(f.user, f.org, second.job_id).await.unwrap();
        assert_eq!(status.state, JobState::Queued);
        assert_eq!(status.priority, DEFAULT_PRIORITY);
        assert_eq!(f.service.list_jobs(f.user, doc.id, f.org).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_retry_copies_job_and_requires_terminal_state() {
        let f = fixture();
        let doc = f.georeferenced().await;
        let first = f
            .service
            .generate_tiles(f.user, doc.id, f.org, vec![11, 12], Some(9))
            .await
            .unwrap();

        assert!(matches!(
            f.service.retry_job(f.user, f.org, first.job_id).await,
            Err(GeoreferenceError::InvalidState(..))
        ));

        f.service.cancel_job(f.user, f.org, first.job_id).await.unwrap();
        let retry = f.service.retry_job(f.user, f.org, first.job_id).await.unwrap();
        let status = f.service.job_status(f.user, f.org, retry.job_id).await.unwrap();
        assert_eq!(status.retry_of, Some(first.job_id));
        assert_eq!(status.zoom_levels, vec![11, 12]);
        assert_eq!(status.priority, 9);
        assert_eq!(retry.estimated_tile_count, first.estimated_tile_count);
    }

    #[tokio::test]
    async fn test_quota_rejection_carries_remaining() {
        let f = fixture_with(FixedQuota::new(3));
        let doc = f.georeferenced().await;
        let err = f
            .service
            .generate_tiles(f.user, doc.id, f.org, vec![14, 15, 16, 17, 18], None)
            .await
            .unwrap_err();
        match err {
            GeoreferenceError::QuotaExceeded {
                requested,
                remaining,
            } => {
                assert!(requested > 3);
                assert_eq!(remaining, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_other_organizations_see_nothing() {
        let f = fixture();
        let doc = f.georeferenced().await;
        let job = f
            .service
            .generate_tiles(f.user, doc.id, f.org, vec![10], None)
            .await
            .unwrap();

        // A stranger is denied outright.
        let stranger = UserId::new();
        assert!(matches!(
            f.service.job_status(stranger, f.org, job.job_id).await,
            Err(GeoreferenceError::AccessDenied)
        ));

        // A member of another organization cannot tell the job exists.
        let other_org = OrganizationId::new();
        let access = StaticAccessControl::new();
        access.grant_all(f.user, f.org);
        access.grant_all(stranger, other_org);
        let service = GeoreferenceService::new(
            f.service.storage().clone(),
            Arc::new(access),
            Arc::new(UnlimitedQuota),
            FitConfig::default(),
        );
        assert!(matches!(
            service.job_status(stranger, other_org, job.job_id).await,
            Err(GeoreferenceError::JobNotFound(_))
        ));
        assert!(matches!(
            service
                .georeference(stranger, doc.id, other_org, scenario_points(), None)
                .await,
            Err(GeoreferenceError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_zoom_levels() {
        let f = fixture();
        let doc = f.georeferenced().await;
        assert!(matches!(
            f.service.generate_tiles(f.user, doc.id, f.org, vec![], None).await,
            Err(GeoreferenceError::Validation(ValidationError::InvalidZoomLevels(_)))
        ));
    }
}
