//! PostgreSQL implementation of [`Storage`].
//!
//! Entities are stored as JSONB payloads alongside the columns that queries
//! filter and order on. The invariants are enforced by the database:
//!
//! - the optimistic version check runs under a `FOR UPDATE` row lock,
//! - the one-live-job rule is the partial unique index
//!   `tile_jobs_one_live_per_document`,
//! - workers claim with `FOR UPDATE SKIP LOCKED`, so concurrent daemons never
//!   claim the same job,
//! - running jobs carry a `heartbeat_at` column; each claim first releases
//!   the ones whose heartbeat has expired.
//!
//! Run [`crate::migrator`] before use.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use super::{Storage, lease_cutoff};
use crate::domain::control_point::ControlPoint;
use crate::domain::document::{Document, DocumentId, FitId, FitRecord};
use crate::domain::job::{
    AnyTileJob, JobState, Queued, Running, TileJob, TileJobId, TileJobState, WorkerId,
};
use crate::error::{GeoreferenceError, Result};
use crate::geometry::FitOutcome;

/// Storage backed by a PostgreSQL pool.
///
/// # Example
/// ```ignore
/// use georeferencer::PostgresStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/georeferencer").await?;
/// georeferencer::migrator().run(&pool).await?;
/// let storage = Arc::new(PostgresStorage::new(pool));
/// ```
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_document(
        tx: &mut Transaction<'_, Postgres>,
        document_id: DocumentId,
    ) -> Result<Document> {
        let row = sqlx::query("SELECT payload FROM documents WHERE id = $1 FOR UPDATE")
            .bind(*document_id as Uuid)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(GeoreferenceError::DocumentNotFound(document_id))?;
        decode_payload(&row)
    }

    async fn write_document(tx: &mut Transaction<'_, Postgres>, document: &Document) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET version = $2, payload = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(*document.id as Uuid)
        .bind(document.version as i64)
        .bind(Json(document))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_fit(tx: &mut Transaction<'_, Postgres>, record: &FitRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fits (id, document_id, family, activated, fitted_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*record.id as Uuid)
        .bind(*record.document_id as Uuid)
        .bind(record.family.label())
        .bind(record.activated)
        .bind(record.fitted_at)
        .bind(Json(record))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: TileJobId,
    ) -> Result<(AnyTileJob, bool)> {
        let row = sqlx::query("SELECT payload, cancel_requested FROM tile_jobs WHERE id = $1 FOR UPDATE")
            .bind(*job_id as Uuid)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(GeoreferenceError::JobNotFound(job_id))?;
        Ok((decode_payload(&row)?, row.try_get("cancel_requested")?))
    }

    async fn write_job<'c, E>(executor: E, job: &AnyTileJob) -> Result<()>
    where
        E: sqlx::Executor<'c, Database = Postgres>,
    {
        let rows_affected = sqlx::query(
            r#"
            UPDATE tile_jobs
            SET state = $2, payload = $3, heartbeat_at = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(*job.id() as Uuid)
        .bind(job.state().as_str())
        .bind(Json(job))
        .bind(heartbeat_at(job))
        .execute(executor)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(GeoreferenceError::JobNotFound(job.id()));
        }
        Ok(())
    }

    /// Requeue (or cancel, if requested) running jobs whose heartbeat is
    /// older than `cutoff`. Rows another transaction holds are skipped.
    async fn release_expired(
        tx: &mut Transaction<'_, Postgres>,
        cutoff: DateTime<Utc>,
    ) -> Result<()> {
        let rows = sqlx::query(
            r#"
            SELECT payload, cancel_requested FROM tile_jobs
            WHERE state = 'running' AND heartbeat_at < $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(cutoff)
        .fetch_all(&mut **tx)
        .await?;

        for row in &rows {
            let job: AnyTileJob = decode_payload(row)?;
            let Some(running) = job.clone().into_running() else {
                return Err(invalid_state(&job, JobState::Running.as_str()));
            };
            let worker_id = running.state.worker_id;
            let released = running.release(row.try_get("cancel_requested")?);
            Self::write_job(&mut **tx, &released).await?;
            tracing::warn!(
                job_id = %released.id(),
                worker_id = %worker_id,
                released_to = %released.state(),
                "Released tile job from unresponsive worker"
            );
            counter!("georeferencer_tile_jobs_released_total", "to" => released.state().as_str())
                .increment(1);
        }
        Ok(())
    }

    async fn live_job_for(&self, document_id: DocumentId) -> Result<Option<TileJobId>> {
        let row = sqlx::query(
            "SELECT id FROM tile_jobs WHERE document_id = $1 AND state IN ('queued', 'running')",
        )
        .bind(*document_id as Uuid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row.try_get::<Uuid, _>("id").map(TileJobId::from))
            .transpose()
            .map_err(Into::into)
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(row: &PgRow) -> Result<T> {
    let Json(value) = row.try_get::<Json<T>, _>("payload")?;
    Ok(value)
}

fn heartbeat_at(job: &AnyTileJob) -> Option<DateTime<Utc>> {
    match job {
        AnyTileJob::Running(running) => Some(running.state.heartbeat_at),
        _ => None,
    }
}

fn invalid_state(job: &AnyTileJob, expected: &str) -> GeoreferenceError {
    GeoreferenceError::InvalidState(job.id(), job.state().to_string(), expected.to_string())
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_document(&self, document: Document) -> Result<Document> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, organization_id, version, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(*document.id as Uuid)
        .bind(*document.organization_id as Uuid)
        .bind(document.version as i64)
        .bind(Json(&document))
        .bind(document.created_at)
        .execute(&self.pool)
        .await?;
        Ok(document)
    }

    async fn get_document(&self, document_id: DocumentId) -> Result<Document> {
        let row = sqlx::query("SELECT payload FROM documents WHERE id = $1")
            .bind(*document_id as Uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GeoreferenceError::DocumentNotFound(document_id))?;
        decode_payload(&row)
    }

    async fn commit_fit(
        &self,
        expected_version: u64,
        mut record: FitRecord,
        outcome: FitOutcome,
    ) -> Result<Document> {
        let mut tx = self.pool.begin().await?;
        let mut document = Self::lock_document(&mut tx, record.document_id).await?;

        if document.version != expected_version {
            record.activated = false;
            Self::insert_fit(&mut tx, &record).await?;
            tx.commit().await?;
            return Err(GeoreferenceError::ConcurrentModification {
                document_id: document.id,
                expected: expected_version,
                actual: document.version,
            });
        }

        record.activated = true;
        document.activate(record.id, record.control_points.clone(), outcome);
        Self::write_document(&mut tx, &document).await?;
        Self::insert_fit(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(document)
    }

    async fn activate_fit(
        &self,
        document_id: DocumentId,
        expected_version: u64,
        fit_id: FitId,
        control_points: Vec<ControlPoint>,
        outcome: FitOutcome,
    ) -> Result<Document> {
        let mut tx = self.pool.begin().await?;
        let exists = sqlx::query("SELECT 1 FROM fits WHERE id = $1 AND document_id = $2")
            .bind(*fit_id as Uuid)
            .bind(*document_id as Uuid)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(GeoreferenceError::FitNotFound(fit_id));
        }

        let mut document = Self::lock_document(&mut tx, document_id).await?;
        if document.version != expected_version {
            return Err(GeoreferenceError::ConcurrentModification {
                document_id,
                expected: expected_version,
                actual: document.version,
            });
        }
        document.activate(fit_id, control_points, outcome);
        Self::write_document(&mut tx, &document).await?;
        tx.commit().await?;
        Ok(document)
    }

    async fn list_fits(&self, document_id: DocumentId) -> Result<Vec<FitRecord>> {
        let rows = sqlx::query("SELECT payload FROM fits WHERE document_id = $1 ORDER BY seq ASC")
            .bind(*document_id as Uuid)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_payload).collect()
    }

    async fn get_fit(&self, fit_id: FitId) -> Result<FitRecord> {
        let row = sqlx::query("SELECT payload FROM fits WHERE id = $1")
            .bind(*fit_id as Uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GeoreferenceError::FitNotFound(fit_id))?;
        decode_payload(&row)
    }

    async fn create_job(&self, job: TileJob<Queued>) -> Result<TileJob<Queued>> {
        let any = AnyTileJob::from(job.clone());
        let result = sqlx::query(
            r#"
            INSERT INTO tile_jobs (id, document_id, state, priority, retry_of, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*job.data.id as Uuid)
        .bind(*job.data.document_id as Uuid)
        .bind(JobState::Queued.as_str())
        .bind(job.data.priority as i16)
        .bind(job.data.retry_of.map(|id| *id as Uuid))
        .bind(Json(&any))
        .bind(job.data.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                let document_id = job.data.document_id;
                let job_id = self.live_job_for(document_id).await?.ok_or_else(|| {
                    GeoreferenceError::Other(anyhow!(
                        "unique violation for document {} without a live job",
                        document_id
                    ))
                })?;
                Err(GeoreferenceError::JobAlreadyActive {
                    document_id,
                    job_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_job(&self, job_id: TileJobId) -> Result<AnyTileJob> {
        let row = sqlx::query("SELECT payload FROM tile_jobs WHERE id = $1")
            .bind(*job_id as Uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GeoreferenceError::JobNotFound(job_id))?;
        decode_payload(&row)
    }

    async fn list_jobs(&self, document_id: DocumentId) -> Result<Vec<AnyTileJob>> {
        let rows =
            sqlx::query("SELECT payload FROM tile_jobs WHERE document_id = $1 ORDER BY seq DESC")
                .bind(*document_id as Uuid)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(decode_payload).collect()
    }

    async fn claim_next_job(
        &self,
        worker_id: WorkerId,
        lease: Duration,
    ) -> Result<Option<TileJob<Running>>> {
        let mut tx = self.pool.begin().await?;
        Self::release_expired(&mut tx, lease_cutoff(lease)).await?;
        let row = sqlx::query(
            r#"
            SELECT payload FROM tile_jobs
            WHERE state = 'queued'
            ORDER BY priority DESC, seq ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let job: AnyTileJob = decode_payload(&row)?;
        let queued = job
            .clone()
            .into_queued()
            .ok_or_else(|| invalid_state(&job, JobState::Queued.as_str()))?;
        let running = queued.into_running(worker_id);
        Self::write_job(&mut *tx, &running.clone().into()).await?;
        tx.commit().await?;

        tracing::debug!(job_id = %running.data.id, worker_id = %worker_id, "Claimed tile job");
        Ok(Some(running))
    }

    async fn start_job(&self, job_id: TileJobId, worker_id: WorkerId) -> Result<TileJob<Running>> {
        let mut tx = self.pool.begin().await?;
        let (job, _) = Self::lock_job(&mut tx, job_id).await?;
        let queued = job
            .clone()
            .into_queued()
            .ok_or_else(|| invalid_state(&job, JobState::Queued.as_str()))?;
        let running = queued.into_running(worker_id);
        Self::write_job(&mut *tx, &running.clone().into()).await?;
        tx.commit().await?;
        Ok(running)
    }

    async fn request_cancel(&self, job_id: TileJobId) -> Result<AnyTileJob> {
        let mut tx = self.pool.begin().await?;
        let (job, _) = Self::lock_job(&mut tx, job_id).await?;
        let job = match job {
            AnyTileJob::Queued(queued) => {
                let canceled: AnyTileJob = queued.into_canceled().into();
                Self::write_job(&mut *tx, &canceled).await?;
                canceled
            }
            AnyTileJob::Running(running) => {
                sqlx::query("UPDATE tile_jobs SET cancel_requested = TRUE, updated_at = NOW() WHERE id = $1")
                    .bind(*job_id as Uuid)
                    .execute(&mut *tx)
                    .await?;
                running.into()
            }
            other => return Err(invalid_state(&other, "queued or running")),
        };
        tx.commit().await?;
        Ok(job)
    }

    async fn is_cancel_requested(&self, job_id: TileJobId) -> Result<bool> {
        let row = sqlx::query("SELECT cancel_requested FROM tile_jobs WHERE id = $1")
            .bind(*job_id as Uuid)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(GeoreferenceError::JobNotFound(job_id))?;
        Ok(row.try_get("cancel_requested")?)
    }

    async fn persist<T: TileJobState + Clone>(&self, job: &TileJob<T>) -> Result<()>
    where
        AnyTileJob: From<TileJob<T>>,
    {
        let any = AnyTileJob::from(job.clone());
        Self::write_job(&self.pool, &any).await
    }
}
