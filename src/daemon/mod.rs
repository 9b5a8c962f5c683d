//! Background worker pool that renders queued tile jobs.
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::domain::job::{
    AnyTileJob, FailureReason, RetryConfig, Running, StepProgress, TileJob, TileJobId, WorkerId,
};
use crate::error::{GeoreferenceError, Result};
use crate::manager::Storage;
use crate::render::{RenderRequest, TileRenderer};
use crate::tile_store::TileStore;
use crate::tiles;

mod pipeline;

use pipeline::{Step, run_step};

/// Configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Jobs processed at the same time by one daemon
    pub max_concurrent_jobs: usize,

    /// How long to sleep between claim iterations
    pub claim_interval_ms: u64,

    /// Per-tile retry policy for render and store calls
    pub retry: RetryConfig,

    /// Timeout for each render attempt in milliseconds
    pub render_timeout_ms: u64,

    /// Timeout for each tile store attempt in milliseconds
    pub store_timeout_ms: u64,

    /// Edge length of rendered tiles in pixels
    pub tile_size: u32,

    /// Persist job progress every this many stored tiles (0 or 1 means
    /// after every tile)
    pub progress_flush_tiles: u64,

    /// Maximum time a running job may go without a heartbeat before a claim
    /// takes it back (requeued, or canceled if a cancel was requested).
    /// This handles daemon crashes. Must exceed the worst case time for one
    /// tile, including retries.
    pub running_timeout_ms: u64,

    /// Interval for logging daemon status (jobs in flight) in milliseconds.
    /// Set to None to disable periodic status logging
    pub status_log_interval_ms: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            claim_interval_ms: 1000,
            retry: RetryConfig::default(),
            render_timeout_ms: 30_000,
            store_timeout_ms: 30_000,
            tile_size: 256,
            progress_flush_tiles: 1,
            running_timeout_ms: 600_000,
            status_log_interval_ms: Some(2000),
        }
    }
}

impl DaemonConfig {
    /// Longest one tile can take: every render and store attempt timing out,
    /// plus the backoff between attempts.
    pub fn worst_case_tile_ms(&self) -> u64 {
        let attempts = self.retry.max_attempts.max(1);
        let backoff: u64 = (0..attempts - 1)
            .map(|retry| self.retry.backoff(retry).as_millis() as u64)
            .sum();
        let per_step = |timeout_ms: u64| {
            timeout_ms
                .saturating_mul(attempts as u64)
                .saturating_add(backoff)
        };
        per_step(self.render_timeout_ms).saturating_add(per_step(self.store_timeout_ms))
    }
}

/// Counters since the daemon was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStats {
    pub jobs_in_flight: usize,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_canceled: u64,
}

/// Daemon that renders tile jobs.
///
/// The daemon repeatedly claims the best queued job (highest priority, then
/// oldest) while a worker permit is free and renders it on its own task.
/// Jobs can also be driven one at a time with [`TileDaemon::advance`].
pub struct TileDaemon<S, R, T>
where
    S: Storage,
    R: TileRenderer,
    T: TileStore,
{
    worker_id: WorkerId,
    storage: Arc<S>,
    renderer: Arc<R>,
    tile_store: Arc<T>,
    config: DaemonConfig,
    jobs_in_flight: Arc<AtomicUsize>,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_canceled: AtomicU64,
    shutdown_token: CancellationToken,
}

impl<S, R, T> TileDaemon<S, R, T>
where
    S: Storage + 'static,
    R: TileRenderer + 'static,
    T: TileStore + 'static,
{
    pub fn new(
        storage: Arc<S>,
        renderer: Arc<R>,
        tile_store: Arc<T>,
        config: DaemonConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            worker_id: WorkerId::new(),
            storage,
            renderer,
            tile_store,
            config,
            jobs_in_flight: Arc::new(AtomicUsize::new(0)),
            jobs_succeeded: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_canceled: AtomicU64::new(0),
            shutdown_token,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn stats(&self) -> DaemonStats {
        DaemonStats {
            jobs_in_flight: self.jobs_in_flight.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_canceled: self.jobs_canceled.load(Ordering::Relaxed),
        }
    }

    /// Run the daemon loop until the shutdown token fires.
    ///
    /// On shutdown no new jobs are claimed; running jobs stop before their
    /// next tile and are failed with a retriable reason, and the loop waits
    /// for them before returning. A retry of such a job skips the zoom
    /// levels it completed.
    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        tracing::info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            running_timeout_ms = self.config.running_timeout_ms,
            "Tile daemon starting main processing loop"
        );
        let worst_case_tile_ms = self.config.worst_case_tile_ms();
        if self.config.running_timeout_ms <= worst_case_tile_ms {
            tracing::warn!(
                running_timeout_ms = self.config.running_timeout_ms,
                worst_case_tile_ms,
                "Running timeout is shorter than one slow tile; live jobs may be taken back"
            );
        }
        let lease = Duration::from_millis(self.config.running_timeout_ms);

        if let Some(interval_ms) = self.config.status_log_interval_ms {
            let jobs_in_flight = self.jobs_in_flight.clone();
            let worker_id = self.worker_id;
            let shutdown_token = self.shutdown_token.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            tracing::debug!(
                                worker_id = %worker_id,
                                jobs_in_flight = jobs_in_flight.load(Ordering::Relaxed),
                                "Daemon status"
                            );
                        }
                        _ = shutdown_token.cancelled() => break,
                    }
                }
            });
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_jobs.max(1)));
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();

        loop {
            if self.shutdown_token.is_cancelled() {
                tracing::info!("Shutdown signal received, stopping daemon");
                break;
            }

            while let Some(result) = join_set.try_join_next() {
                log_task_result(result);
            }

            tracing::trace!("Sleeping before claiming");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.claim_interval_ms)) => {},
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping daemon");
                    break;
                }
            }

            // Claim until the queue is empty or every permit is taken.
            loop {
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    tracing::trace!("No free worker permits");
                    break;
                };
                let job = match self.storage.claim_next_job(self.worker_id, lease).await {
                    Ok(Some(job)) => job,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to claim tile job");
                        break;
                    }
                };

                let job_id = job.data.id;
                tracing::debug!(
                    job_id = %job_id,
                    document_id = %job.data.document_id,
                    priority = job.data.priority,
                    "Claimed tile job, spawning processing task"
                );

                let daemon = self.clone();
                daemon.jobs_in_flight.fetch_add(1, Ordering::Relaxed);
                join_set.spawn(async move {
                    let _permit = permit;
                    let jobs_in_flight = daemon.jobs_in_flight.clone();
                    let _guard = scopeguard::guard((), |_| {
                        jobs_in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    if let Err(e) = daemon.process(job).await {
                        tracing::error!(job_id = %job_id, error = %e, "Unexpected error processing tile job");
                        daemon.fail_orphaned(job_id, &e).await;
                        return Err(e);
                    }
                    Ok(())
                });
            }
        }

        tracing::info!(jobs_in_flight = join_set.len(), "Waiting for running jobs to stop");
        while let Some(result) = join_set.join_next().await {
            log_task_result(result);
        }
        Ok(())
    }

    /// Start a specific queued job and render it to completion on the
    /// current task. Returns the job in its final state.
    #[tracing::instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn advance(&self, job_id: TileJobId) -> Result<AnyTileJob> {
        let job = self.storage.start_job(job_id, self.worker_id).await?;
        tracing::info!(job_id = %job_id, "Tile job started");
        match self.process(job).await {
            Ok(job) => Ok(job),
            Err(e) => {
                self.fail_orphaned(job_id, &e).await;
                Err(e)
            }
        }
    }

    /// Render every tile of a running job, zoom level by zoom level.
    ///
    /// Zoom levels completed by an earlier attempt against the same active
    /// fit are skipped.
    #[tracing::instrument(
        skip(self, job),
        fields(job_id = %job.data.id, document_id = %job.data.document_id)
    )]
    async fn process(&self, mut job: TileJob<Running>) -> Result<AnyTileJob> {
        let active = match self.storage.get_document(job.data.document_id).await {
            Ok(document) => document.active,
            Err(GeoreferenceError::DocumentNotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let Some(active) = active else {
            tracing::warn!("Document has no active transform, failing tile job");
            return self
                .finish_failed(job, FailureReason::DocumentNotGeoreferenced)
                .await;
        };

        let document_id = job.data.document_id;
        let fit_id = active.fit_id;
        let transform = Arc::new(active.transform);
        let bounds = active.bounds;
        let retry = RetryConfig::from(&self.config);
        let render_timeout = Duration::from_millis(self.config.render_timeout_ms);
        let store_timeout = Duration::from_millis(self.config.store_timeout_ms);
        let flush_every = self.config.progress_flush_tiles.max(1);
        let heartbeat_every = chrono::Duration::milliseconds((self.config.running_timeout_ms / 2) as i64);

        // The active fit may have changed since submission, so the total is
        // recomputed and earlier progress only counts for the same fit.
        let zoom_levels = job.data.zoom_levels.clone();
        let previous = std::mem::take(&mut job.data.progress);
        let completed: Vec<u8> = if previous.rendered_with == Some(fit_id) {
            previous
                .zooms_completed
                .into_iter()
                .filter(|z| zoom_levels.contains(z))
                .collect()
        } else {
            Vec::new()
        };
        job.data.progress = StepProgress {
            tiles_done: completed
                .iter()
                .map(|&z| tiles::tiles_for_bounds(&bounds, z).count())
                .sum(),
            zooms_completed: completed,
            rendered_with: Some(fit_id),
            ..StepProgress::new(tiles::estimate_tile_count(&bounds, &zoom_levels))
        };
        if !job.data.progress.zooms_completed.is_empty() {
            tracing::info!(
                zooms_completed = ?job.data.progress.zooms_completed,
                tiles_done = job.data.progress.tiles_done,
                "Resuming tile job after completed zoom levels"
            );
        }
        job.record_progress(self.storage.as_ref()).await?;

        for z in zoom_levels {
            if job.data.progress.zooms_completed.contains(&z) {
                continue;
            }
            job.data.progress.current_zoom = Some(z);
            let range = tiles::tiles_for_bounds(&bounds, z);
            tracing::debug!(zoom = z, tiles = range.count(), "Rendering zoom level");

            for tile in range.iter() {
                if self.storage.is_cancel_requested(job.data.id).await? {
                    tracing::info!(
                        tiles_done = job.data.progress.tiles_done,
                        "Cancellation requested, stopping before next tile"
                    );
                    let canceled = job.cancel(self.storage.as_ref()).await?;
                    self.jobs_canceled.fetch_add(1, Ordering::Relaxed);
                    return Ok(canceled.into());
                }
                if self.shutdown_token.is_cancelled() {
                    return self
                        .finish_failed(
                            job,
                            FailureReason::WorkerTerminated {
                                error: "daemon shut down".to_string(),
                            },
                        )
                        .await;
                }

                let request = RenderRequest {
                    document_id,
                    tile,
                    transform: transform.clone(),
                    tile_size: self.config.tile_size,
                };
                let request = &request;
                let image = match run_step(Step::Render, tile, &retry, render_timeout, move || {
                    self.renderer.render(request)
                })
                .await
                {
                    Ok(image) => image,
                    Err(reason) => return self.finish_failed(job, reason).await,
                };

                let image = &image;
                if let Err(reason) = run_step(Step::Store, tile, &retry, store_timeout, move || {
                    self.tile_store.put_tile(document_id, tile, image)
                })
                .await
                {
                    return self.finish_failed(job, reason).await;
                }

                job.data.progress.tiles_done += 1;
                tracing::trace!(%tile, tiles_done = job.data.progress.tiles_done, "Tile stored");
                let heartbeat_due = chrono::Utc::now() - job.state.heartbeat_at >= heartbeat_every;
                if job.data.progress.tiles_done % flush_every == 0 || heartbeat_due {
                    job.record_progress(self.storage.as_ref()).await?;
                }
            }

            job.data.progress.zooms_completed.push(z);
            job.record_progress(self.storage.as_ref()).await?;
        }

        job.data.progress.current_zoom = None;
        let tiles_done = job.data.progress.tiles_done;
        let succeeded = job.succeed(self.storage.as_ref()).await?;
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(tiles_done, "Tile job succeeded");
        Ok(succeeded.into())
    }

    async fn finish_failed(
        &self,
        job: TileJob<Running>,
        reason: FailureReason,
    ) -> Result<AnyTileJob> {
        tracing::error!(
            reason = reason.label(),
            retriable = reason.is_retriable(),
            error = %reason.to_error_message(),
            "Tile job failed"
        );
        let failed = job.fail(reason, self.storage.as_ref()).await?;
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        Ok(failed.into())
    }

    /// A job whose processing errored out (usually a storage failure) would
    /// otherwise stay running and block its document. Fail it if possible.
    async fn fail_orphaned(&self, job_id: TileJobId, error: &GeoreferenceError) {
        let job = match self.storage.get_job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not load orphaned tile job");
                return;
            }
        };
        if let Some(running) = job.into_running() {
            let reason = FailureReason::WorkerTerminated {
                error: error.to_string(),
            };
            if let Err(e) = self.finish_failed(running, reason).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark orphaned tile job as failed");
            }
        }
    }
}

fn log_task_result(result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => tracing::trace!("Task completed successfully"),
        Ok(Err(e)) => tracing::error!(error = %e, "Task failed"),
        Err(join_error) => tracing::error!(error = %join_error, "Task panicked"),
    }
}
