use crate::acquisition::push::BatchStats;
use crate::acquisition::{AcquiredImage, AcquisitionStrategy, PullSource, PushSource};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{CameraConfig, CameraId, Config};
use crate::error::{ErrorClass, IngestError};
use crate::lock_manager::{LockManager, WorkerLock};
use crate::metrics::Metrics;
use crate::pipeline::ProcessingPipeline;
use crate::publisher::{PublishOutcome, Publisher};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Exit codes of the `worker` subcommand.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_SKIPPED: i32 = 3;

/// Shared collaborators for running jobs.
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub breaker: CircuitBreaker,
    pub locks: LockManager,
    pub publisher: Publisher,
    pub pipeline: Arc<ProcessingPipeline>,
    pub metrics: Arc<Metrics>,
}

impl WorkerContext {
    pub fn from_config(config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self {
            breaker: CircuitBreaker::new(&config.paths.state_dir, &config.breaker),
            locks: LockManager::new(&config.paths.state_dir),
            publisher: Publisher::new(&config.paths.cache_root, config.pipeline.keep_generations),
            pipeline: Arc::new(ProcessingPipeline::new(config.pipeline.clone())),
            metrics,
            config,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    LockHeld,
    BreakerOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// At least one new generation went live.
    Published { generations: usize },
    /// Processed fine, but the live image was already newer.
    Superseded,
    /// Push camera with no eligible uploads.
    NothingPending,
    Skipped(SkipReason),
    Failed { class: ErrorClass, message: String },
}

impl JobStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            JobStatus::Published { .. } | JobStatus::Superseded => EXIT_SUCCESS,
            JobStatus::NothingPending | JobStatus::Skipped(_) => EXIT_SKIPPED,
            JobStatus::Failed { .. } => EXIT_FAILURE,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Published { .. } => "published",
            JobStatus::Superseded => "superseded",
            JobStatus::NothingPending => "nothing_pending",
            JobStatus::Skipped(_) => "skipped",
            JobStatus::Failed { .. } => "failed",
        }
    }

    fn failed(error: &IngestError) -> Self {
        JobStatus::Failed {
            class: error.class(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub camera: CameraId,
    pub status: JobStatus,
    pub duration: Duration,
    /// Breaker backoff in force after this job, if any.
    pub backoff_until: Option<DateTime<Utc>>,
    pub push: Option<BatchStats>,
}

enum Delivery {
    Published(usize),
    Superseded,
    NothingPending,
}

/// Runs single acquisition jobs.
///
/// Never returns an error: every failure ends up classified in the
/// [`JobReport`].
pub struct WebcamWorker {
    ctx: Arc<WorkerContext>,
    active_jobs: Arc<AtomicUsize>,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    skipped_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl WebcamWorker {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self {
            ctx,
            active_jobs: Arc::new(AtomicUsize::new(0)),
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            skipped_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    pub async fn run(&self, camera: &CameraConfig) -> JobReport {
        let started = Instant::now();
        self.active_jobs.fetch_add(1, Ordering::Relaxed);
        self.is_running.store(true, Ordering::Relaxed);

        let (status, push) = self.execute(camera).await;
        let backoff_until = match &status {
            JobStatus::Failed { .. } | JobStatus::Skipped(SkipReason::BreakerOpen) => self
                .ctx
                .breaker
                .load(&camera.id)
                .await
                .ok()
                .and_then(|state| state.backoff_until_time()),
            _ => None,
        };

        let duration = started.elapsed();
        match &status {
            JobStatus::Published { .. } | JobStatus::Superseded | JobStatus::NothingPending => {
                self.processed_count.fetch_add(1, Ordering::Relaxed);
                debug!(camera = %camera.id, status = status.label(), duration_ms = duration.as_millis() as u64, "Job finished");
            }
            JobStatus::Skipped(reason) => {
                self.skipped_count.fetch_add(1, Ordering::Relaxed);
                debug!(camera = %camera.id, reason = ?reason, "Job skipped");
            }
            JobStatus::Failed { class, message } => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(camera = %camera.id, class = ?class, error = %message, "Job failed");
            }
        }
        self.ctx.metrics.record_job(status.label(), duration);

        if self.active_jobs.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.is_running.store(false, Ordering::Relaxed);
        }

        JobReport {
            camera: camera.id.clone(),
            status,
            duration,
            backoff_until,
            push,
        }
    }

    async fn execute(&self, camera: &CameraConfig) -> (JobStatus, Option<BatchStats>) {
        let id = &camera.id;

        match self.ctx.breaker.load(id).await {
            Ok(state) if state.state(Utc::now()) == CircuitState::Open => {
                debug!(camera = %id, until = ?state.backoff_until_time(), "Breaker open, skipping");
                return (JobStatus::Skipped(SkipReason::BreakerOpen), None);
            }
            Ok(_) => {}
            Err(e) => return (JobStatus::failed(&e), None),
        }

        // shared with blocking work so an aborted job keeps the camera locked
        // until its publish has finished
        let lock = Arc::new(match self.ctx.locks.try_acquire(id) {
            Ok(lock) => lock,
            Err(IngestError::LockHeld(_)) => {
                return (JobStatus::Skipped(SkipReason::LockHeld), None);
            }
            Err(e) => return (JobStatus::failed(&e), None),
        });

        // with the lock held, any temp publication belongs to a dead worker
        if let Err(e) = self.ctx.publisher.cleanup_temp(id, Duration::ZERO) {
            warn!(camera = %id, error = %e, "Publication temp cleanup failed");
        }

        let strategy = match AcquisitionStrategy::for_camera(camera, &self.ctx.config) {
            Ok(strategy) => strategy,
            Err(e) => {
                self.record_outcome(id, Err(&e)).await;
                return (JobStatus::failed(&e), None);
            }
        };

        let (result, push) = match strategy {
            AcquisitionStrategy::Pull(source) => (self.run_pull(camera, &source, &lock).await, None),
            AcquisitionStrategy::Push(source) => {
                let (result, stats) = self.run_push(camera, &source, &lock).await;
                (result, Some(stats))
            }
        };

        let status = match &result {
            Ok(Delivery::Published(generations)) => JobStatus::Published {
                generations: *generations,
            },
            Ok(Delivery::Superseded) => JobStatus::Superseded,
            Ok(Delivery::NothingPending) => JobStatus::NothingPending,
            Err(e) => JobStatus::failed(e),
        };

        match &result {
            Ok(Delivery::NothingPending) => {}
            Ok(_) => self.record_outcome(id, Ok(())).await,
            Err(e) => self.record_outcome(id, Err(e)).await,
        }

        (status, push)
    }

    async fn run_pull(
        &self,
        camera: &CameraConfig,
        source: &PullSource,
        lock: &Arc<WorkerLock>,
    ) -> Result<Delivery, IngestError> {
        let started = Instant::now();
        let acquired = source.acquire().await?;
        self.ctx.metrics.record_acquire(started.elapsed());

        match self.process_and_publish(camera, acquired, lock).await? {
            PublishOutcome::Published { .. } => Ok(Delivery::Published(1)),
            PublishOutcome::Superseded { .. } => Ok(Delivery::Superseded),
        }
    }

    async fn run_push(
        &self,
        camera: &CameraConfig,
        source: &PushSource,
        lock: &Arc<WorkerLock>,
    ) -> (Result<Delivery, IngestError>, BatchStats) {
        let id = &camera.id;

        match source.cleanup_orphans().await {
            Ok(report) if report.released + report.expired > 0 => {
                info!(camera = %id, released = report.released, expired = report.expired, "Cleaned up orphaned claims");
            }
            Ok(_) => {}
            Err(e) => warn!(camera = %id, error = %e, "Orphan cleanup failed"),
        }

        let mut batch = match source.begin_batch().await {
            Ok(batch) => batch,
            Err(e) => return (Err(e), BatchStats::default()),
        };

        let mut published = 0;
        let mut superseded = 0;
        let mut last_rejection: Option<IngestError> = None;
        let mut infrastructure: Option<IngestError> = None;

        loop {
            let upload = match batch.acquire().await {
                Ok(Some(upload)) => upload,
                Ok(None) => break,
                Err(e) => {
                    infrastructure = Some(e);
                    break;
                }
            };

            let name = upload.original_name.clone();
            match self.process_and_publish(camera, upload.image.clone(), lock).await {
                Ok(outcome) => {
                    match outcome {
                        PublishOutcome::Published { .. } => published += 1,
                        PublishOutcome::Superseded { .. } => superseded += 1,
                    }
                    if let Err(e) = batch.finish(upload).await {
                        warn!(camera = %id, file = %name, error = %e, "Failed to remove processed upload");
                    }
                }
                Err(e) if e.class() == ErrorClass::Infrastructure => {
                    error!(camera = %id, file = %name, error = %e, "Local failure processing upload, releasing it");
                    if let Err(release_err) = batch.release(upload).await {
                        warn!(camera = %id, file = %name, error = %release_err, "Failed to release upload");
                    }
                    infrastructure = Some(e);
                    break;
                }
                Err(e) => {
                    if let Err(reject_err) = batch.reject(upload, &e).await {
                        warn!(camera = %id, file = %name, error = %reject_err, "Failed to quarantine upload");
                    }
                    last_rejection = Some(e);
                }
            }
        }

        let stats = batch.stats().clone();
        self.ctx
            .metrics
            .record_push_batch(stats.claimed, stats.rejected, batch.deferred());
        if batch.deferred() > 0 {
            info!(camera = %id, deferred = batch.deferred(), "Uploads deferred to the next run");
        }

        let result = if published > 0 {
            Ok(Delivery::Published(published))
        } else if let Some(e) = infrastructure {
            Err(e)
        } else if superseded > 0 {
            Ok(Delivery::Superseded)
        } else if let Some(e) = last_rejection {
            Err(e)
        } else {
            Ok(Delivery::NothingPending)
        };
        (result, stats)
    }

    /// Decode, transcode and publish on the blocking pool.
    async fn process_and_publish(
        &self,
        camera: &CameraConfig,
        acquired: AcquiredImage,
        lock: &Arc<WorkerLock>,
    ) -> Result<PublishOutcome, IngestError> {
        let pipeline = self.ctx.pipeline.clone();
        let publisher = self.ctx.publisher.clone();
        let id = camera.id.clone();
        let timezone = camera.timezone_offset_minutes;

        let started = Instant::now();
        let (processed, outcome) = run_blocking_locked(lock, move || {
            let processed = pipeline.process(&acquired, timezone, Utc::now())?;
            let outcome = publisher.publish(&id, &processed)?;
            Ok((processed, outcome))
        })
        .await?;

        self.ctx.metrics.record_pipeline(started.elapsed());
        if processed.clock_drift_flagged {
            self.ctx.metrics.record_clock_drift();
        }
        Ok(outcome)
    }

    async fn record_outcome(&self, camera: &CameraId, result: Result<(), &IngestError>) {
        let recorded = match result {
            Ok(()) => self.ctx.breaker.record_success(camera).await.map(|_| ()),
            Err(e) => self.ctx.breaker.record_failure(camera, e, Utc::now()).await.map(|_| ()),
        };
        if let Err(e) = recorded {
            error!(camera = %camera, error = %e, "Failed to persist breaker state");
        }
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            is_running: self.is_running.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            skipped_count: self.skipped_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// Run `work` on the blocking pool holding its own handle on the camera lock.
/// The lock is released only once `work` returns, even if the awaiting task
/// was aborted first.
pub(crate) async fn run_blocking_locked<T, F>(lock: &Arc<WorkerLock>, work: F) -> Result<T, IngestError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, IngestError> + Send + 'static,
{
    let lock = lock.clone();
    tokio::task::spawn_blocking(move || {
        let result = work();
        drop(lock);
        result
    })
    .await?
}

impl Clone for WebcamWorker {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            active_jobs: self.active_jobs.clone(),
            is_running: self.is_running.clone(),
            processed_count: self.processed_count.clone(),
            skipped_count: self.skipped_count.clone(),
            error_count: self.error_count.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub is_running: bool,
    pub active_jobs: usize,
    pub processed_count: usize,
    pub skipped_count: usize,
    pub error_count: usize,
}
