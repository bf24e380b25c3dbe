//! Bounded job slots for the scheduler
//!
//! The pool never queues. `submit` either takes a free slot immediately or
//! rejects the job, and the scheduler retries the camera on its next tick.
//! Each accepted job runs under a supervising task that contains panics and
//! reports exactly one [`JobCompletion`] on the completion channel.

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{CameraConfig, CameraId};
use crate::metrics::Metrics;
use crate::worker::{JobReport, JobStatus, WebcamWorker, EXIT_SKIPPED, EXIT_SUCCESS};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One dispatch of one camera
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub camera: CameraConfig,
    pub submitted_at: Instant,
}

impl Job {
    pub fn new(camera: CameraConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera,
            submitted_at: Instant::now(),
        }
    }
}

/// How a job ended, as seen by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Published, superseded, or nothing to do
    Succeeded,
    /// Lock held or breaker open
    Skipped,
    /// The worker ran and reported a failure
    Failed(String),
    /// The worker panicked or was killed
    Crashed(String),
}

/// Message sent back to the scheduler when a slot frees up
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub job_id: Uuid,
    pub camera: CameraId,
    pub status: CompletionStatus,
    /// Breaker backoff in force after the job. The scheduler never dispatches before it.
    pub backoff_until: Option<DateTime<Utc>>,
    pub duration: Duration,
}

impl JobCompletion {
    pub fn from_report(job_id: Uuid, report: JobReport) -> Self {
        let status = match &report.status {
            JobStatus::Published { .. } | JobStatus::Superseded | JobStatus::NothingPending => {
                CompletionStatus::Succeeded
            }
            JobStatus::Skipped(_) => CompletionStatus::Skipped,
            JobStatus::Failed { message, .. } => CompletionStatus::Failed(message.clone()),
        };
        Self {
            job_id,
            camera: report.camera,
            status,
            backoff_until: report.backoff_until,
            duration: report.duration,
        }
    }

    fn crashed(job_id: Uuid, camera: CameraId, reason: String, duration: Duration) -> Self {
        Self {
            job_id,
            camera,
            status: CompletionStatus::Crashed(reason),
            backoff_until: None,
            duration,
        }
    }
}

/// Runs a job to completion in some isolation boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, job: Job) -> JobCompletion;
}

/// Runs the worker inside the daemon process. Panics are caught by the pool's supervisor.
pub struct TaskLauncher {
    worker: WebcamWorker,
}

impl TaskLauncher {
    pub fn new(worker: WebcamWorker) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl JobLauncher for TaskLauncher {
    async fn launch(&self, job: Job) -> JobCompletion {
        let report = self.worker.run(&job.camera).await;
        JobCompletion::from_report(job.id, report)
    }
}

/// Runs each job as `<exe> --config <path> worker --airport A --camera N`.
///
/// The child is killed if the supervising task is dropped. Backoff is read
/// from the breaker record after the child exits.
pub struct SubprocessLauncher {
    exe: PathBuf,
    config_path: PathBuf,
    breaker: CircuitBreaker,
}

impl SubprocessLauncher {
    pub fn new(exe: PathBuf, config_path: PathBuf, breaker: CircuitBreaker) -> Self {
        Self {
            exe,
            config_path,
            breaker,
        }
    }

    pub fn current_exe(config_path: PathBuf, breaker: CircuitBreaker) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path, breaker))
    }
}

#[async_trait]
impl JobLauncher for SubprocessLauncher {
    async fn launch(&self, job: Job) -> JobCompletion {
        let started = Instant::now();
        let camera = job.camera.id.clone();

        let status = tokio::process::Command::new(&self.exe)
            .arg("--config")
            .arg(&self.config_path)
            .arg("worker")
            .arg("--airport")
            .arg(&camera.airport)
            .arg("--camera")
            .arg(camera.index.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                error!(camera = %camera, error = %e, "Failed to spawn worker process");
                return JobCompletion::crashed(job.id, camera, format!("spawn failed: {e}"), started.elapsed());
            }
        };

        let status = match status.code() {
            Some(EXIT_SUCCESS) => CompletionStatus::Succeeded,
            Some(EXIT_SKIPPED) => CompletionStatus::Skipped,
            Some(code) => CompletionStatus::Failed(format!("worker exited with code {code}")),
            None => {
                use std::os::unix::process::ExitStatusExt;
                let signal = status.signal().unwrap_or_default();
                CompletionStatus::Crashed(format!("worker killed by signal {signal}"))
            }
        };

        let backoff_until = match self.breaker.load(&camera).await {
            Ok(state) if state.state(Utc::now()) == CircuitState::Open => state.backoff_until_time(),
            Ok(_) => None,
            Err(e) => {
                warn!(camera = %camera, error = %e, "Could not read breaker after worker exit");
                None
            }
        };

        JobCompletion {
            job_id: job.id,
            camera,
            status,
            backoff_until,
            duration: started.elapsed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// No free slot, or the pool is shutting down. Not an error.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub camera: CameraId,
    pub started_at: Instant,
    abort: AbortHandle,
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    submitted: AtomicUsize,
    rejected: AtomicUsize,
    succeeded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    crashed: AtomicUsize,
}

pub struct ProcessPool {
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    launcher: Arc<dyn JobLauncher>,
    completions: mpsc::UnboundedSender<JobCompletion>,
    active: Arc<DashMap<Uuid, ActiveJob>>,
    counters: Arc<PoolCounters>,
    metrics: Arc<Metrics>,
    is_shutting_down: Arc<AtomicBool>,
}

impl ProcessPool {
    pub fn new(
        max_workers: usize,
        launcher: Arc<dyn JobLauncher>,
        completions: mpsc::UnboundedSender<JobCompletion>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let max_workers = max_workers.max(1);
        info!("Process pool ready with {} slots", max_workers);
        Self {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            launcher,
            completions,
            active: Arc::new(DashMap::new()),
            counters: Arc::new(PoolCounters::default()),
            metrics,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the job in a free slot, or reject it. Never waits.
    pub fn submit(&self, job: Job) -> SubmitOutcome {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return SubmitOutcome::Rejected;
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_pool_rejected();
                debug!(camera = %job.camera.id, "Pool saturated, job rejected");
                return SubmitOutcome::Rejected;
            }
        };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let job_id = job.id;
        let camera = job.camera.id.clone();
        let launcher = self.launcher.clone();
        let active = self.active.clone();
        let counters = self.counters.clone();
        let metrics = self.metrics.clone();
        let completions = self.completions.clone();
        let supervised_camera = camera.clone();

        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();

        let supervisor = tokio::spawn(async move {
            let started = Instant::now();
            let run = tokio::spawn(async move { launcher.launch(job).await });
            let _guard = AbortOnDrop(run.abort_handle());

            let completion = match run.await {
                Ok(completion) => completion,
                Err(e) => {
                    error!(camera = %supervised_camera, error = %e, "Worker crashed");
                    JobCompletion::crashed(job_id, supervised_camera, e.to_string(), started.elapsed())
                }
            };

            match &completion.status {
                CompletionStatus::Succeeded => counters.succeeded.fetch_add(1, Ordering::Relaxed),
                CompletionStatus::Skipped => counters.skipped.fetch_add(1, Ordering::Relaxed),
                CompletionStatus::Failed(_) => counters.failed.fetch_add(1, Ordering::Relaxed),
                CompletionStatus::Crashed(_) => {
                    metrics.record_job("crashed", completion.duration);
                    counters.crashed.fetch_add(1, Ordering::Relaxed)
                }
            };

            // the active entry is inserted after spawn
            let _ = registered_rx.await;
            active.remove(&job_id);
            metrics.set_pool_active(active.len());
            drop(permit);

            if completions.send(completion).is_err() {
                debug!("Completion receiver dropped");
            }
        });

        self.active.insert(
            job_id,
            ActiveJob {
                camera,
                started_at: Instant::now(),
                abort: supervisor.abort_handle(),
            },
        );
        self.metrics.set_pool_active(self.active.len());
        let _ = registered_tx.send(());

        SubmitOutcome::Accepted
    }

    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn get_stats(&self) -> PoolStats {
        PoolStats {
            max_workers: self.max_workers,
            active: self.active.len(),
            available: self.semaphore.available_permits(),
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            crashed: self.counters.crashed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs and wait up to `grace` for running ones. Stragglers are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        info!("Shutting down process pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        let deadline = Instant::now() + grace;
        while !self.active.is_empty() && Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }

        let stragglers = self.active_jobs();
        for job in &stragglers {
            warn!(camera = %job.camera, running_for = ?job.started_at.elapsed(), "Aborting job at shutdown");
            job.abort.abort();
        }
        self.active.clear();

        info!(aborted = stragglers.len(), "Process pool shutdown complete");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub max_workers: usize,
    pub active: usize,
    pub available: usize,
    pub submitted: usize,
    pub rejected: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub crashed: usize,
}

impl PoolStats {
    pub fn utilization(&self) -> f64 {
        if self.max_workers == 0 {
            0.0
        } else {
            self.active as f64 / self.max_workers as f64
        }
    }
}
