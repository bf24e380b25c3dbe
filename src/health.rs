use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::{CameraConfig, CameraId, Config};
use crate::metrics::{memory_usage, HealthLevel, HealthStatus, HealthThresholds, Metrics};
use crate::process_pool::ProcessPool;
use crate::publisher::{CacheReader, Freshness};
use crate::scheduler::SchedulerStats;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Breaker and cache view of one camera.
#[derive(Debug, Clone)]
pub struct CameraStatus {
    pub camera: CameraId,
    pub name: String,
    pub push: bool,
    pub breaker: CircuitState,
    pub failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    /// `None` when nothing servable is published.
    pub freshness: Option<Freshness>,
}

pub struct SystemHealthChecker {
    /// Latest camera list; follows config reloads when wired to the watcher.
    cameras: watch::Receiver<Vec<CameraConfig>>,
    breaker: CircuitBreaker,
    reader: CacheReader,
    pool: Option<Arc<ProcessPool>>,
    scheduler: Option<Arc<SchedulerStats>>,
    thresholds: HealthThresholds,
    last_rejected: usize,
    last_check: Option<Instant>,
}

impl SystemHealthChecker {
    pub fn new(config: &Config) -> Self {
        Self {
            cameras: watch::channel(config.cameras()).1,
            breaker: CircuitBreaker::new(&config.paths.state_dir, &config.breaker),
            reader: CacheReader::new(&config.paths.cache_root, config.max_staleness()),
            pool: None,
            scheduler: None,
            thresholds: HealthThresholds::default(),
            last_rejected: 0,
            last_check: None,
        }
    }

    pub fn with_camera_updates(mut self, cameras: watch::Receiver<Vec<CameraConfig>>) -> Self {
        self.cameras = cameras;
        self
    }

    pub fn with_pool(mut self, pool: Arc<ProcessPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_scheduler(mut self, stats: Arc<SchedulerStats>) -> Self {
        self.scheduler = Some(stats);
        self
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn camera_statuses(&self, now: DateTime<Utc>) -> Vec<CameraStatus> {
        let cameras = self.cameras.borrow().clone();
        let mut statuses = Vec::with_capacity(cameras.len());

        for camera in &cameras {
            let state = match self.breaker.load(&camera.id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(camera = %camera.id, error = %e, "Could not read breaker state");
                    Default::default()
                }
            };
            let (captured_at, freshness) = match self.reader.manifest(&camera.id) {
                Ok(manifest) => (
                    Some(manifest.captured_at),
                    self.reader.freshness(manifest.captured_at, camera.refresh, now),
                ),
                Err(_) => (None, None),
            };

            statuses.push(CameraStatus {
                camera: camera.id.clone(),
                name: camera.name.clone(),
                push: camera.is_push(),
                breaker: state.state(now),
                failures: state.failures,
                backoff_until: state.backoff_until_time(),
                last_error: state.last_error,
                captured_at,
                freshness,
            });
        }

        statuses
    }

    pub async fn check_system_health(&mut self) -> HealthStatus {
        let start_time = Instant::now();
        let now = Utc::now();

        let statuses = self.camera_statuses(now).await;
        let open_breakers = statuses
            .iter()
            .filter(|s| s.breaker == CircuitState::Open)
            .count();
        let stale_cameras = statuses.iter().filter(|s| s.freshness.is_none()).count();

        let breakers = self.share_level(
            open_breakers,
            statuses.len(),
            self.thresholds.breaker_open_warning,
            self.thresholds.breaker_open_critical,
        );
        let freshness = self.share_level(
            stale_cameras,
            statuses.len(),
            self.thresholds.stale_warning,
            self.thresholds.stale_critical,
        );
        let pool = self.check_pool_health();
        let scheduler = self.check_scheduler_health();
        let resources = self.check_resource_health();

        let overall = HealthLevel::worst(&[pool, breakers, freshness, scheduler, resources]);
        self.last_check = Some(start_time);

        info!(
            "Health check completed in {:?}: {:?}",
            start_time.elapsed(),
            overall
        );

        HealthStatus {
            overall,
            pool,
            breakers,
            freshness,
            scheduler,
            resources,
            cameras: statuses.len(),
            open_breakers,
            stale_cameras,
            timestamp: now,
        }
    }

    fn share_level(&self, count: usize, total: usize, warning: f64, critical: f64) -> HealthLevel {
        if total == 0 {
            return HealthLevel::Healthy;
        }
        let share = count as f64 / total as f64;
        if share >= critical {
            HealthLevel::Critical
        } else if share >= warning {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn check_pool_health(&mut self) -> HealthLevel {
        let Some(pool) = &self.pool else {
            return HealthLevel::Healthy;
        };
        let stats = pool.get_stats();
        let new_rejections = stats.rejected.saturating_sub(self.last_rejected);
        self.last_rejected = stats.rejected;

        if stats.available == 0 && new_rejections > 0 {
            warn!(
                "Process pool saturated: {} rejections since last check",
                new_rejections
            );
            return HealthLevel::Critical;
        }
        if stats.utilization() > self.thresholds.pool_saturation_warning {
            warn!("Process pool high utilization: {:.2}%", stats.utilization() * 100.0);
            return HealthLevel::Warning;
        }
        HealthLevel::Healthy
    }

    fn check_scheduler_health(&self) -> HealthLevel {
        let Some(stats) = &self.scheduler else {
            return HealthLevel::Healthy;
        };
        let lag = stats.snapshot().lag;
        if lag >= self.thresholds.scheduler_lag_critical {
            error!("Scheduler lag critical: {:?}", lag);
            HealthLevel::Critical
        } else if lag >= self.thresholds.scheduler_lag_warning {
            warn!("Scheduler lag warning: {:?}", lag);
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }

    fn check_resource_health(&self) -> HealthLevel {
        match memory_usage() {
            Some(bytes) if bytes > self.thresholds.max_memory_usage => {
                error!("Resource health critical: memory usage {} MB", bytes / 1024 / 1024);
                HealthLevel::Critical
            }
            Some(bytes) if bytes > self.thresholds.max_memory_usage * 8 / 10 => {
                warn!("Resource health warning: memory usage {} MB", bytes / 1024 / 1024);
                HealthLevel::Warning
            }
            _ => HealthLevel::Healthy,
        }
    }

    pub async fn start_periodic_health_checks(&mut self, interval_duration: Duration, metrics: Arc<Metrics>) {
        let mut interval_timer = interval(interval_duration);

        loop {
            interval_timer.tick().await;
            let health_status = self.check_system_health().await;
            metrics.set_breaker_open(health_status.open_breakers);

            match health_status.overall {
                HealthLevel::Healthy => info!("System health: OK"),
                HealthLevel::Warning => warn!(
                    "System health: WARNING - pool: {:?}, breakers: {:?}, freshness: {:?}, scheduler: {:?}",
                    health_status.pool, health_status.breakers, health_status.freshness, health_status.scheduler
                ),
                HealthLevel::Critical => error!(
                    "System health: CRITICAL - pool: {:?}, breakers: {:?}, freshness: {:?}, scheduler: {:?}",
                    health_status.pool, health_status.breakers, health_status.freshness, health_status.scheduler
                ),
            }
        }
    }
}
