use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Metric handles for the ingestion system.
///
/// Handles resolve against whatever recorder is installed when `Metrics::new`
/// runs. Without a recorder they are no-ops, which is what tests and one-shot
/// worker processes get.
pub struct Metrics {
    pub jobs_published: Counter,
    pub jobs_superseded: Counter,
    pub jobs_nothing_pending: Counter,
    pub jobs_skipped: Counter,
    pub jobs_failed: Counter,
    pub jobs_crashed: Counter,
    pub acquire_duration: Histogram,
    pub pipeline_duration: Histogram,
    pub job_duration: Histogram,
    pub pool_active: Gauge,
    pub pool_rejected: Counter,
    pub breaker_open: Gauge,
    pub clock_drift_flagged: Counter,
    pub push_files_claimed: Counter,
    pub push_files_rejected: Counter,
    pub push_files_deferred: Counter,
    pub memory_usage: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            jobs_published: counter!("webcam_jobs_total", "outcome" => "published"),
            jobs_superseded: counter!("webcam_jobs_total", "outcome" => "superseded"),
            jobs_nothing_pending: counter!("webcam_jobs_total", "outcome" => "nothing_pending"),
            jobs_skipped: counter!("webcam_jobs_total", "outcome" => "skipped"),
            jobs_failed: counter!("webcam_jobs_total", "outcome" => "failed"),
            jobs_crashed: counter!("webcam_jobs_total", "outcome" => "crashed"),
            acquire_duration: histogram!("webcam_acquire_seconds"),
            pipeline_duration: histogram!("webcam_pipeline_seconds"),
            job_duration: histogram!("webcam_job_seconds"),
            pool_active: gauge!("webcam_pool_active"),
            pool_rejected: counter!("webcam_pool_rejected_total"),
            breaker_open: gauge!("webcam_breaker_open"),
            clock_drift_flagged: counter!("webcam_clock_drift_flagged_total"),
            push_files_claimed: counter!("webcam_push_files_total", "outcome" => "claimed"),
            push_files_rejected: counter!("webcam_push_files_total", "outcome" => "rejected"),
            push_files_deferred: counter!("webcam_push_files_total", "outcome" => "deferred"),
            memory_usage: gauge!("webcam_process_memory_bytes"),
        }
    }

    pub fn record_job(&self, outcome: &str, duration: Duration) {
        match outcome {
            "published" => self.jobs_published.increment(1),
            "superseded" => self.jobs_superseded.increment(1),
            "nothing_pending" => self.jobs_nothing_pending.increment(1),
            "skipped" => self.jobs_skipped.increment(1),
            "crashed" => self.jobs_crashed.increment(1),
            _ => self.jobs_failed.increment(1),
        }
        self.job_duration.record(duration.as_secs_f64());
    }

    pub fn record_acquire(&self, duration: Duration) {
        self.acquire_duration.record(duration.as_secs_f64());
    }

    pub fn record_pipeline(&self, duration: Duration) {
        self.pipeline_duration.record(duration.as_secs_f64());
    }

    pub fn record_clock_drift(&self) {
        self.clock_drift_flagged.increment(1);
    }

    pub fn record_push_batch(&self, claimed: usize, rejected: usize, deferred: usize) {
        self.push_files_claimed.increment(claimed as u64);
        self.push_files_rejected.increment(rejected as u64);
        self.push_files_deferred.increment(deferred as u64);
    }

    pub fn record_pool_rejected(&self) {
        self.pool_rejected.increment(1);
    }

    pub fn set_pool_active(&self, active: usize) {
        self.pool_active.set(active as f64);
    }

    pub fn set_breaker_open(&self, open: usize) {
        self.breaker_open.set(open as f64);
    }

    pub fn record_memory_usage(&self, bytes: usize) {
        self.memory_usage.set(bytes as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Samples process-level gauges on an interval.
pub struct MetricsCollector {
    metrics: Arc<Metrics>,
    start_time: Instant,
    collection_interval: Duration,
}

impl MetricsCollector {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            metrics,
            start_time: Instant::now(),
            collection_interval: Duration::from_secs(10),
        }
    }

    pub fn start_collection(&self) -> tokio::task::JoinHandle<()> {
        let metrics = self.metrics.clone();
        let interval = self.collection_interval;

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            loop {
                interval_timer.tick().await;
                if let Some(memory) = memory_usage() {
                    metrics.record_memory_usage(memory);
                }
                debug!("Metrics collection completed");
            }
        })
    }

    pub fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Resident set size of this process (Linux only).
pub fn memory_usage() -> Option<usize> {
    let content = std::fs::read_to_string("/proc/self/status").ok()?;
    content
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<usize>().ok())
        .map(|kb| kb * 1024)
}

pub struct PrometheusExporter {
    port: u16,
}

impl PrometheusExporter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    /// Install the global recorder and serve `/metrics`. Must run inside a tokio runtime.
    pub fn start(&self) -> anyhow::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()?;

        info!("Prometheus metrics listening on {}", addr);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Pool utilization above this is a warning; a full pool with rejections is critical.
    pub pool_saturation_warning: f64,
    /// Share of cameras in backoff.
    pub breaker_open_warning: f64,
    pub breaker_open_critical: f64,
    /// Share of cameras whose published image is past max staleness.
    pub stale_warning: f64,
    pub stale_critical: f64,
    /// How far the oldest due camera may lag behind the clock.
    pub scheduler_lag_warning: Duration,
    pub scheduler_lag_critical: Duration,
    pub max_memory_usage: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            pool_saturation_warning: 0.9,
            breaker_open_warning: 0.25,
            breaker_open_critical: 0.5,
            stale_warning: 0.1,
            stale_critical: 0.5,
            scheduler_lag_warning: Duration::from_secs(30),
            scheduler_lag_critical: Duration::from_secs(300),
            max_memory_usage: 1024 * 1024 * 1024, // 1GB
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

impl HealthLevel {
    pub fn worst(levels: &[HealthLevel]) -> HealthLevel {
        levels.iter().copied().max().unwrap_or(HealthLevel::Healthy)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub pool: HealthLevel,
    pub breakers: HealthLevel,
    pub freshness: HealthLevel,
    pub scheduler: HealthLevel,
    pub resources: HealthLevel,
    pub cameras: usize,
    pub open_breakers: usize,
    pub stale_cameras: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
