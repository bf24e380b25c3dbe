use crate::circuit_breaker::CircuitState;
use crate::config::{CameraId, Config, IsolationMode};
use crate::error::IngestError;
use crate::health::SystemHealthChecker;
use crate::metrics::{HealthLevel, Metrics, MetricsCollector, PrometheusExporter};
use crate::process_pool::{JobLauncher, ProcessPool, SubprocessLauncher, TaskLauncher};
use crate::scheduler::{ConfigWatcher, Scheduler};
use crate::utils::format_duration;
use crate::worker::{WebcamWorker, WorkerContext, EXIT_CONFIG, EXIT_FAILURE, EXIT_SUCCESS};
use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "webcam-ingest")]
#[command(about = "Scheduled webcam acquisition, processing and publication")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(
        long,
        global = true,
        default_value = "/etc/webcam-ingest/config.json",
        help = "Configuration file path"
    )]
    pub config: PathBuf,

    #[arg(long, global = true, help = "Override the number of worker slots")]
    pub max_workers: Option<usize>,

    #[arg(long, global = true, help = "Override the scheduler tick in milliseconds")]
    pub tick_ms: Option<u64>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Emit logs as JSON")]
    pub log_json: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the scheduler daemon
    Run {
        #[arg(long, help = "Serve Prometheus metrics on this port")]
        metrics_port: Option<u16>,
    },

    /// Run a single job for one camera and exit
    ///
    /// Exit codes: 0 success, 1 failure, 2 configuration error, 3 skipped.
    Worker {
        #[arg(long, help = "Airport id")]
        airport: String,

        #[arg(long, help = "Camera index within the airport")]
        camera: usize,
    },

    /// Show breaker state and cache freshness per camera
    Status {
        #[arg(long, help = "Print JSON instead of a table")]
        json: bool,
    },

    /// Validate a configuration file
    Validate {
        #[arg(help = "File to validate (defaults to --config)")]
        file: Option<PathBuf>,
    },

    /// Print a one-shot health report
    Health {
        #[arg(long, help = "Print JSON instead of text")]
        json: bool,
    },
}

pub struct CliRunner {
    pub config: Arc<Config>,
    pub config_path: PathBuf,
}

impl CliRunner {
    /// Load the config file, apply CLI overrides, and validate.
    pub async fn load(args: &Cli) -> Result<Self, IngestError> {
        let mut config = Config::load(&args.config).await?;
        Self::apply_overrides(&mut config, args);
        config.validate()?;

        info!("Configuration loaded from {}", args.config.display());
        info!("Worker slots: {}", config.max_workers);
        info!("Cameras: {}", config.cameras().len());

        Ok(Self {
            config: Arc::new(config),
            config_path: args.config.clone(),
        })
    }

    pub fn apply_overrides(config: &mut Config, args: &Cli) {
        if let Some(max_workers) = args.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(tick_ms) = args.tick_ms {
            config.tick_ms = tick_ms;
        }
    }

    /// Run a command and return the process exit code.
    pub async fn run<F>(&self, command: Commands, shutdown: F) -> anyhow::Result<i32>
    where
        F: Future<Output = ()> + Send,
    {
        match command {
            Commands::Run { metrics_port } => self.run_daemon(metrics_port, shutdown).await,
            Commands::Worker { airport, camera } => self.run_worker(&airport, camera).await,
            Commands::Status { json } => self.show_status(json).await,
            Commands::Validate { file } => {
                Self::validate_config(file.as_deref().unwrap_or(&self.config_path)).await
            }
            Commands::Health { json } => self.show_health(json).await,
        }
    }

    pub async fn run_daemon<F>(&self, metrics_port: Option<u16>, shutdown: F) -> anyhow::Result<i32>
    where
        F: Future<Output = ()> + Send,
    {
        if let Some(port) = metrics_port.or(self.config.metrics_port) {
            PrometheusExporter::new(port)
                .start()
                .context("failed to start Prometheus exporter")?;
        }

        let metrics = Arc::new(Metrics::new());
        let collector = MetricsCollector::new(metrics.clone());
        let collector_task = collector.start_collection();

        let ctx = Arc::new(WorkerContext::from_config(self.config.clone(), metrics.clone()));
        let launcher: Arc<dyn JobLauncher> = match self.config.isolation {
            IsolationMode::Task => Arc::new(TaskLauncher::new(WebcamWorker::new(ctx.clone()))),
            IsolationMode::Process => Arc::new(
                SubprocessLauncher::current_exe(self.config_path.clone(), ctx.breaker.clone())
                    .context("cannot locate own executable for worker processes")?,
            ),
        };

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ProcessPool::new(
            self.config.max_workers,
            launcher,
            completions_tx,
            metrics.clone(),
        ));

        let (mut scheduler, handle) = Scheduler::new(pool.clone(), completions_rx, self.config.tick_interval());
        scheduler.seed(self.config.cameras(), &ctx.breaker, Utc::now()).await;

        let (cameras_tx, cameras_rx) = watch::channel(self.config.cameras());
        let mut watcher = ConfigWatcher::new(
            self.config_path.clone(),
            Duration::from_secs(self.config.config_poll_seconds.max(1)),
        )
        .with_camera_updates(cameras_tx);
        watcher.prime().await;
        let watcher_task = tokio::spawn(watcher.run(handle.clone()));

        let mut checker = SystemHealthChecker::new(&self.config)
            .with_camera_updates(cameras_rx)
            .with_pool(pool.clone())
            .with_scheduler(scheduler.stats());
        let health_metrics = metrics.clone();
        let health_task = tokio::spawn(async move {
            checker
                .start_periodic_health_checks(HEALTH_INTERVAL, health_metrics)
                .await
        });

        info!(
            isolation = ?self.config.isolation,
            slots = self.config.max_workers,
            "Starting webcam-ingest scheduler"
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        shutdown.await;
        info!("Shutting down...");

        handle.shutdown();
        if let Err(e) = scheduler_task.await {
            error!("Scheduler task failed: {}", e);
        }
        watcher_task.abort();
        health_task.abort();
        collector_task.abort();
        pool.shutdown(SHUTDOWN_GRACE).await;

        let stats = pool.get_stats();
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            crashed = stats.crashed,
            rejected = stats.rejected,
            uptime = %format_duration(collector.get_uptime()),
            "webcam-ingest stopped"
        );
        Ok(EXIT_SUCCESS)
    }

    pub async fn run_worker(&self, airport: &str, index: usize) -> anyhow::Result<i32> {
        let id = CameraId::new(airport, index);
        let Some(camera) = self.config.camera(&id) else {
            error!(camera = %id, "Unknown camera");
            return Ok(EXIT_CONFIG);
        };

        let ctx = Arc::new(WorkerContext::from_config(self.config.clone(), Arc::new(Metrics::new())));
        let report = WebcamWorker::new(ctx).run(&camera).await;

        info!(
            camera = %id,
            status = report.status.label(),
            duration = %format_duration(report.duration),
            "Worker finished"
        );
        Ok(report.status.exit_code())
    }

    pub async fn show_status(&self, json: bool) -> anyhow::Result<i32> {
        let checker = SystemHealthChecker::new(&self.config);
        let now = Utc::now();
        let statuses = checker.camera_statuses(now).await;

        if json {
            let rows: Vec<serde_json::Value> = statuses
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "camera": s.camera,
                        "name": s.name,
                        "mode": if s.push { "push" } else { "pull" },
                        "breaker": format!("{:?}", s.breaker).to_lowercase(),
                        "failures": s.failures,
                        "backoff_until": s.backoff_until,
                        "last_error": s.last_error,
                        "captured_at": s.captured_at,
                        "freshness": s.freshness,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(EXIT_SUCCESS);
        }

        println!("Camera Status");
        println!("=============");
        for s in &statuses {
            let freshness = match (s.freshness, s.captured_at) {
                (Some(f), Some(at)) => format!(
                    "{:?} ({} old)",
                    f,
                    format_duration((now - at).to_std().unwrap_or_default())
                ),
                (None, Some(_)) => "unavailable (too old)".to_string(),
                _ => "unavailable (never published)".to_string(),
            };
            println!(
                "  {:<16} {:<5} breaker: {:<8} failures: {:<3} {}",
                s.camera.to_string(),
                if s.push { "push" } else { "pull" },
                format!("{:?}", s.breaker),
                s.failures,
                freshness
            );
            if s.breaker == CircuitState::Open {
                if let Some(until) = s.backoff_until {
                    println!("      backoff until {until}");
                }
            }
            if let Some(err) = &s.last_error {
                if s.failures > 0 {
                    println!("      last error: {err}");
                }
            }
        }

        Ok(EXIT_SUCCESS)
    }

    pub async fn validate_config(path: &Path) -> anyhow::Result<i32> {
        println!("Validating configuration: {}", path.display());

        let config = match Config::load(path).await.and_then(|c| c.validate().map(|_| c)) {
            Ok(config) => config,
            Err(e) => {
                println!("Configuration is invalid: {e}");
                return Ok(EXIT_CONFIG);
            }
        };

        let cameras = config.cameras();
        let push = cameras.iter().filter(|c| c.is_push()).count();
        println!("Configuration is valid:");
        println!("  Worker slots: {}", config.max_workers);
        println!("  Isolation: {:?}", config.isolation);
        println!("  Tick: {} ms", config.tick_ms);
        println!("  Airports: {}", config.airports.len());
        println!("  Cameras: {} ({} pull, {} push)", cameras.len(), cameras.len() - push, push);
        println!("  Cache root: {}", config.paths.cache_root.display());

        Ok(EXIT_SUCCESS)
    }

    pub async fn show_health(&self, json: bool) -> anyhow::Result<i32> {
        let mut checker = SystemHealthChecker::new(&self.config);
        let status = checker.check_system_health().await;

        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            println!("System Health Check");
            println!("==================");
            println!("Overall: {:?}", status.overall);
            println!("  Breakers: {:?} ({}/{} open)", status.breakers, status.open_breakers, status.cameras);
            println!("  Freshness: {:?} ({}/{} unavailable)", status.freshness, status.stale_cameras, status.cameras);
            println!("  Resources: {:?}", status.resources);
        }

        if status.overall == HealthLevel::Critical {
            warn!("System health is critical");
            Ok(EXIT_FAILURE)
        } else {
            Ok(EXIT_SUCCESS)
        }
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over `verbose`.
pub fn setup_logging(verbose: bool, json: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow::anyhow!(e))
}
