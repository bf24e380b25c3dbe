#[cfg(test)]
mod integration_tests {
    use crate::config::{
        AcquisitionConfig, AirportConfig, CameraId, Config, PathsConfig, PullSettings, PushSettings, WebcamConfig,
    };
    use crate::metrics::Metrics;
    use crate::pipeline::{test_images, OutputFormat, Variant};
    use crate::process_pool::{CompletionStatus, JobCompletion, JobLauncher, ProcessPool, TaskLauncher};
    use crate::publisher::{CacheReader, Freshness};
    use crate::scheduler::{Scheduler, SchedulerCommand};
    use crate::worker::{WebcamWorker, WorkerContext};
    use chrono::Utc;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        config: Arc<Config>,
        ctx: Arc<WorkerContext>,
        pool: Arc<ProcessPool>,
        scheduler: Scheduler,
        completions: mpsc::UnboundedReceiver<JobCompletion>,
    }

    fn config_with(root: &Path, webcams: Vec<WebcamConfig>) -> Config {
        let mut config = Config {
            paths: PathsConfig::under(root),
            airports: vec![AirportConfig {
                id: "kspb".to_string(),
                enabled: true,
                timezone_offset_minutes: 0,
                webcams,
            }],
            ..Default::default()
        };
        config.pipeline.variant_heights = vec![360];
        config
    }

    /// Scheduler and pool wired to a task launcher. Completions are handed to
    /// the test instead of the scheduler so each step can be observed.
    async fn harness(config: Config) -> Harness {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let ctx = Arc::new(WorkerContext::from_config(config.clone(), metrics.clone()));
        let launcher: Arc<dyn JobLauncher> = Arc::new(TaskLauncher::new(WebcamWorker::new(ctx.clone())));

        let (tx, completions) = mpsc::unbounded_channel();
        let pool = Arc::new(ProcessPool::new(1, launcher, tx, metrics));
        let (_unused_tx, unused_rx) = mpsc::unbounded_channel();
        let (mut scheduler, _handle) = Scheduler::new(pool.clone(), unused_rx, config.tick_interval());
        scheduler.seed(config.cameras(), &ctx.breaker, Utc::now()).await;

        Harness {
            config,
            ctx,
            pool,
            scheduler,
            completions,
        }
    }

    async fn next_completion(rx: &mut mpsc::UnboundedReceiver<JobCompletion>) -> JobCompletion {
        tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .expect("job did not finish")
            .expect("pool dropped")
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rtsp_overrun_backs_off_and_delays_next_dispatch() {
        let dir = TempDir::new().unwrap();
        let mut settings = PullSettings::new("rtsp://10.0.0.5:554/stream1");
        settings.rtsp_max_runtime_seconds = 1;
        let mut config = config_with(
            dir.path(),
            vec![WebcamConfig {
                name: "north".to_string(),
                refresh_seconds: Some(60),
                acquisition: AcquisitionConfig::Pull(settings),
            }],
        );
        config.ffmpeg_path = fake_ffmpeg(dir.path(), "exec sleep 30");

        let mut h = harness(config).await;
        let camera = CameraId::new("kspb", 0);
        let now = Utc::now();

        assert_eq!(h.scheduler.tick(now).dispatched, 1);
        // optimistic reschedule one refresh out
        assert_eq!(h.scheduler.queue().due_at(&camera), Some(now + chrono::Duration::seconds(60)));

        let completion = next_completion(&mut h.completions).await;
        assert!(matches!(completion.status, CompletionStatus::Failed(_)), "got {:?}", completion.status);
        let backoff_until = completion.backoff_until.expect("breaker should be open");
        assert!(backoff_until > now + chrono::Duration::seconds(60));

        assert!(h.scheduler.handle_command(SchedulerCommand::JobFinished(completion), Utc::now()));
        assert_eq!(h.scheduler.queue().due_at(&camera), Some(backoff_until));
        assert_eq!(h.scheduler.stats().snapshot().pushed_out, 1);

        let state = h.ctx.breaker.load(&camera).await.unwrap();
        assert_eq!(state.failures, 1);
        assert_eq!(h.pool.get_stats().failed, 1);
    }

    #[tokio::test]
    async fn test_push_upload_flows_through_to_cache_reader() {
        let dir = TempDir::new().unwrap();
        let config = config_with(
            dir.path(),
            vec![WebcamConfig {
                name: "ramp".to_string(),
                refresh_seconds: Some(60),
                acquisition: AcquisitionConfig::Push(PushSettings::default()),
            }],
        );
        let mut h = harness(config).await;
        let camera = h.config.cameras().remove(0);

        let upload_dir = match &camera.acquisition {
            AcquisitionConfig::Push(settings) => h.config.upload_dir(&camera.id, settings),
            AcquisitionConfig::Pull(_) => unreachable!(),
        };
        std::fs::create_dir_all(&upload_dir).unwrap();
        let upload = upload_dir.join("ramp.jpg");
        std::fs::write(&upload, test_images::scene_jpeg(640, 480, 9)).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&upload)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(40))
            .unwrap();

        assert_eq!(h.scheduler.tick(Utc::now()).dispatched, 1);
        let completion = next_completion(&mut h.completions).await;
        assert_eq!(completion.status, CompletionStatus::Succeeded);
        assert!(completion.backoff_until.is_none());
        assert!(!h.scheduler.handle_command(SchedulerCommand::Shutdown, Utc::now()));

        assert_eq!(std::fs::read_dir(&upload_dir).unwrap().count(), 0);

        let reader = CacheReader::new(&h.config.paths.cache_root, h.config.max_staleness());
        let image = reader
            .read(&camera.id, Variant::Height(360), OutputFormat::Jpeg, camera.refresh, Utc::now())
            .unwrap();
        assert_eq!(image.freshness, Freshness::Fresh);
        assert_eq!(image.variant, Variant::Height(360));
        assert!(image.age >= Duration::from_secs(39));

        let decoded = image::load_from_memory(&image.bytes).unwrap();
        assert_eq!(decoded.height(), 360);
        assert_eq!(decoded.width(), 480);

        // no variant at or above the source height, served from the original
        let original = reader
            .read(&camera.id, Variant::Height(1080), OutputFormat::Webp, camera.refresh, Utc::now())
            .unwrap();
        assert_eq!(original.variant, Variant::Original);
        assert_eq!(original.generation, image.generation);
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_skips_without_backoff() {
        let dir = TempDir::new().unwrap();
        let config = config_with(
            dir.path(),
            vec![WebcamConfig {
                name: "north".to_string(),
                refresh_seconds: Some(120),
                acquisition: AcquisitionConfig::Pull(PullSettings::new("http://127.0.0.1:9/cam.jpg")),
            }],
        );
        let mut h = harness(config).await;
        let camera = CameraId::new("kspb", 0);
        let held = tokio_test::assert_ok!(h.ctx.locks.try_acquire(&camera));

        let now = Utc::now();
        assert_eq!(h.scheduler.tick(now).dispatched, 1);
        let completion = next_completion(&mut h.completions).await;
        assert_eq!(completion.status, CompletionStatus::Skipped);
        assert!(completion.backoff_until.is_none());

        h.scheduler.handle_command(SchedulerCommand::JobFinished(completion), Utc::now());
        assert_eq!(h.scheduler.queue().due_at(&camera), Some(now + chrono::Duration::seconds(120)));

        let state = h.ctx.breaker.load(&camera).await.unwrap();
        assert_eq!(state.failures, 0);
        assert!(!h.ctx.breaker.record_path(&camera).exists());
        drop(held);
    }

    #[tokio::test]
    async fn test_saturated_pool_retries_camera_next_tick() {
        let dir = TempDir::new().unwrap();
        let config = config_with(
            dir.path(),
            vec![
                WebcamConfig {
                    name: "a".to_string(),
                    refresh_seconds: None,
                    acquisition: AcquisitionConfig::Push(PushSettings::default()),
                },
                WebcamConfig {
                    name: "b".to_string(),
                    refresh_seconds: None,
                    acquisition: AcquisitionConfig::Push(PushSettings::default()),
                },
            ],
        );
        let mut h = harness(config).await;
        let now = Utc::now();

        let summary = h.scheduler.tick(now);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.rejected, 1);
        // the rejected camera keeps its original due time
        assert_eq!(h.scheduler.queue().due_at(&CameraId::new("kspb", 1)).map(|d| d <= now), Some(true));

        let completion = next_completion(&mut h.completions).await;
        assert_eq!(completion.status, CompletionStatus::Succeeded);
        h.scheduler.handle_command(SchedulerCommand::JobFinished(completion), Utc::now());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let summary = h.scheduler.tick(Utc::now());
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.rejected, 0);
        let completion = next_completion(&mut h.completions).await;
        assert_eq!(completion.camera, CameraId::new("kspb", 1));
    }
}
