//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration structures for the ingestion daemon:
//! scheduler and pool sizing, filesystem layout, pipeline and breaker tuning,
//! push defaults, and the per-airport webcam list.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Main configuration structure for the ingestion daemon
///
/// Every section has defaults, so a file only needs to list its airports.
///
/// # Examples
///
/// ```rust
/// use webcam_ingest::Config;
///
/// let config = Config::from_json_str(r#"{
///     "airports": [{
///         "id": "kspb",
///         "webcams": [{ "name": "Runway", "mode": "pull", "url": "http://cam.local/snap.jpg" }]
///     }]
/// }"#).unwrap();
///
/// assert_eq!(config.cameras().len(), 1);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of concurrent worker slots (default: CPU count, at least 2)
    ///
    /// The scheduler never queues beyond this limit. A saturated pool rejects
    /// the job and the camera is retried on the next tick.
    pub max_workers: usize,

    /// Scheduler tick interval in milliseconds (default: 1000)
    pub tick_ms: u64,

    /// How each job is isolated from the scheduler process (default: task)
    pub isolation: IsolationMode,

    /// How often the config file mtime is polled for changes (default: 30 seconds)
    pub config_poll_seconds: u64,

    /// Lower bound for every camera's refresh interval (default: 60 seconds)
    ///
    /// Shorter intervals in the file are clamped with a warning.
    pub min_refresh_seconds: u64,

    /// Refresh interval for cameras that do not set one (default: 60 seconds)
    pub default_refresh_seconds: u64,

    /// Published images older than this are never served (default: 2 hours)
    pub max_staleness_seconds: u64,

    /// Port for the Prometheus exporter (default: disabled)
    pub metrics_port: Option<u16>,

    /// Path to the ffmpeg binary used for RTSP capture (default: "ffmpeg")
    pub ffmpeg_path: PathBuf,

    /// Filesystem layout
    pub paths: PathsConfig,

    /// Image processing settings
    pub pipeline: PipelineConfig,

    /// Circuit breaker backoff tuning
    pub breaker: BreakerConfig,

    /// Defaults applied to every push camera
    pub push: PushDefaults,

    /// Airports and their webcams
    pub airports: Vec<AirportConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(2),
            tick_ms: 1000,
            isolation: IsolationMode::Task,
            config_poll_seconds: 30,
            min_refresh_seconds: 60,
            default_refresh_seconds: 60,
            max_staleness_seconds: 2 * 3600,
            metrics_port: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            paths: PathsConfig::default(),
            pipeline: PipelineConfig::default(),
            breaker: BreakerConfig::default(),
            push: PushDefaults::default(),
            airports: Vec::new(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, IngestError> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            IngestError::ConfigurationError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> Result<Self, IngestError> {
        serde_json::from_str(content)
            .map_err(|e| IngestError::ConfigurationError(format!("invalid config: {e}")))
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.max_workers == 0 {
            return Err(IngestError::ConfigurationError(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.tick_ms == 0 {
            return Err(IngestError::ConfigurationError(
                "tick_ms must be greater than 0".to_string(),
            ));
        }

        if !(1..=100).contains(&self.pipeline.jpeg_quality) {
            return Err(IngestError::ConfigurationError(format!(
                "jpeg_quality must be within 1-100, got {}",
                self.pipeline.jpeg_quality
            )));
        }

        if self.pipeline.keep_generations == 0 {
            return Err(IngestError::ConfigurationError(
                "keep_generations must be at least 1".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.push.newest_share) {
            return Err(IngestError::ConfigurationError(format!(
                "push.newest_share must be within 0.0-1.0, got {}",
                self.push.newest_share
            )));
        }

        let mut seen_airports = HashSet::new();
        for airport in &self.airports {
            if airport.id.trim().is_empty() {
                return Err(IngestError::ConfigurationError(
                    "airport id must not be empty".to_string(),
                ));
            }
            if !seen_airports.insert(airport.id.to_ascii_lowercase()) {
                return Err(IngestError::ConfigurationError(format!(
                    "duplicate airport id: {}",
                    airport.id
                )));
            }

            for (index, webcam) in airport.webcams.iter().enumerate() {
                if let AcquisitionConfig::Pull(pull) = &webcam.acquisition {
                    if pull.url.trim().is_empty() {
                        return Err(IngestError::ConfigurationError(format!(
                            "camera {}/{} is a pull camera without a url",
                            airport.id, index
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Flatten enabled airports into immutable per-camera configs.
    ///
    /// Refresh intervals are clamped to `min_refresh_seconds`.
    pub fn cameras(&self) -> Vec<CameraConfig> {
        let mut cameras = Vec::new();

        for airport in self.airports.iter().filter(|a| a.enabled) {
            for (index, webcam) in airport.webcams.iter().enumerate() {
                let id = CameraId::new(airport.id.clone(), index);
                let requested = webcam
                    .refresh_seconds
                    .unwrap_or(self.default_refresh_seconds);
                let refresh = if requested < self.min_refresh_seconds {
                    warn!(
                        camera = %id,
                        requested,
                        minimum = self.min_refresh_seconds,
                        "Refresh interval below minimum, clamping"
                    );
                    self.min_refresh_seconds
                } else {
                    requested
                };

                cameras.push(CameraConfig {
                    id,
                    name: webcam.name.clone(),
                    refresh: Duration::from_secs(refresh),
                    timezone_offset_minutes: airport.timezone_offset_minutes,
                    acquisition: webcam.acquisition.clone(),
                });
            }
        }

        cameras
    }

    pub fn camera(&self, id: &CameraId) -> Option<CameraConfig> {
        self.cameras().into_iter().find(|c| &c.id == id)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn max_staleness(&self) -> Duration {
        Duration::from_secs(self.max_staleness_seconds)
    }

    /// Upload directory for a push camera.
    pub fn upload_dir(&self, camera: &CameraId, settings: &PushSettings) -> PathBuf {
        settings.upload_dir.clone().unwrap_or_else(|| {
            self.paths
                .uploads_root
                .join(&camera.airport)
                .join(camera.index.to_string())
        })
    }

    /// Staging directory holding `claimed/` and `rejected/` for a push camera.
    pub fn staging_dir(&self, camera: &CameraId) -> PathBuf {
        self.paths.staging_root.join(camera.file_stem())
    }
}

/// Job isolation mode for the process pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Run each job as a tokio task inside the daemon
    Task,
    /// Run each job as a `worker` child process
    Process,
}

/// Filesystem layout for cache, state, and uploads
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of the published image cache
    pub cache_root: PathBuf,
    /// Breaker records and lock files
    pub state_dir: PathBuf,
    /// Default parent for per-camera upload directories
    pub uploads_root: PathBuf,
    /// Claimed and rejected push files
    pub staging_root: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = PathBuf::from("/var/lib/webcam-ingest");
        Self {
            cache_root: base.join("cache"),
            state_dir: base.join("state"),
            uploads_root: base.join("uploads"),
            staging_root: base.join("staging"),
        }
    }
}

impl PathsConfig {
    /// All four directories under a single root. Handy for tests and local runs.
    pub fn under(root: &Path) -> Self {
        Self {
            cache_root: root.join("cache"),
            state_dir: root.join("state"),
            uploads_root: root.join("uploads"),
            staging_root: root.join("staging"),
        }
    }
}

/// Image processing settings
///
/// Controls error-frame detection thresholds, EXIF clock handling and the
/// variant/format matrix written for each published generation.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// JPEG encoder quality, 1-100 (default: 85)
    pub jpeg_quality: u8,

    /// Also write a lossless WebP next to every JPEG (default: true)
    pub webp_enabled: bool,

    /// Downscaled variant heights in pixels (default: 1080, 720, 360)
    ///
    /// Heights at or above the source height are skipped.
    pub variant_heights: Vec<u32>,

    /// Published generations kept on disk, including the live one (default: 3)
    pub keep_generations: usize,

    /// How far in the future a capture time may be before it is rejected (default: 10 minutes)
    pub clock_future_tolerance_seconds: u64,

    /// EXIF times further than this from the acquisition time are distrusted (default: 3 hours)
    pub max_clock_drift_seconds: u64,

    /// Error-frame detection thresholds
    pub error_frame: ErrorFrameConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            webp_enabled: true,
            variant_heights: vec![1080, 720, 360],
            keep_generations: 3,
            clock_future_tolerance_seconds: 600,
            max_clock_drift_seconds: 3 * 3600,
            error_frame: ErrorFrameConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorFrameConfig {
    pub min_width: u32,
    pub min_height: u32,
    /// Luma standard deviation below which a frame counts as uniform
    pub uniform_stddev: f64,
    /// Block-boundary to interior gradient ratio that counts as pixelation
    pub pixelation_ratio: f64,
    /// Share of pixels matching a vendor signature colour that counts as an overlay
    pub signature_fraction: f64,
}

impl Default for ErrorFrameConfig {
    fn default() -> Self {
        Self {
            min_width: 64,
            min_height: 64,
            uniform_stddev: 2.0,
            pixelation_ratio: 3.0,
            signature_fraction: 0.9,
        }
    }
}

/// Circuit breaker backoff tuning, all values in seconds
///
/// Backoff after failure `n` is `min(cap, base * 2^(n-1))`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub transient_base_seconds: u64,
    pub transient_cap_seconds: u64,
    pub permanent_base_seconds: u64,
    pub permanent_cap_seconds: u64,
    /// Base for validation failures. They share the transient cap.
    pub validation_base_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            transient_base_seconds: 60,
            transient_cap_seconds: 3600,
            permanent_base_seconds: 120,
            permanent_cap_seconds: 7200,
            validation_base_seconds: 30,
        }
    }
}

/// Defaults applied to every push camera
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PushDefaults {
    /// Files processed per run at most (default: 30)
    pub max_files_per_run: usize,
    /// Share of each batch reserved for the newest files (default: 0.5)
    pub newest_share: f64,
    /// Polls a young file must survive unchanged (default: 2)
    pub stability_checks: u32,
    /// Delay between stability polls in milliseconds (default: 500)
    pub stability_poll_ms: u64,
    /// Files older than this are stable after a single stat (default: 30 seconds)
    pub settled_age_seconds: u64,
    /// Time budget per run (default: 120 seconds)
    pub run_timeout_seconds: u64,
    /// Pending files at which the time budget is extended (default: 10)
    pub backlog_threshold: usize,
    /// Time budget multiplier under backlog (default: 2)
    pub backlog_timeout_multiplier: u32,
    /// Claimed files older than this are handed back for re-claim (default: 5 minutes)
    pub orphan_release_seconds: u64,
    /// Uploads older than this are deleted instead of re-claimed (default: 6 hours)
    pub orphan_expire_seconds: u64,
    /// Upload size limit (default: 20 MiB)
    pub max_file_size_bytes: u64,
    /// Accepted file extensions, lowercase (default: jpg, jpeg, png)
    pub allowed_extensions: Vec<String>,
}

impl Default for PushDefaults {
    fn default() -> Self {
        Self {
            max_files_per_run: 30,
            newest_share: 0.5,
            stability_checks: 2,
            stability_poll_ms: 500,
            settled_age_seconds: 30,
            run_timeout_seconds: 120,
            backlog_threshold: 10,
            backlog_timeout_multiplier: 2,
            orphan_release_seconds: 300,
            orphan_expire_seconds: 6 * 3600,
            max_file_size_bytes: 20 * 1024 * 1024,
            allowed_extensions: vec!["jpg".to_string(), "jpeg".to_string(), "png".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AirportConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Offset applied to EXIF times that carry none (default: UTC)
    #[serde(default)]
    pub timezone_offset_minutes: i32,
    #[serde(default)]
    pub webcams: Vec<WebcamConfig>,
}

/// One webcam entry as written in the config file
///
/// The camera index is its position in the airport's `webcams` list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebcamConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub refresh_seconds: Option<u64>,
    #[serde(flatten)]
    pub acquisition: AcquisitionConfig,
}

/// Acquisition parameters, tagged by `mode`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum AcquisitionConfig {
    Pull(PullSettings),
    Push(PushSettings),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PullSettings {
    pub url: String,
    /// Overrides detection from the URL
    #[serde(default)]
    pub source_type: Option<SourceType>,
    #[serde(default)]
    pub rtsp_transport: RtspTransport,
    #[serde(default = "default_pull_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_rtsp_frame_timeout")]
    pub rtsp_frame_timeout_seconds: u64,
    #[serde(default = "default_rtsp_max_runtime")]
    pub rtsp_max_runtime_seconds: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Sent as `X-API-Key` to federated sources
    #[serde(default)]
    pub api_key: Option<String>,
}

impl PullSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source_type: None,
            rtsp_transport: RtspTransport::default(),
            timeout_seconds: default_pull_timeout(),
            rtsp_frame_timeout_seconds: default_rtsp_frame_timeout(),
            rtsp_max_runtime_seconds: default_rtsp_max_runtime(),
            username: None,
            password: None,
            api_key: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PushSettings {
    #[serde(default)]
    pub protocol: UploadProtocol,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Overrides `push.max_file_size_bytes`
    #[serde(default)]
    pub max_file_size_bytes: Option<u64>,
    /// Overrides `push.allowed_extensions`
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,
    /// Overrides `<uploads_root>/<airport>/<index>`
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

/// Pull source kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Rtsp,
    #[serde(alias = "jpg")]
    Jpeg,
    Png,
    Mjpeg,
    Federated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RtspTransport {
    #[default]
    Tcp,
    Udp,
}

impl RtspTransport {
    pub fn as_str(&self) -> &'static str {
        match self {
            RtspTransport::Tcp => "tcp",
            RtspTransport::Udp => "udp",
        }
    }
}

/// Protocol the uploading camera uses. Informational; the upload server is external.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadProtocol {
    Ftp,
    #[default]
    Sftp,
}

/// Camera identity: airport id plus position in that airport's webcam list
///
/// Ordered by airport, then index. Used as the tie-break wherever two
/// cameras compare equal on time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct CameraId {
    pub airport: String,
    pub index: usize,
}

impl CameraId {
    pub fn new(airport: impl Into<String>, index: usize) -> Self {
        Self {
            airport: airport.into(),
            index,
        }
    }

    /// `<airport>_<index>`, safe for use as a file name.
    pub fn file_stem(&self) -> String {
        format!(
            "{}_{}",
            crate::utils::sanitize_filename(&self.airport),
            self.index
        )
    }
}

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.airport, self.index)
    }
}

/// Immutable per-camera configuration handed to a job
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub id: CameraId,
    pub name: String,
    pub refresh: Duration,
    pub timezone_offset_minutes: i32,
    pub acquisition: AcquisitionConfig,
}

impl CameraConfig {
    pub fn is_push(&self) -> bool {
        matches!(self.acquisition, AcquisitionConfig::Push(_))
    }
}

fn default_true() -> bool {
    true
}

fn default_pull_timeout() -> u64 {
    15
}

fn default_rtsp_frame_timeout() -> u64 {
    10
}

fn default_rtsp_max_runtime() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "max_workers": 4,
        "airports": [
            {
                "id": "kspb",
                "timezone_offset_minutes": -480,
                "webcams": [
                    { "name": "North", "mode": "pull", "url": "rtsp://10.0.0.5/stream1", "refresh_seconds": 10 },
                    { "name": "Ramp", "mode": "push", "protocol": "ftp", "max_file_size_bytes": 1048576 }
                ]
            },
            {
                "id": "k0s9",
                "enabled": false,
                "webcams": [
                    { "mode": "pull", "url": "http://example.com/cam.jpg" }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert!(config.max_workers >= 2);
        assert_eq!(config.tick_ms, 1000);
        assert_eq!(config.min_refresh_seconds, 60);
        assert_eq!(config.pipeline.jpeg_quality, 85);
        assert_eq!(config.pipeline.variant_heights, vec![1080, 720, 360]);
        assert_eq!(config.push.max_files_per_run, 30);
        assert_eq!(config.isolation, IsolationMode::Task);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample_config() {
        let config = Config::from_json_str(SAMPLE).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.airports.len(), 2);

        let cameras = config.cameras();
        // disabled airport is skipped
        assert_eq!(cameras.len(), 2);

        let north = &cameras[0];
        assert_eq!(north.id, CameraId::new("kspb", 0));
        assert_eq!(north.timezone_offset_minutes, -480);
        // clamped to the minimum
        assert_eq!(north.refresh, Duration::from_secs(60));
        match &north.acquisition {
            AcquisitionConfig::Pull(pull) => {
                assert_eq!(pull.rtsp_transport, RtspTransport::Tcp);
                assert_eq!(pull.timeout_seconds, 15);
            }
            other => panic!("expected pull, got {other:?}"),
        }

        let ramp = &cameras[1];
        assert!(ramp.is_push());
        match &ramp.acquisition {
            AcquisitionConfig::Push(push) => {
                assert_eq!(push.protocol, UploadProtocol::Ftp);
                assert_eq!(push.max_file_size_bytes, Some(1048576));
            }
            other => panic!("expected push, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::from_json_str(SAMPLE).unwrap();
        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_json_str(SAMPLE).unwrap();
        config.pipeline.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = Config::from_json_str(SAMPLE).unwrap();
        config.airports[1].id = "KSPB".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::from_json_str(SAMPLE).unwrap();
        config.airports[0].webcams[0].acquisition =
            AcquisitionConfig::Pull(PullSettings::new("  "));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_mode_is_a_config_error() {
        let result = Config::from_json_str(
            r#"{ "airports": [{ "id": "a", "webcams": [{ "mode": "carrier-pigeon" }] }] }"#,
        );
        assert!(matches!(result, Err(IngestError::ConfigurationError(_))));
    }

    #[test]
    fn test_camera_paths() {
        let root = Path::new("/srv/ingest");
        let config = Config {
            paths: PathsConfig::under(root),
            ..Default::default()
        };
        let id = CameraId::new("kspb", 1);

        assert_eq!(
            config.upload_dir(&id, &PushSettings::default()),
            root.join("uploads/kspb/1")
        );
        assert_eq!(config.staging_dir(&id), root.join("staging/kspb_1"));

        let custom = PushSettings {
            upload_dir: Some(PathBuf::from("/home/ftp/cam")),
            ..Default::default()
        };
        assert_eq!(config.upload_dir(&id, &custom), PathBuf::from("/home/ftp/cam"));
    }

    #[test]
    fn test_camera_id_ordering() {
        let mut ids = vec![
            CameraId::new("kspb", 2),
            CameraId::new("k0s9", 5),
            CameraId::new("kspb", 0),
        ];
        ids.sort();
        assert_eq!(ids[0], CameraId::new("k0s9", 5));
        assert_eq!(ids[1], CameraId::new("kspb", 0));
        assert_eq!(ids[2].to_string(), "kspb/2");
    }
}
