//! Pull acquisition: static HTTP images, MJPEG streams, RTSP via ffmpeg and
//! federated instances.

use super::mjpeg::{FrameExtractor, MAX_FRAME_BYTES};
use super::{AcquiredImage, ImageSource};
use crate::config::{CameraId, PullSettings, SourceType};
use crate::error::IngestError;
use crate::utils::redact_url;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use image::codecs::jpeg::JpegEncoder;
use reqwest::header::{HeaderMap, LAST_MODIFIED};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

const PNG_TO_JPEG_QUALITY: u8 = 95;

/// Guess the source type from a camera URL.
///
/// `federated` is never guessed; it must be configured explicitly.
pub fn detect_source_type(raw_url: &str) -> SourceType {
    let lower = raw_url.trim().to_ascii_lowercase();
    if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
        return SourceType::Rtsp;
    }

    let path = match Url::parse(&lower) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => lower.split(['?', '#']).next().unwrap_or_default().to_string(),
    };

    if path.ends_with(".jpg") || path.ends_with(".jpeg") {
        SourceType::Jpeg
    } else if path.ends_with(".png") {
        SourceType::Png
    } else {
        SourceType::Mjpeg
    }
}

pub struct PullSource {
    camera: CameraId,
    settings: PullSettings,
    source_type: SourceType,
    client: reqwest::Client,
    ffmpeg_path: PathBuf,
}

impl PullSource {
    pub fn new(camera: CameraId, settings: PullSettings, ffmpeg_path: &Path) -> Result<Self, IngestError> {
        let source_type = settings
            .source_type
            .unwrap_or_else(|| detect_source_type(&settings.url));

        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .connect_timeout(settings.timeout())
            .user_agent(concat!("webcam-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::ConfigurationError(format!("http client: {e}")))?;

        Ok(Self {
            camera,
            settings,
            source_type,
            client,
            ffmpeg_path: ffmpeg_path.to_path_buf(),
        })
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub async fn acquire(&self) -> Result<AcquiredImage, IngestError> {
        debug!(
            camera = %self.camera,
            source = ?self.source_type,
            url = %redact_url(&self.settings.url),
            "Acquiring image"
        );

        match self.source_type {
            SourceType::Jpeg => self.fetch_static(false).await,
            SourceType::Png => self.fetch_static(true).await,
            SourceType::Mjpeg => self.fetch_mjpeg().await,
            SourceType::Rtsp => self.capture_rtsp().await,
            SourceType::Federated => self.fetch_federated().await,
        }
    }

    async fn get(&self, with_api_key: bool) -> Result<reqwest::Response, IngestError> {
        let timeout = self.settings.timeout();
        let mut request = self.client.get(&self.settings.url);

        if let Some(username) = &self.settings.username {
            request = request.basic_auth(username, self.settings.password.as_deref());
        }
        if with_api_key {
            if let Some(key) = &self.settings.api_key {
                request = request.header("X-API-Key", key);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| IngestError::from_http(&e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::from_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("unknown").to_string(),
            ));
        }
        Ok(response)
    }

    async fn fetch_static(&self, convert_png: bool) -> Result<AcquiredImage, IngestError> {
        let timeout = self.settings.timeout();
        let response = self.get(false).await?;
        let body = read_body_capped(response, MAX_FRAME_BYTES, timeout).await?;

        let bytes = if convert_png {
            png_to_jpeg(&body)?
        } else {
            ensure_jpeg(&body)?;
            body
        };

        Ok(AcquiredImage {
            bytes,
            captured_at: Utc::now(),
            source: ImageSource::HttpStatic,
        })
    }

    async fn fetch_mjpeg(&self) -> Result<AcquiredImage, IngestError> {
        let timeout = self.settings.timeout();
        let frame = tokio::time::timeout(timeout, self.read_first_frame())
            .await
            .map_err(|_| IngestError::Timeout(timeout))??;

        Ok(AcquiredImage {
            bytes: frame,
            captured_at: Utc::now(),
            source: ImageSource::Mjpeg,
        })
    }

    async fn read_first_frame(&self) -> Result<Vec<u8>, IngestError> {
        let timeout = self.settings.timeout();
        let response = self.get(false).await?;
        let mut stream = response.bytes_stream();
        let mut extractor = FrameExtractor::new(MAX_FRAME_BYTES);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| IngestError::from_http(&e, timeout))?;
            if let Some(frame) = extractor.push(&chunk)? {
                return Ok(frame);
            }
        }

        Err(IngestError::InvalidImage(
            "MJPEG stream ended before a complete frame".to_string(),
        ))
    }

    async fn fetch_federated(&self) -> Result<AcquiredImage, IngestError> {
        let timeout = self.settings.timeout();
        let response = self.get(true).await?;
        let captured_at = last_modified(response.headers()).unwrap_or_else(Utc::now);
        let body = read_body_capped(response, MAX_FRAME_BYTES, timeout).await?;
        ensure_jpeg(&body)?;

        Ok(AcquiredImage {
            bytes: body,
            captured_at,
            source: ImageSource::Federated,
        })
    }

    async fn capture_rtsp(&self) -> Result<AcquiredImage, IngestError> {
        let max_runtime = Duration::from_secs(self.settings.rtsp_max_runtime_seconds);
        let frame_timeout = Duration::from_secs(self.settings.rtsp_frame_timeout_seconds);
        let url = self.rtsp_url()?;
        let socket_timeout_us = frame_timeout.as_micros().to_string();

        let child = Command::new(&self.ffmpeg_path)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-rtsp_transport",
                self.settings.rtsp_transport.as_str(),
                "-timeout",
                socket_timeout_us.as_str(),
                "-i",
                url.as_str(),
                "-frames:v",
                "1",
                "-f",
                "image2pipe",
                "-vcodec",
                "mjpeg",
                "-y",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                IngestError::IoError(format!(
                    "cannot spawn {}: {e}",
                    self.ffmpeg_path.display()
                ))
            })?;

        // On timeout the child is dropped and kill_on_drop sends SIGKILL.
        let output = match tokio::time::timeout(max_runtime, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(IngestError::CaptureFailed(format!("ffmpeg wait failed: {e}"))),
            Err(_) => {
                warn!(
                    camera = %self.camera,
                    max_runtime_secs = max_runtime.as_secs(),
                    "ffmpeg exceeded max runtime, killed"
                );
                return Err(IngestError::Timeout(max_runtime));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ffmpeg_failure(stderr.trim(), frame_timeout));
        }

        if output.stdout.is_empty() {
            return Err(IngestError::CaptureFailed("ffmpeg produced no frame".to_string()));
        }
        ensure_jpeg(&output.stdout)?;

        Ok(AcquiredImage {
            bytes: output.stdout,
            captured_at: Utc::now(),
            source: ImageSource::Rtsp,
        })
    }

    fn rtsp_url(&self) -> Result<String, IngestError> {
        let Some(username) = &self.settings.username else {
            return Ok(self.settings.url.clone());
        };

        let mut parsed = Url::parse(&self.settings.url)
            .map_err(|e| IngestError::ConfigurationError(format!("invalid rtsp url: {e}")))?;
        if parsed.username().is_empty() {
            parsed
                .set_username(username)
                .map_err(|_| IngestError::ConfigurationError("cannot set rtsp username".to_string()))?;
            parsed
                .set_password(self.settings.password.as_deref())
                .map_err(|_| IngestError::ConfigurationError("cannot set rtsp password".to_string()))?;
        }
        Ok(parsed.to_string())
    }
}

fn classify_ffmpeg_failure(stderr: &str, frame_timeout: Duration) -> IngestError {
    let lower = stderr.to_ascii_lowercase();

    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("403 forbidden") {
        IngestError::AuthFailed(stderr.to_string())
    } else if lower.contains("name or service not known")
        || lower.contains("temporary failure in name resolution")
    {
        IngestError::DnsFailed(stderr.to_string())
    } else if lower.contains("connection refused") || lower.contains("no route to host") {
        IngestError::ConnectionFailed(stderr.to_string())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        IngestError::Timeout(frame_timeout)
    } else if lower.contains("404 not found") {
        IngestError::HttpStatus {
            status: 404,
            message: stderr.to_string(),
        }
    } else {
        IngestError::CaptureFailed(if stderr.is_empty() {
            "ffmpeg exited with failure".to_string()
        } else {
            stderr.to_string()
        })
    }
}

/// Buffer a response body, giving up once it grows past `cap` bytes.
async fn read_body_capped(
    response: reqwest::Response,
    cap: usize,
    timeout: Duration,
) -> Result<Vec<u8>, IngestError> {
    if let Some(length) = response.content_length() {
        if length > cap as u64 {
            return Err(IngestError::InvalidImage(format!(
                "response of {length} bytes exceeds {cap} byte limit"
            )));
        }
    }

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| IngestError::from_http(&e, timeout))?;
        if body.len() + chunk.len() > cap {
            return Err(IngestError::InvalidImage(format!(
                "response body exceeds {cap} byte limit"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn ensure_jpeg(bytes: &[u8]) -> Result<(), IngestError> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return Err(IngestError::InvalidImage(format!(
            "expected JPEG data, got {} bytes without SOI marker",
            bytes.len()
        )));
    }
    Ok(())
}

fn png_to_jpeg(bytes: &[u8]) -> Result<Vec<u8>, IngestError> {
    let decoded = image::load_from_memory_with_format(bytes, image::ImageFormat::Png)
        .map_err(|e| IngestError::InvalidImage(format!("PNG decode failed: {e}")))?;
    let rgb = decoded.into_rgb8();
    let mut out = Vec::with_capacity(bytes.len());
    JpegEncoder::new_with_quality(&mut out, PNG_TO_JPEG_QUALITY).encode_image(&rgb)?;
    Ok(out)
}

fn last_modified(headers: &HeaderMap) -> Option<DateTime<Utc>> {
    let value = headers.get(LAST_MODIFIED)?.to_str().ok()?;
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use chrono::TimeZone;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_jpeg() -> Vec<u8> {
        let img = ImageBuffer::from_fn(80, 60, |x, y| Rgb([x as u8, y as u8, (x ^ y) as u8]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .encode_image(&img)
            .unwrap();
        out
    }

    fn test_png() -> Vec<u8> {
        let img = ImageBuffer::from_fn(80, 60, |x, y| Rgb([x as u8, y as u8, 40u8]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn source(url: String) -> PullSource {
        let mut settings = PullSettings::new(url);
        settings.timeout_seconds = 2;
        PullSource::new(CameraId::new("kspb", 0), settings, Path::new("ffmpeg")).unwrap()
    }

    #[test]
    fn test_detect_source_type() {
        assert_eq!(detect_source_type("rtsp://10.0.0.5:554/stream1"), SourceType::Rtsp);
        assert_eq!(detect_source_type("RTSPS://cam.example/live"), SourceType::Rtsp);
        assert_eq!(detect_source_type("http://cam.local/snap.JPG"), SourceType::Jpeg);
        assert_eq!(detect_source_type("http://cam.local/a.jpeg?t=123"), SourceType::Jpeg);
        assert_eq!(detect_source_type("https://cam.local/still.png"), SourceType::Png);
        assert_eq!(detect_source_type("http://cam.local/video.cgi"), SourceType::Mjpeg);
        assert_eq!(detect_source_type("http://cam.local/mjpg?x=.jpg"), SourceType::Mjpeg);
    }

    #[test]
    fn test_explicit_source_type_wins() {
        let mut settings = PullSettings::new("http://peer.example/api/webcam/kspb/0");
        settings.source_type = Some(SourceType::Federated);
        let source = PullSource::new(CameraId::new("kspb", 0), settings, Path::new("ffmpeg")).unwrap();
        assert_eq!(source.source_type(), SourceType::Federated);
    }

    #[tokio::test]
    async fn test_static_jpeg() {
        let server = MockServer::start().await;
        let jpeg = test_jpeg();
        Mock::given(method("GET"))
            .and(path("/snap.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg.clone()))
            .mount(&server)
            .await;

        let image = source(format!("{}/snap.jpg", server.uri())).acquire().await.unwrap();
        assert_eq!(image.bytes, jpeg);
        assert_eq!(image.source, ImageSource::HttpStatic);
    }

    #[tokio::test]
    async fn test_static_png_converted_to_jpeg() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/still.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(test_png()))
            .mount(&server)
            .await;

        let image = source(format!("{}/still.png", server.uri())).acquire().await.unwrap();
        assert_eq!(&image.bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&image.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (80, 60));
    }

    #[tokio::test]
    async fn test_unauthorized_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = source(format!("{}/snap.jpg", server.uri())).acquire().await.unwrap_err();
        assert!(matches!(err, IngestError::AuthFailed(_)));
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = source(format!("{}/snap.jpg", server.uri())).acquire().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(test_jpeg())
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let err = source(format!("{}/snap.jpg", server.uri())).acquire().await.unwrap_err();
        assert!(matches!(err, IngestError::Timeout(_)), "got {err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // port 9 (discard) is closed on test machines
        let err = source("http://127.0.0.1:9/snap.jpg".to_string())
            .acquire()
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient, "got {err:?}");
    }

    #[tokio::test]
    async fn test_html_body_is_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let err = source(format!("{}/snap.jpg", server.uri())).acquire().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[tokio::test]
    async fn test_truncated_png_is_validation_error() {
        let server = MockServer::start().await;
        let mut png = test_png();
        png.truncate(png.len() / 2);
        Mock::given(method("GET"))
            .and(path("/still.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png))
            .mount(&server)
            .await;

        let err = source(format!("{}/still.png", server.uri())).acquire().await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidImage(_)), "got {err:?}");
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[tokio::test]
    async fn test_oversized_static_body_is_validation_error() {
        let server = MockServer::start().await;
        let mut body = test_jpeg();
        body.resize(MAX_FRAME_BYTES + 1, 0);
        Mock::given(method("GET"))
            .and(path("/snap.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let err = source(format!("{}/snap.jpg", server.uri())).acquire().await.unwrap_err();
        assert!(err.to_string().contains("byte limit"), "got {err:?}");
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[tokio::test]
    async fn test_oversized_federated_body_is_validation_error() {
        let server = MockServer::start().await;
        let mut body = test_jpeg();
        body.resize(MAX_FRAME_BYTES + 64 * 1024, 0);
        Mock::given(method("GET"))
            .and(path("/webcam/kspb/0"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let mut settings = PullSettings::new(format!("{}/webcam/kspb/0", server.uri()));
        settings.source_type = Some(SourceType::Federated);
        let source = PullSource::new(CameraId::new("kspb", 0), settings, Path::new("ffmpeg")).unwrap();

        let err = source.acquire().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation, "got {err:?}");
    }

    #[tokio::test]
    async fn test_mjpeg_first_frame() {
        let server = MockServer::start().await;
        let frame = test_jpeg();
        let mut body = Vec::new();
        for _ in 0..3 {
            body.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
            body.extend_from_slice(&frame);
            body.extend_from_slice(b"\r\n");
        }
        Mock::given(method("GET"))
            .and(path("/video.cgi"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "multipart/x-mixed-replace; boundary=frame")
                    .set_body_bytes(body),
            )
            .mount(&server)
            .await;

        let image = source(format!("{}/video.cgi", server.uri())).acquire().await.unwrap();
        assert_eq!(image.bytes, frame);
        assert_eq!(image.source, ImageSource::Mjpeg);
    }

    #[tokio::test]
    async fn test_federated_uses_api_key_and_last_modified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/webcam/kspb/0"))
            .and(header("X-API-Key", "secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Last-Modified", "Tue, 05 Mar 2024 14:30:00 GMT")
                    .set_body_bytes(test_jpeg()),
            )
            .mount(&server)
            .await;

        let mut settings = PullSettings::new(format!("{}/webcam/kspb/0", server.uri()));
        settings.source_type = Some(SourceType::Federated);
        settings.api_key = Some("secret".to_string());
        let source = PullSource::new(CameraId::new("kspb", 0), settings, Path::new("ffmpeg")).unwrap();

        let image = source.acquire().await.unwrap();
        assert_eq!(image.source, ImageSource::Federated);
        assert_eq!(image.captured_at, Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap());
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &TempDir, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("fake-ffmpeg");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        // give concurrently forked test processes time to drop the write handle
        std::thread::sleep(Duration::from_millis(50));
        path
    }

    #[cfg(unix)]
    fn rtsp_source(ffmpeg: &Path, max_runtime: u64) -> PullSource {
        let mut settings = PullSettings::new("rtsp://10.0.0.5:554/stream1");
        settings.rtsp_max_runtime_seconds = max_runtime;
        settings.username = Some("viewer".to_string());
        settings.password = Some("pw".to_string());
        PullSource::new(CameraId::new("kspb", 2), settings, ffmpeg).unwrap()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rtsp_runtime_overrun_is_transient() {
        let dir = TempDir::new().unwrap();
        let ffmpeg = fake_ffmpeg(&dir, "exec sleep 30");

        let started = std::time::Instant::now();
        let err = rtsp_source(&ffmpeg, 1).acquire().await.unwrap_err();

        assert!(matches!(err, IngestError::Timeout(d) if d == Duration::from_secs(1)));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rtsp_frame_from_stdout() {
        let dir = TempDir::new().unwrap();
        let frame_path = dir.path().join("frame.jpg");
        std::fs::write(&frame_path, test_jpeg()).unwrap();
        let ffmpeg = fake_ffmpeg(&dir, &format!("cat '{}'", frame_path.display()));

        let image = rtsp_source(&ffmpeg, 5).acquire().await.unwrap();
        assert_eq!(image.source, ImageSource::Rtsp);
        assert_eq!(image.bytes, test_jpeg());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rtsp_auth_failure_is_permanent() {
        let dir = TempDir::new().unwrap();
        let ffmpeg = fake_ffmpeg(
            &dir,
            "echo '[rtsp @ 0x1] method DESCRIBE failed: 401 Unauthorized' >&2; exit 1",
        );

        let err = rtsp_source(&ffmpeg, 5).acquire().await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permanent);
    }

    #[test]
    fn test_rtsp_credentials_injected() {
        let source = rtsp_source_plain();
        let url = source.rtsp_url().unwrap();
        assert_eq!(url, "rtsp://viewer:pw@10.0.0.5:554/stream1");
    }

    fn rtsp_source_plain() -> PullSource {
        let mut settings = PullSettings::new("rtsp://10.0.0.5:554/stream1");
        settings.username = Some("viewer".to_string());
        settings.password = Some("pw".to_string());
        PullSource::new(CameraId::new("kspb", 2), settings, Path::new("ffmpeg")).unwrap()
    }
}
