//! Atomic publication of processed images and the read side of the cache.
//!
//! Layout per camera:
//!
//! ```text
//! <cache_root>/<airport>/<index>/
//!     current -> generations/<gen>
//!     generations/
//!         <gen>/original.jpg, original.webp, 720.jpg, ..., manifest.json
//!         .tmp-<gen>/          (being written)
//! ```
//!
//! A generation is written completely under a temp name, renamed into place,
//! and only then made live by renaming a fresh symlink over `current`. Both
//! renames are atomic, so a reader following `current` always sees a whole
//! generation. Readers never lock.

use crate::acquisition::ImageSource;
use crate::config::CameraId;
use crate::error::IngestError;
use crate::pipeline::{file_name, OutputFormat, ProcessedImage, TimeOrigin, Variant};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const CURRENT: &str = "current";
const GENERATIONS: &str = "generations";
const MANIFEST: &str = "manifest.json";
const TEMP_PREFIX: &str = ".tmp-";
const LINK_TEMP_PREFIX: &str = "current.tmp-";
const READ_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub variant: Variant,
    pub format: OutputFormat,
    pub file: String,
    pub width: u32,
    pub height: u32,
    pub bytes: u64,
}

/// `manifest.json` of a published generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationManifest {
    pub generation: String,
    pub camera: CameraId,
    pub captured_at: DateTime<Utc>,
    pub published_at: DateTime<Utc>,
    pub source: ImageSource,
    pub time_origin: TimeOrigin,
    pub clock_drift_flagged: bool,
    pub width: u32,
    pub height: u32,
    pub files: Vec<ManifestFile>,
}

impl GenerationManifest {
    pub fn find(&self, variant: Variant, format: OutputFormat) -> Option<&ManifestFile> {
        self.files
            .iter()
            .find(|f| f.variant == variant && f.format == format)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { generation: String, files: usize, pruned: usize },
    /// The live generation is at least as new; nothing was promoted.
    Superseded { live_captured_at: DateTime<Utc> },
}

/// Writes generations and swaps them live. Blocking filesystem calls.
#[derive(Debug, Clone)]
pub struct Publisher {
    cache_root: PathBuf,
    keep_generations: usize,
}

impl Publisher {
    pub fn new(cache_root: &Path, keep_generations: usize) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            keep_generations: keep_generations.max(1),
        }
    }

    pub fn camera_dir(&self, camera: &CameraId) -> PathBuf {
        camera_dir(&self.cache_root, camera)
    }

    pub fn current_manifest(&self, camera: &CameraId) -> Result<Option<GenerationManifest>, IngestError> {
        let dir = self.camera_dir(camera);
        match resolve_current(&dir) {
            Ok(Some(generation_dir)) => match read_manifest(&generation_dir) {
                Ok(manifest) => Ok(Some(manifest)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
            Ok(None) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn publish(&self, camera: &CameraId, processed: &ProcessedImage) -> Result<PublishOutcome, IngestError> {
        if let Some(live) = self.current_manifest(camera)? {
            if processed.captured_at <= live.captured_at {
                debug!(
                    camera = %camera,
                    captured_at = %processed.captured_at,
                    live = %live.captured_at,
                    "Not newer than live generation, skipping promotion"
                );
                return Ok(PublishOutcome::Superseded {
                    live_captured_at: live.captured_at,
                });
            }
        }

        let camera_dir = self.camera_dir(camera);
        let generations = camera_dir.join(GENERATIONS);
        fs::create_dir_all(&generations)?;

        let generation = generation_id(processed.captured_at);
        let temp_dir = generations.join(format!("{TEMP_PREFIX}{generation}"));
        let final_dir = generations.join(&generation);

        if let Err(e) = self.write_generation(&temp_dir, camera, &generation, processed) {
            let _ = fs::remove_dir_all(&temp_dir);
            return Err(e);
        }
        fs::rename(&temp_dir, &final_dir)?;

        let link_target = Path::new(GENERATIONS).join(&generation);
        let temp_link = camera_dir.join(format!("{LINK_TEMP_PREFIX}{generation}"));
        let _ = fs::remove_file(&temp_link);
        symlink(&link_target, &temp_link)?;
        fs::rename(&temp_link, camera_dir.join(CURRENT))?;

        let pruned = self.prune(&generations, &generation)?;

        info!(
            camera = %camera,
            generation = %generation,
            files = processed.renditions.len(),
            captured_at = %processed.captured_at,
            "Published generation"
        );

        Ok(PublishOutcome::Published {
            generation,
            files: processed.renditions.len(),
            pruned,
        })
    }

    fn write_generation(
        &self,
        dir: &Path,
        camera: &CameraId,
        generation: &str,
        processed: &ProcessedImage,
    ) -> Result<(), IngestError> {
        fs::create_dir_all(dir)?;
        let mtime = SystemTime::from(processed.captured_at);
        let mut files = Vec::with_capacity(processed.renditions.len());

        for rendition in &processed.renditions {
            let name = rendition.file_name();
            write_file(&dir.join(&name), &rendition.bytes, mtime)?;
            files.push(ManifestFile {
                variant: rendition.variant,
                format: rendition.format,
                file: name,
                width: rendition.width,
                height: rendition.height,
                bytes: rendition.bytes.len() as u64,
            });
        }

        let manifest = GenerationManifest {
            generation: generation.to_string(),
            camera: camera.clone(),
            captured_at: processed.captured_at,
            published_at: Utc::now(),
            source: processed.source,
            time_origin: processed.time_origin,
            clock_drift_flagged: processed.clock_drift_flagged,
            width: processed.width,
            height: processed.height,
            files,
        };
        write_file(&dir.join(MANIFEST), &serde_json::to_vec_pretty(&manifest)?, mtime)?;
        Ok(())
    }

    /// Keep the newest `keep_generations` plus the live one.
    fn prune(&self, generations: &Path, live: &str) -> Result<usize, IngestError> {
        let mut names: Vec<String> = fs::read_dir(generations)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .collect();
        names.sort();

        let excess = names.len().saturating_sub(self.keep_generations);
        let mut pruned = 0;
        for name in names.into_iter().take(excess) {
            if name == live {
                continue;
            }
            match fs::remove_dir_all(generations.join(&name)) {
                Ok(()) => pruned += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(generation = %name, error = %e, "Failed to prune generation"),
            }
        }
        Ok(pruned)
    }

    /// Remove temp generation dirs and temp links left by a crashed publisher.
    pub fn cleanup_temp(&self, camera: &CameraId, older_than: Duration) -> Result<usize, IngestError> {
        let now = SystemTime::now();
        let camera_dir = self.camera_dir(camera);
        let mut removed = 0;

        for entry in read_dir_entries(&camera_dir.join(GENERATIONS))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(TEMP_PREFIX) || !is_older(&entry.path(), now, older_than) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        for entry in read_dir_entries(&camera_dir)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(LINK_TEMP_PREFIX) || !is_older(&entry.path(), now, older_than) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed > 0 {
            info!(camera = %camera, removed, "Removed abandoned publication temp files");
        }
        Ok(removed)
    }
}

/// How current a served image is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Within the camera's refresh interval.
    Fresh,
    /// Older than one refresh, still within max staleness. A refresh is pending.
    Stale,
}

#[derive(Debug, Clone)]
pub struct CachedImage {
    pub bytes: Vec<u8>,
    pub generation: String,
    pub captured_at: DateTime<Utc>,
    pub age: Duration,
    pub freshness: Freshness,
    pub variant: Variant,
    pub format: OutputFormat,
}

/// Lock-free reader over the published cache.
#[derive(Debug, Clone)]
pub struct CacheReader {
    cache_root: PathBuf,
    max_staleness: Duration,
}

impl CacheReader {
    pub fn new(cache_root: &Path, max_staleness: Duration) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            max_staleness,
        }
    }

    /// `None` means the image is too old to serve.
    pub fn freshness(&self, captured_at: DateTime<Utc>, refresh: Duration, now: DateTime<Utc>) -> Option<Freshness> {
        let age = age_since(captured_at, now);
        if age <= refresh {
            Some(Freshness::Fresh)
        } else if age <= self.max_staleness {
            Some(Freshness::Stale)
        } else {
            None
        }
    }

    pub fn manifest(&self, camera: &CameraId) -> Result<GenerationManifest, IngestError> {
        let dir = camera_dir(&self.cache_root, camera);
        for _ in 0..READ_ATTEMPTS {
            let Some(generation_dir) = resolve_current(&dir)? else {
                return Err(IngestError::Unavailable(format!("{camera}: nothing published")));
            };
            match read_manifest(&generation_dir) {
                Ok(manifest) => return Ok(manifest),
                // pruned between readlink and open; follow the link again
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(IngestError::Unavailable(format!("{camera}: generation churn")))
    }

    /// Read one rendition of the live generation.
    ///
    /// A variant the source was too small for falls back to `original`.
    /// Images older than max staleness are never returned.
    pub fn read(
        &self,
        camera: &CameraId,
        variant: Variant,
        format: OutputFormat,
        refresh: Duration,
        now: DateTime<Utc>,
    ) -> Result<CachedImage, IngestError> {
        let dir = camera_dir(&self.cache_root, camera);

        for _ in 0..READ_ATTEMPTS {
            let Some(generation_dir) = resolve_current(&dir)? else {
                return Err(IngestError::Unavailable(format!("{camera}: nothing published")));
            };
            let manifest = match read_manifest(&generation_dir) {
                Ok(manifest) => manifest,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let Some(freshness) = self.freshness(manifest.captured_at, refresh, now) else {
                return Err(IngestError::Unavailable(format!(
                    "{camera}: image from {} exceeds max staleness",
                    manifest.captured_at
                )));
            };

            let entry = manifest
                .find(variant, format)
                .or_else(|| manifest.find(Variant::Original, format))
                .ok_or_else(|| {
                    IngestError::Unavailable(format!("{camera}: no {} rendition", file_name(variant, format)))
                })?;

            match fs::read(generation_dir.join(&entry.file)) {
                Ok(bytes) => {
                    return Ok(CachedImage {
                        bytes,
                        generation: manifest.generation.clone(),
                        captured_at: manifest.captured_at,
                        age: age_since(manifest.captured_at, now),
                        freshness,
                        variant: entry.variant,
                        format: entry.format,
                    })
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(IngestError::Unavailable(format!("{camera}: generation churn")))
    }

    /// Read every file of the live generation.
    pub fn read_generation(&self, camera: &CameraId) -> Result<(GenerationManifest, Vec<(String, Vec<u8>)>), IngestError> {
        let dir = camera_dir(&self.cache_root, camera);

        'attempt: for _ in 0..READ_ATTEMPTS {
            let Some(generation_dir) = resolve_current(&dir)? else {
                return Err(IngestError::Unavailable(format!("{camera}: nothing published")));
            };
            let manifest = match read_manifest(&generation_dir) {
                Ok(manifest) => manifest,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            let mut files = Vec::with_capacity(manifest.files.len());
            for entry in &manifest.files {
                match fs::read(generation_dir.join(&entry.file)) {
                    Ok(bytes) => files.push((entry.file.clone(), bytes)),
                    Err(e) if e.kind() == ErrorKind::NotFound => continue 'attempt,
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok((manifest, files));
        }

        Err(IngestError::Unavailable(format!("{camera}: generation churn")))
    }
}

fn camera_dir(cache_root: &Path, camera: &CameraId) -> PathBuf {
    cache_root
        .join(crate::utils::sanitize_filename(&camera.airport))
        .join(camera.index.to_string())
}

/// Follow `current`. `None` when nothing has been published.
fn resolve_current(camera_dir: &Path) -> std::io::Result<Option<PathBuf>> {
    match fs::read_link(camera_dir.join(CURRENT)) {
        Ok(target) => Ok(Some(camera_dir.join(target))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_manifest(generation_dir: &Path) -> std::io::Result<GenerationManifest> {
    let bytes = fs::read(generation_dir.join(MANIFEST))?;
    serde_json::from_slice(&bytes).map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
}

fn write_file(path: &Path, bytes: &[u8], mtime: SystemTime) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.set_modified(mtime)?;
    file.sync_all()
}

fn generation_id(captured_at: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", captured_at.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

fn read_dir_entries(dir: &Path) -> Result<Vec<fs::DirEntry>, IngestError> {
    match fs::read_dir(dir) {
        Ok(entries) => Ok(entries.filter_map(|e| e.ok()).collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn is_older(path: &Path, now: SystemTime, age: Duration) -> bool {
    fs::symlink_metadata(path)
        .and_then(|m| m.modified())
        .map(|modified| crate::utils::age_of(modified, now) >= age)
        .unwrap_or(false)
}

fn age_since(captured_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - captured_at).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Rendition;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn processed(captured_at: DateTime<Utc>, marker: u8) -> ProcessedImage {
        let renditions = [
            (Variant::Original, OutputFormat::Jpeg, 1280, 720),
            (Variant::Original, OutputFormat::Webp, 1280, 720),
            (Variant::Height(360), OutputFormat::Jpeg, 640, 360),
            (Variant::Height(360), OutputFormat::Webp, 640, 360),
        ]
        .into_iter()
        .map(|(variant, format, width, height)| Rendition {
            variant,
            format,
            width,
            height,
            bytes: vec![marker; (width / 10) as usize],
        })
        .collect();

        ProcessedImage {
            captured_at,
            time_origin: TimeOrigin::Exif,
            clock_drift_flagged: false,
            source: ImageSource::HttpStatic,
            width: 1280,
            height: 720,
            renditions,
        }
    }

    #[test]
    fn test_publish_creates_live_generation() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        let camera = CameraId::new("kspb", 0);
        let captured = Utc::now() - ChronoDuration::seconds(30);

        let outcome = publisher.publish(&camera, &processed(captured, 1)).unwrap();
        let PublishOutcome::Published { generation, files, .. } = outcome else {
            panic!("expected publication");
        };
        assert_eq!(files, 4);

        let current = publisher.camera_dir(&camera).join("current");
        assert!(fs::symlink_metadata(&current).unwrap().file_type().is_symlink());
        assert!(current.join("original.jpg").exists());
        assert!(current.join("360.webp").exists());

        let manifest = publisher.current_manifest(&camera).unwrap().unwrap();
        assert_eq!(manifest.generation, generation);
        assert_eq!(manifest.files.len(), 4);

        let mtime = fs::metadata(current.join("original.jpg")).unwrap().modified().unwrap();
        let expected = SystemTime::from(captured);
        let skew = mtime
            .duration_since(expected)
            .unwrap_or_else(|e| e.duration());
        assert!(skew < Duration::from_millis(1));
    }

    #[test]
    fn test_older_capture_is_superseded() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        let camera = CameraId::new("kspb", 0);
        let newer = Utc::now();

        publisher.publish(&camera, &processed(newer, 1)).unwrap();
        let outcome = publisher
            .publish(&camera, &processed(newer - ChronoDuration::minutes(5), 2))
            .unwrap();
        assert_eq!(outcome, PublishOutcome::Superseded { live_captured_at: newer });

        let outcome = publisher.publish(&camera, &processed(newer, 3)).unwrap();
        assert!(matches!(outcome, PublishOutcome::Superseded { .. }));
    }

    #[test]
    fn test_old_generations_pruned() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        let camera = CameraId::new("kspb", 0);
        let start = Utc::now() - ChronoDuration::hours(1);

        for i in 0..6 {
            publisher
                .publish(&camera, &processed(start + ChronoDuration::minutes(i), i as u8))
                .unwrap();
        }

        let generations = publisher.camera_dir(&camera).join("generations");
        assert_eq!(fs::read_dir(&generations).unwrap().count(), 3);
        let manifest = publisher.current_manifest(&camera).unwrap().unwrap();
        assert_eq!(manifest.captured_at, start + ChronoDuration::minutes(5));
    }

    #[test]
    fn test_cleanup_temp_removes_abandoned_dirs() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        let camera = CameraId::new("kspb", 0);
        let generations = publisher.camera_dir(&camera).join("generations");
        fs::create_dir_all(generations.join(".tmp-crashed")).unwrap();
        fs::write(generations.join(".tmp-crashed/original.jpg"), b"partial").unwrap();

        assert_eq!(publisher.cleanup_temp(&camera, Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(publisher.cleanup_temp(&camera, Duration::ZERO).unwrap(), 1);
        assert!(!generations.join(".tmp-crashed").exists());
    }

    #[test]
    fn test_reader_freshness_and_fail_closed() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        let reader = CacheReader::new(dir.path(), Duration::from_secs(7200));
        let camera = CameraId::new("kspb", 0);
        let captured = Utc::now() - ChronoDuration::minutes(10);
        publisher.publish(&camera, &processed(captured, 9)).unwrap();

        let refresh = Duration::from_secs(60);
        let fresh = reader
            .read(&camera, Variant::Height(360), OutputFormat::Jpeg, refresh, captured + ChronoDuration::seconds(30))
            .unwrap();
        assert_eq!(fresh.freshness, Freshness::Fresh);
        assert_eq!(fresh.bytes, vec![9u8; 64]);

        let stale = reader
            .read(&camera, Variant::Original, OutputFormat::Webp, refresh, captured + ChronoDuration::minutes(30))
            .unwrap();
        assert_eq!(stale.freshness, Freshness::Stale);

        let err = reader
            .read(&camera, Variant::Original, OutputFormat::Jpeg, refresh, captured + ChronoDuration::hours(3))
            .unwrap_err();
        assert!(matches!(err, IngestError::Unavailable(_)));
    }

    #[test]
    fn test_reader_falls_back_to_original() {
        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(dir.path(), 3);
        let reader = CacheReader::new(dir.path(), Duration::from_secs(7200));
        let camera = CameraId::new("kspb", 0);
        let captured = Utc::now();
        publisher.publish(&camera, &processed(captured, 4)).unwrap();

        let image = reader
            .read(&camera, Variant::Height(1080), OutputFormat::Jpeg, Duration::from_secs(60), captured)
            .unwrap();
        assert_eq!(image.variant, Variant::Original);
    }

    #[test]
    fn test_reader_unpublished_camera() {
        let dir = TempDir::new().unwrap();
        let reader = CacheReader::new(dir.path(), Duration::from_secs(7200));
        let err = reader.manifest(&CameraId::new("none", 0)).unwrap_err();
        assert!(matches!(err, IngestError::Unavailable(_)));
    }

    #[test]
    fn test_concurrent_reader_sees_complete_generations() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        let camera = CameraId::new("kspb", 0);
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let root = root.clone();
            let camera = camera.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let publisher = Publisher::new(&root, 2);
                let start = Utc::now() - ChronoDuration::hours(1);
                for i in 0..40u8 {
                    publisher
                        .publish(&camera, &processed(start + ChronoDuration::seconds(i as i64), i))
                        .unwrap();
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let reader = CacheReader::new(&root, Duration::from_secs(7200));
        let mut observed = 0;
        while !done.load(Ordering::SeqCst) {
            match reader.read_generation(&camera) {
                Ok((manifest, files)) => {
                    assert_eq!(files.len(), manifest.files.len());
                    assert_eq!(files.len(), 4);
                    // every file of one observation belongs to the same generation
                    let marker = files[0].1[0];
                    for ((name, bytes), entry) in files.iter().zip(&manifest.files) {
                        assert_eq!(name, &entry.file);
                        assert_eq!(bytes.len() as u64, entry.bytes);
                        assert!(bytes.iter().all(|b| *b == marker));
                    }
                    observed += 1;
                }
                Err(IngestError::Unavailable(_)) => {}
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }

        writer.join().unwrap();
        let (manifest, files) = reader.read_generation(&camera).unwrap();
        assert_eq!(manifest.files.len(), 4);
        assert!(files.iter().all(|(_, bytes)| bytes[0] == 39));
        tracing::debug!(observed, "reader observations during publication");
    }
}
