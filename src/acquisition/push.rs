//! Push acquisition from a camera's upload directory.
//!
//! Uploads are scanned, checked for stability, then claimed one at a time by
//! renaming them into `<staging>/claimed/`. The rename is the claim: whoever
//! gets `Ok` owns the file, whoever gets `NotFound` lost the race. The staging
//! root must live on the same filesystem as the upload directories.

use super::{AcquiredImage, ImageSource};
use crate::config::{CameraId, PipelineConfig, PushDefaults, PushSettings};
use crate::error::IngestError;
use crate::utils::{age_of, extension_lower};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const CLAIM_SEPARATOR: &str = "__";

/// Effective push settings for one camera.
#[derive(Debug, Clone)]
pub struct PushPolicy {
    pub max_files_per_run: usize,
    pub newest_share: f64,
    pub stability_checks: u32,
    pub stability_poll: Duration,
    pub settled_age: Duration,
    pub run_timeout: Duration,
    pub backlog_threshold: usize,
    pub backlog_timeout_multiplier: u32,
    pub orphan_release_age: Duration,
    pub orphan_expire_age: Duration,
    pub max_file_size: u64,
    pub allowed_extensions: Vec<String>,
    pub future_tolerance: Duration,
}

impl PushPolicy {
    pub fn resolve(defaults: &PushDefaults, settings: &PushSettings, pipeline: &PipelineConfig) -> Self {
        let allowed_extensions = settings
            .allowed_extensions
            .clone()
            .unwrap_or_else(|| defaults.allowed_extensions.clone())
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();

        Self {
            max_files_per_run: defaults.max_files_per_run.max(1),
            newest_share: defaults.newest_share,
            stability_checks: defaults.stability_checks,
            stability_poll: Duration::from_millis(defaults.stability_poll_ms),
            settled_age: Duration::from_secs(defaults.settled_age_seconds),
            run_timeout: Duration::from_secs(defaults.run_timeout_seconds),
            backlog_threshold: defaults.backlog_threshold,
            backlog_timeout_multiplier: defaults.backlog_timeout_multiplier.max(1),
            orphan_release_age: Duration::from_secs(defaults.orphan_release_seconds),
            orphan_expire_age: Duration::from_secs(defaults.orphan_expire_seconds),
            max_file_size: settings
                .max_file_size_bytes
                .unwrap_or(defaults.max_file_size_bytes),
            allowed_extensions,
            future_tolerance: Duration::from_secs(pipeline.clock_future_tolerance_seconds),
        }
    }

    /// Time budget for a run with `pending` eligible files.
    pub fn run_budget(&self, pending: usize) -> Duration {
        if pending >= self.backlog_threshold {
            self.run_timeout * self.backlog_timeout_multiplier
        } else {
            self.run_timeout
        }
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        extension_lower(path)
            .map(|ext| self.allowed_extensions.iter().any(|a| a == &ext))
            .unwrap_or(false)
    }
}

/// An upload waiting in a camera's upload directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSelection {
    /// Files to process, in processing order.
    pub selected: Vec<StagingFile>,
    pub deferred: usize,
}

/// Pick the files for one run.
///
/// The `ceil(cap * newest_share)` newest files come first, newest first, so
/// the live image catches up quickly. The rest of the quota drains the backlog
/// from the oldest end. Everything in between waits for a later run.
pub fn select_batch(mut files: Vec<StagingFile>, cap: usize, newest_share: f64) -> BatchSelection {
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));

    let total = files.len();
    let take = total.min(cap);
    let newest_quota = ((cap as f64 * newest_share).ceil() as usize).min(take);
    let oldest_quota = take - newest_quota;

    let mut selected = Vec::with_capacity(take);
    let newest = files.split_off(total - newest_quota);
    selected.extend(newest.into_iter().rev());
    selected.extend(files.drain(..oldest_quota));

    BatchSelection {
        selected,
        deferred: total - take,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub stable: Vec<StagingFile>,
    pub unstable: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    pub released: usize,
    pub expired: usize,
    pub purged_rejects: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub claimed: usize,
    pub lost_races: usize,
    pub completed: usize,
    pub rejected: usize,
    pub released: usize,
}

/// A claimed upload and the image read from it.
#[derive(Debug)]
pub struct ClaimedUpload {
    pub image: AcquiredImage,
    pub claimed_path: PathBuf,
    pub original_name: String,
}

#[derive(Debug, Clone)]
pub struct PushSource {
    camera: CameraId,
    upload_dir: PathBuf,
    staging_dir: PathBuf,
    policy: PushPolicy,
}

impl PushSource {
    pub fn new(camera: CameraId, upload_dir: PathBuf, staging_dir: PathBuf, policy: PushPolicy) -> Self {
        Self {
            camera,
            upload_dir,
            staging_dir,
            policy,
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn claimed_dir(&self) -> PathBuf {
        self.staging_dir.join("claimed")
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.staging_dir.join("rejected")
    }

    pub fn policy(&self) -> &PushPolicy {
        &self.policy
    }

    pub async fn cleanup_orphans(&self) -> Result<OrphanReport, IngestError> {
        self.cleanup_orphans_at(SystemTime::now()).await
    }

    /// Hand stale claims back for re-claim, or delete them once the upload
    /// itself is too old to matter. Also purges old quarantined files.
    pub async fn cleanup_orphans_at(&self, now: SystemTime) -> Result<OrphanReport, IngestError> {
        let mut report = OrphanReport::default();

        for (path, name, modified) in list_files(&self.claimed_dir()).await? {
            let (claimed_at, original) = parse_claim_name(&name, modified);
            if age_of(claimed_at, now) < self.policy.orphan_release_age {
                continue;
            }

            if age_of(modified, now) >= self.policy.orphan_expire_age {
                if remove_if_present(&path).await? {
                    report.expired += 1;
                    debug!(camera = %self.camera, file = %name, "Deleted expired orphan");
                }
                continue;
            }

            let target = self.upload_dir.join(original);
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                // A newer upload took the name; the orphan is redundant.
                if remove_if_present(&path).await? {
                    report.expired += 1;
                }
                continue;
            }

            tokio::fs::create_dir_all(&self.upload_dir).await?;
            match tokio::fs::rename(&path, &target).await {
                Ok(()) => report.released += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        for (path, _, modified) in list_files(&self.rejected_dir()).await? {
            if age_of(modified, now) >= self.policy.orphan_expire_age && remove_if_present(&path).await? {
                report.purged_rejects += 1;
            }
        }

        if report.released > 0 || report.expired > 0 {
            info!(
                camera = %self.camera,
                released = report.released,
                expired = report.expired,
                "Cleaned up orphaned claims"
            );
        }
        Ok(report)
    }

    /// List stable, acceptable uploads. Unacceptable files are quarantined on the way.
    pub async fn scan(&self) -> Result<ScanResult, IngestError> {
        let now = SystemTime::now();
        let mut result = ScanResult::default();
        let mut settled = Vec::new();
        let mut young = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.upload_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(result),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !meta.is_file() {
                continue;
            }

            let path = entry.path();
            if !self.policy.extension_allowed(&path) {
                self.quarantine(&path, &name, "extension not allowed").await?;
                result.rejected += 1;
                continue;
            }
            if meta.len() > self.policy.max_file_size {
                self.quarantine(&path, &name, "file too large").await?;
                result.rejected += 1;
                continue;
            }

            let modified = meta.modified()?;
            if modified > now + self.policy.future_tolerance {
                self.quarantine(&path, &name, "timestamp in the future").await?;
                result.rejected += 1;
                continue;
            }

            let file = StagingFile {
                path,
                name,
                size: meta.len(),
                modified,
            };

            if age_of(file.modified, now) >= self.policy.settled_age {
                if file.size == 0 {
                    self.quarantine(&file.path, &file.name, "empty upload").await?;
                    result.rejected += 1;
                } else {
                    settled.push(file);
                }
            } else {
                young.push(file);
            }
        }

        for _ in 0..self.policy.stability_checks {
            if young.is_empty() {
                break;
            }
            tokio::time::sleep(self.policy.stability_poll).await;

            let mut unchanged = Vec::with_capacity(young.len());
            for file in young {
                match tokio::fs::metadata(&file.path).await {
                    Ok(meta)
                        if meta.len() == file.size && meta.modified().ok() == Some(file.modified) =>
                    {
                        unchanged.push(file)
                    }
                    _ => result.unstable += 1,
                }
            }
            young = unchanged;
        }

        for file in young {
            if file.size == 0 {
                result.unstable += 1;
            } else {
                settled.push(file);
            }
        }

        result.stable = settled;
        Ok(result)
    }

    pub async fn begin_batch(&self) -> Result<PushBatch, IngestError> {
        let scan = self.scan().await?;
        let pending = scan.stable.len();
        let budget = self.policy.run_budget(pending);
        let selection = select_batch(scan.stable, self.policy.max_files_per_run, self.policy.newest_share);

        if pending > 0 || scan.rejected > 0 {
            info!(
                camera = %self.camera,
                pending,
                selected = selection.selected.len(),
                deferred = selection.deferred,
                unstable = scan.unstable,
                rejected = scan.rejected,
                budget_secs = budget.as_secs(),
                "Push batch prepared"
            );
        }

        Ok(PushBatch {
            source: self.clone(),
            queue: selection.selected.into(),
            deferred: selection.deferred,
            deadline: Instant::now() + budget,
            stats: BatchStats {
                rejected: scan.rejected,
                ..Default::default()
            },
        })
    }

    async fn quarantine(&self, path: &Path, name: &str, reason: &str) -> Result<(), IngestError> {
        warn!(camera = %self.camera, file = %name, reason, "Rejecting upload");

        let rejected_dir = self.rejected_dir();
        tokio::fs::create_dir_all(&rejected_dir).await?;
        let target = rejected_dir.join(claim_name(SystemTime::now(), name));

        match tokio::fs::rename(path, &target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(_) => {
                remove_if_present(path).await?;
                Ok(())
            }
        }
    }
}

/// One run's worth of claimed uploads.
///
/// `acquire` checks the run deadline before each claim; a file that has been
/// handed out is always allowed to finish.
#[derive(Debug)]
pub struct PushBatch {
    source: PushSource,
    queue: VecDeque<StagingFile>,
    deferred: usize,
    deadline: Instant,
    stats: BatchStats,
}

impl PushBatch {
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn deferred(&self) -> usize {
        self.deferred
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    /// Claim and read the next upload. `None` when the batch is drained or out of time.
    pub async fn acquire(&mut self) -> Result<Option<ClaimedUpload>, IngestError> {
        loop {
            if self.queue.is_empty() {
                return Ok(None);
            }
            if Instant::now() >= self.deadline {
                let left = self.queue.len();
                self.deferred += left;
                self.queue.clear();
                warn!(camera = %self.source.camera, deferred = left, "Push run deadline reached");
                return Ok(None);
            }

            let Some(file) = self.queue.pop_front() else {
                return Ok(None);
            };

            let claimed_dir = self.source.claimed_dir();
            tokio::fs::create_dir_all(&claimed_dir).await?;
            let claimed_path = claimed_dir.join(claim_name(SystemTime::now(), &file.name));

            match tokio::fs::rename(&file.path, &claimed_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.stats.lost_races += 1;
                    debug!(camera = %self.source.camera, file = %file.name, "Upload claimed elsewhere");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
            self.stats.claimed += 1;

            let bytes = match tokio::fs::read(&claimed_path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    self.stats.lost_races += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            return Ok(Some(ClaimedUpload {
                image: AcquiredImage {
                    bytes,
                    captured_at: DateTime::<Utc>::from(file.modified),
                    source: ImageSource::Upload,
                },
                claimed_path,
                original_name: file.name,
            }));
        }
    }

    /// The upload was processed (published or superseded).
    pub async fn finish(&mut self, upload: ClaimedUpload) -> Result<(), IngestError> {
        remove_if_present(&upload.claimed_path).await?;
        self.stats.completed += 1;
        Ok(())
    }

    /// The upload is unusable. Keep it in quarantine for inspection.
    pub async fn reject(&mut self, upload: ClaimedUpload, error: &IngestError) -> Result<(), IngestError> {
        self.stats.rejected += 1;
        self.source
            .quarantine(&upload.claimed_path, &upload.original_name, &error.to_string())
            .await
    }

    /// Processing failed for local reasons. Hand the upload back for the next run.
    pub async fn release(&mut self, upload: ClaimedUpload) -> Result<(), IngestError> {
        let target = self.source.upload_dir.join(&upload.original_name);
        match tokio::fs::rename(&upload.claimed_path, &target).await {
            Ok(()) => {
                self.stats.released += 1;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn claim_name(at: SystemTime, original: &str) -> String {
    let millis = at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{millis}{CLAIM_SEPARATOR}{original}")
}

/// Split a claimed file name into claim time and original name.
/// Names without a valid prefix fall back to the file's mtime.
fn parse_claim_name(name: &str, fallback: SystemTime) -> (SystemTime, &str) {
    if let Some((prefix, original)) = name.split_once(CLAIM_SEPARATOR) {
        if let Ok(millis) = prefix.parse::<u64>() {
            return (UNIX_EPOCH + Duration::from_millis(millis), original);
        }
    }
    (fallback, name)
}

async fn list_files(dir: &Path) -> Result<Vec<(PathBuf, String, SystemTime)>, IngestError> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        files.push((
            entry.path(),
            entry.file_name().to_string_lossy().into_owned(),
            meta.modified()?,
        ));
    }
    Ok(files)
}

async fn remove_if_present(path: &Path) -> Result<bool, IngestError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
