//! Cross-process per-camera locks.
//!
//! A job holds an exclusive `flock` on `<state_dir>/locks/<airport>_<index>.lock`
//! for its whole run. The kernel drops the lock when the holder exits, so a
//! crashed worker never leaves a camera locked. Contention is never waited on:
//! the caller skips the tick instead.

use crate::config::CameraId;
use crate::error::IngestError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
}

impl LockManager {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("locks"),
        }
    }

    pub fn lock_path(&self, camera: &CameraId) -> PathBuf {
        self.dir.join(format!("{}.lock", camera.file_stem()))
    }

    /// Take the camera's lock without blocking.
    ///
    /// Returns `IngestError::LockHeld` when another process or task holds it.
    pub fn try_acquire(&self, camera: &CameraId) -> Result<WorkerLock, IngestError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(camera);

        // Never truncate before the lock is ours; the holder's pid lives in there.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                trace!(camera = %camera, "Camera lock is held elsewhere");
                return Err(IngestError::LockHeld(camera.to_string()));
            }
            return Err(e.into());
        }

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!(camera = %camera, path = %path.display(), "Acquired camera lock");
        Ok(WorkerLock {
            file,
            camera: camera.clone(),
            acquired_at: Instant::now(),
        })
    }

    /// Whether some holder currently owns the camera's lock.
    pub fn is_locked(&self, camera: &CameraId) -> Result<bool, IngestError> {
        match self.try_acquire(camera) {
            Ok(_guard) => Ok(false),
            Err(IngestError::LockHeld(_)) => Ok(true),
            Err(e) => Err(e),
        }
    }
}

/// RAII guard over a camera lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct WorkerLock {
    file: File,
    camera: CameraId,
    acquired_at: Instant,
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(
            camera = %self.camera,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "Released camera lock"
        );
    }
}
