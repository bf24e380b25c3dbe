//! # Webcam Ingest
//!
//! Scheduled acquisition, processing and publication of airport webcam images.
//! A long-running scheduler dispatches one bounded job per camera per refresh
//! interval into a fixed-size pool. Each job acquires an image, checks it,
//! renders size and format variants, and publishes them atomically to a
//! per-camera cache that readers can consume at any time.
//!
//! ## Architecture
//!
//! | Component | Role |
//! |-----------|------|
//! | **Scheduler** | Min-heap of due times, single owner of camera state, hot reload |
//! | **Process pool** | Fixed slots, reject-on-full, task or child-process isolation |
//! | **Circuit breaker** | Per-camera failure counts and class-based exponential backoff, persisted |
//! | **Lock manager** | Advisory file lock per camera, released on process death |
//! | **Acquisition** | Pull (HTTP still, MJPEG, RTSP via ffmpeg, federated API) and push (upload directory) |
//! | **Pipeline** | Decode, error-frame detection, EXIF time and orientation, variants, JPEG/WebP |
//! | **Publisher** | Generation directories behind an atomically swapped `current` symlink |
//!
//! ## Job lifecycle
//!
//! 1. The scheduler pops a due camera and reschedules it optimistically.
//! 2. The pool accepts the job if a slot is free, otherwise the camera is retried next tick.
//! 3. The worker checks the breaker and takes the camera lock.
//! 4. The image is acquired, processed and published.
//! 5. The outcome updates the breaker. A backoff pushes the camera's due time out.
//!
//! ## Reading the cache
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::time::Duration;
//! use webcam_ingest::{CacheReader, CameraId, OutputFormat, Variant};
//!
//! let reader = CacheReader::new(Path::new("/var/lib/webcam-ingest/cache"), Duration::from_secs(7200));
//! let image = reader.read(
//!     &CameraId::new("kspb", 0),
//!     Variant::Height(720),
//!     OutputFormat::Jpeg,
//!     Duration::from_secs(60),
//!     chrono::Utc::now(),
//! )?;
//! println!("{} bytes, {:?}", image.bytes.len(), image.freshness);
//! # Ok::<(), webcam_ingest::IngestError>(())
//! ```
//!
//! ## Platform
//!
//! Unix only. Publication swaps a `current` symlink, camera locks are
//! `flock`-style advisory locks, and the daemon stops on `SIGTERM`.
//!
//! ## CLI Usage
//!
//! ```bash
//! webcam-ingest --config /etc/webcam-ingest/config.json run --metrics-port 9090
//! webcam-ingest --config /etc/webcam-ingest/config.json worker --airport kspb --camera 0
//! webcam-ingest --config /etc/webcam-ingest/config.json status
//! ```

#[cfg(not(unix))]
compile_error!("webcam-ingest publishes through symlinks and supports Unix platforms only");

/// Configuration and settings for the ingestion daemon
pub mod config;

/// Error types and failure classification
pub mod error;

/// Pull and push image acquisition
pub mod acquisition;

/// Image validation, capture time resolution and variant rendering
pub mod pipeline;

/// Atomic generation publication and cache reads
pub mod publisher;

/// Persistent per-camera circuit breaker
pub mod circuit_breaker;

/// Cross-process camera locks
pub mod lock_manager;

/// Single-camera job execution
pub mod worker;

/// Bounded job pool with task or process isolation
pub mod process_pool;

/// Due-time scheduler and config hot reload
pub mod scheduler;

/// Command-line interface implementation
pub mod cli;

/// Prometheus metrics and health thresholds
pub mod metrics;

/// Camera status and system health checks
pub mod health;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use acquisition::*;
pub use circuit_breaker::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use lock_manager::*;
pub use metrics::*;
pub use pipeline::*;
pub use process_pool::*;
pub use publisher::*;
pub use scheduler::*;
pub use utils::*;
pub use worker::*;
