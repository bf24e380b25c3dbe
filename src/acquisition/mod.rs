//! Image acquisition for pull and push cameras.
//!
//! Both modes produce [`AcquiredImage`] values through an `acquire` call. A pull
//! source yields one image per job; a push source opens a [`push::PushBatch`]
//! that yields one image per claimed upload.

pub mod mjpeg;
pub mod pull;
pub mod push;

use crate::config::{AcquisitionConfig, CameraConfig, Config};
use crate::error::IngestError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use pull::{detect_source_type, PullSource};
pub use push::{ClaimedUpload, PushBatch, PushPolicy, PushSource, StagingFile};

/// Where an image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    HttpStatic,
    Mjpeg,
    Rtsp,
    Federated,
    Upload,
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImageSource::HttpStatic => "http_static",
            ImageSource::Mjpeg => "mjpeg",
            ImageSource::Rtsp => "rtsp",
            ImageSource::Federated => "federated",
            ImageSource::Upload => "upload",
        };
        f.write_str(name)
    }
}

/// Raw encoded image plus the time the acquisition layer believes it was captured.
#[derive(Debug, Clone)]
pub struct AcquiredImage {
    pub bytes: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    pub source: ImageSource,
}

/// Acquisition strategy chosen by camera mode.
pub enum AcquisitionStrategy {
    Pull(PullSource),
    Push(PushSource),
}

impl AcquisitionStrategy {
    pub fn for_camera(camera: &CameraConfig, config: &Config) -> Result<Self, IngestError> {
        match &camera.acquisition {
            AcquisitionConfig::Pull(settings) => Ok(AcquisitionStrategy::Pull(PullSource::new(
                camera.id.clone(),
                settings.clone(),
                &config.ffmpeg_path,
            )?)),
            AcquisitionConfig::Push(settings) => {
                let policy = PushPolicy::resolve(&config.push, settings, &config.pipeline);
                Ok(AcquisitionStrategy::Push(PushSource::new(
                    camera.id.clone(),
                    config.upload_dir(&camera.id, settings),
                    config.staging_dir(&camera.id),
                    policy,
                )))
            }
        }
    }
}
