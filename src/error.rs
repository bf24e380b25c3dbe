use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("DNS resolution failed: {0}")]
    DnsFailed(String),

    #[error("Upstream returned HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    #[error("Frame capture failed: {0}")]
    CaptureFailed(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Error frame detected: {0}")]
    ErrorFrame(String),

    #[error("Clock drift rejected: {0}")]
    ClockDrift(String),

    #[error("Upload rejected: {0}")]
    RejectedUpload(String),

    #[error("Camera lock held by another run: {0}")]
    LockHeld(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    #[error("Image unavailable: {0}")]
    Unavailable(String),

    #[error("Worker crashed: {0}")]
    WorkerCrashed(String),
}

/// How a failure should be treated by the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network-level trouble likely to clear up on its own.
    Transient,
    /// Credentials or TLS problems that need a human.
    Permanent,
    /// The source answered but produced unusable data.
    Validation,
    /// Local trouble (disk, locks, crashed worker). No acquisition was judged.
    Infrastructure,
}

/// Severity persisted in the breaker state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Transient,
    Permanent,
}

impl IngestError {
    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Timeout(_)
            | IngestError::ConnectionFailed(_)
            | IngestError::DnsFailed(_)
            | IngestError::CaptureFailed(_) => ErrorClass::Transient,

            IngestError::HttpStatus { status, .. } => match *status {
                408 | 429 => ErrorClass::Transient,
                s if s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },

            IngestError::AuthFailed(_) | IngestError::TlsFailed(_) => ErrorClass::Permanent,

            IngestError::InvalidImage(_)
            | IngestError::ErrorFrame(_)
            | IngestError::ClockDrift(_)
            | IngestError::RejectedUpload(_) => ErrorClass::Validation,

            IngestError::LockHeld(_)
            | IngestError::IoError(_)
            | IngestError::SerializationError(_)
            | IngestError::ConfigurationError(_)
            | IngestError::UnknownCamera(_)
            | IngestError::Unavailable(_)
            | IngestError::WorkerCrashed(_) => ErrorClass::Infrastructure,
        }
    }

    /// `None` means the breaker must not be touched.
    pub fn severity(&self) -> Option<Severity> {
        match self.class() {
            ErrorClass::Transient | ErrorClass::Validation => Some(Severity::Transient),
            ErrorClass::Permanent => Some(Severity::Permanent),
            ErrorClass::Infrastructure => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Classify a reqwest failure. `timeout` is the budget the request ran under.
    pub fn from_http(err: &reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            return IngestError::Timeout(timeout);
        }

        if let Some(status) = err.status() {
            return IngestError::from_status(status.as_u16(), err.to_string());
        }

        let chain = error_chain_text(err);
        if chain.contains("dns")
            || chain.contains("failed to lookup")
            || chain.contains("name or service not known")
            || chain.contains("no such host")
        {
            return IngestError::DnsFailed(chain);
        }

        if chain.contains("certificate") || chain.contains("tls") || chain.contains("handshake") {
            return IngestError::TlsFailed(chain);
        }

        if err.is_connect() {
            return IngestError::ConnectionFailed(chain);
        }

        if err.is_body() || err.is_decode() {
            return IngestError::ConnectionFailed(chain);
        }

        IngestError::ConnectionFailed(chain)
    }

    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => IngestError::AuthFailed(format!("HTTP {status}")),
            _ => IngestError::HttpStatus { status, message },
        }
    }
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(inner) = source {
        parts.push(inner.to_string());
        source = inner.source();
    }
    parts.join(": ").to_lowercase()
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::SerializationError(err.to_string())
    }
}

/// Encode-side conversion. Decoding goes through `pipeline::decode`, which
/// treats every failure as a bad image.
impl From<image::ImageError> for IngestError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(e) => IngestError::IoError(e.to_string()),
            other => IngestError::InvalidImage(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(err: tokio::task::JoinError) -> Self {
        IngestError::WorkerCrashed(err.to_string())
    }
}
