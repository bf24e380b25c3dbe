//! Persistent per-camera circuit breaker.
//!
//! Each camera has one JSON record under `<state_dir>/breaker/`. The record is
//! read before a job acquires anything and rewritten after every attempt.
//! Writes go through a temp file and a rename so a crash never leaves a torn
//! record behind.
//!
//! State is derived from the record rather than stored:
//!
//! | State | Condition |
//! |-------|-----------|
//! | `Closed` | no failures recorded |
//! | `Open` | `now < backoff_until` |
//! | `HalfOpen` | failures recorded, backoff elapsed |

use crate::config::{BreakerConfig, CameraId};
use crate::error::{ErrorClass, IngestError, Severity};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Persisted breaker record for one camera.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerState {
    pub failures: u32,
    pub severity: Option<Severity>,
    /// Unix seconds. Zero means no backoff.
    pub backoff_until: i64,
    pub consecutive_successes: u32,
    /// Unix seconds. Zero means never failed.
    pub last_failure_at: i64,
    pub last_error: Option<String>,
}

impl CircuitBreakerState {
    pub fn state(&self, now: DateTime<Utc>) -> CircuitState {
        if self.failures == 0 {
            CircuitState::Closed
        } else if now.timestamp() < self.backoff_until {
            CircuitState::Open
        } else {
            CircuitState::HalfOpen
        }
    }

    pub fn backoff_until_time(&self) -> Option<DateTime<Utc>> {
        if self.backoff_until <= 0 {
            return None;
        }
        Utc.timestamp_opt(self.backoff_until, 0).single()
    }

    pub fn backoff_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        let remaining = self.backoff_until - now.timestamp();
        (remaining > 0).then(|| Duration::from_secs(remaining as u64))
    }

    pub fn apply_success(&mut self) {
        self.failures = 0;
        self.severity = None;
        self.backoff_until = 0;
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.last_error = None;
    }

    pub fn apply_failure(
        &mut self,
        severity: Severity,
        backoff: Duration,
        message: String,
        now: DateTime<Utc>,
    ) {
        self.failures = self.failures.saturating_add(1);
        self.severity = Some(severity);
        self.consecutive_successes = 0;
        self.last_failure_at = now.timestamp();
        self.last_error = Some(message);

        let candidate = now.timestamp().saturating_add(backoff.as_secs() as i64);
        self.backoff_until = self.backoff_until.max(candidate);
    }
}

/// Exponential backoff schedule per error class.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BreakerConfig,
}

impl BackoffPolicy {
    pub fn new(config: BreakerConfig) -> Self {
        Self { config }
    }

    /// Backoff after the `failures`-th consecutive failure (1-based).
    pub fn backoff_for(&self, class: ErrorClass, failures: u32) -> Duration {
        let (base, cap) = match class {
            ErrorClass::Permanent => (
                self.config.permanent_base_seconds,
                self.config.permanent_cap_seconds,
            ),
            ErrorClass::Validation => (
                self.config.validation_base_seconds,
                self.config.transient_cap_seconds,
            ),
            ErrorClass::Transient | ErrorClass::Infrastructure => (
                self.config.transient_base_seconds,
                self.config.transient_cap_seconds,
            ),
        };

        let exponent = failures.saturating_sub(1).min(32);
        let multiplier = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        Duration::from_secs(base.saturating_mul(multiplier).min(cap))
    }
}

/// File-backed breaker store.
///
/// Callers hold the camera's `WorkerLock` while recording, so there is a
/// single writer per record. Readers (status, health, scheduler seeding) may
/// race a writer but always see a complete file.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    dir: PathBuf,
    policy: BackoffPolicy,
}

impl CircuitBreaker {
    pub fn new(state_dir: &Path, config: &BreakerConfig) -> Self {
        Self {
            dir: state_dir.join("breaker"),
            policy: BackoffPolicy::new(config.clone()),
        }
    }

    pub fn record_path(&self, camera: &CameraId) -> PathBuf {
        self.dir.join(format!("{}.json", camera.file_stem()))
    }

    /// Load a camera's record. Missing records are `Closed`.
    ///
    /// A record that fails to parse is logged and treated as `Closed`, so a
    /// damaged file cannot block a camera forever.
    pub async fn load(&self, camera: &CameraId) -> Result<CircuitBreakerState, IngestError> {
        let path = self.record_path(camera);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => Ok(state),
                Err(e) => {
                    warn!(camera = %camera, path = %path.display(), error = %e, "Corrupt breaker record, treating as closed");
                    Ok(CircuitBreakerState::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(CircuitBreakerState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn can_execute(&self, camera: &CameraId, now: DateTime<Utc>) -> Result<bool, IngestError> {
        let state = self.load(camera).await?;
        Ok(state.state(now) != CircuitState::Open)
    }

    pub async fn record_success(&self, camera: &CameraId) -> Result<CircuitBreakerState, IngestError> {
        let mut state = self.load(camera).await?;
        let was_failing = state.failures > 0;
        state.apply_success();
        self.save(camera, &state).await?;

        if was_failing {
            info!(camera = %camera, "Circuit breaker closed after successful attempt");
        }
        Ok(state)
    }

    /// Record a failed attempt. Infrastructure errors are not recorded and return `None`.
    pub async fn record_failure(
        &self,
        camera: &CameraId,
        error: &IngestError,
        now: DateTime<Utc>,
    ) -> Result<Option<CircuitBreakerState>, IngestError> {
        let Some(severity) = error.severity() else {
            debug!(camera = %camera, error = %error, "Infrastructure failure, breaker untouched");
            return Ok(None);
        };

        let mut state = self.load(camera).await?;
        let backoff = self.policy.backoff_for(error.class(), state.failures.saturating_add(1));
        state.apply_failure(severity, backoff, error.to_string(), now);
        self.save(camera, &state).await?;

        warn!(
            camera = %camera,
            failures = state.failures,
            severity = ?severity,
            backoff_secs = backoff.as_secs(),
            error = %error,
            "Circuit breaker recorded failure"
        );
        Ok(Some(state))
    }

    async fn save(&self, camera: &CameraId, state: &CircuitBreakerState) -> Result<(), IngestError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.record_path(camera);
        let tmp = path.with_extension(format!("json.tmp-{}", std::process::id()));
        let bytes = serde_json::to_vec_pretty(state)?;

        tokio::fs::write(&tmp, &bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(BreakerConfig::default())
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = policy();
        assert_eq!(policy.backoff_for(ErrorClass::Transient, 1), Duration::from_secs(60));
        assert_eq!(policy.backoff_for(ErrorClass::Transient, 2), Duration::from_secs(120));
        assert_eq!(policy.backoff_for(ErrorClass::Transient, 3), Duration::from_secs(240));
        assert_eq!(policy.backoff_for(ErrorClass::Transient, 7), Duration::from_secs(3600));
        assert_eq!(policy.backoff_for(ErrorClass::Transient, 500), Duration::from_secs(3600));
    }

    #[test]
    fn test_backoff_per_class() {
        let policy = policy();
        assert_eq!(policy.backoff_for(ErrorClass::Permanent, 1), Duration::from_secs(120));
        assert_eq!(policy.backoff_for(ErrorClass::Permanent, 10), Duration::from_secs(7200));
        assert_eq!(policy.backoff_for(ErrorClass::Validation, 1), Duration::from_secs(30));
        assert_eq!(policy.backoff_for(ErrorClass::Validation, 20), Duration::from_secs(3600));
    }

    #[test]
    fn test_backoff_until_never_decreases() {
        let policy = policy();
        let now = Utc::now();
        let mut state = CircuitBreakerState::default();
        let mut previous = 0;

        for attempt in 0..12 {
            // attempts land at irregular times, some before the backoff expires
            let at = now + ChronoDuration::seconds(attempt * 45);
            let backoff = policy.backoff_for(ErrorClass::Transient, state.failures + 1);
            state.apply_failure(Severity::Transient, backoff, "timeout".into(), at);
            assert!(state.backoff_until >= previous);
            previous = state.backoff_until;
        }
        assert_eq!(state.failures, 12);
    }

    #[test]
    fn test_short_backoff_does_not_shorten_long_one() {
        let now = Utc::now();
        let mut state = CircuitBreakerState::default();
        state.apply_failure(Severity::Permanent, Duration::from_secs(7200), "401".into(), now);
        let long = state.backoff_until;

        state.apply_failure(Severity::Transient, Duration::from_secs(30), "blank frame".into(), now);
        assert_eq!(state.backoff_until, long);
    }

    #[test]
    fn test_success_resets() {
        let now = Utc::now();
        let mut state = CircuitBreakerState::default();
        state.apply_failure(Severity::Transient, Duration::from_secs(60), "timeout".into(), now);
        state.apply_failure(Severity::Transient, Duration::from_secs(120), "timeout".into(), now);
        assert_eq!(state.state(now), CircuitState::Open);

        state.apply_success();
        assert_eq!(state.failures, 0);
        assert_eq!(state.backoff_until, 0);
        assert_eq!(state.severity, None);
        assert_eq!(state.state(now), CircuitState::Closed);
        assert_eq!(state.consecutive_successes, 1);
    }

    #[test]
    fn test_half_open_after_backoff() {
        let now = Utc::now();
        let mut state = CircuitBreakerState::default();
        state.apply_failure(Severity::Transient, Duration::from_secs(60), "timeout".into(), now);

        assert_eq!(state.state(now + ChronoDuration::seconds(59)), CircuitState::Open);
        assert_eq!(state.state(now + ChronoDuration::seconds(60)), CircuitState::HalfOpen);
        assert!(state.backoff_remaining(now + ChronoDuration::seconds(61)).is_none());
    }

    #[tokio::test]
    async fn test_store_round_trip_and_reset() {
        let dir = TempDir::new().unwrap();
        let breaker = CircuitBreaker::new(dir.path(), &BreakerConfig::default());
        let camera = CameraId::new("kspb", 0);
        let now = Utc::now();

        assert!(breaker.can_execute(&camera, now).await.unwrap());

        let err = IngestError::Timeout(Duration::from_secs(15));
        let state = breaker.record_failure(&camera, &err, now).await.unwrap().unwrap();
        assert_eq!(state.failures, 1);
        assert_eq!(state.backoff_until, now.timestamp() + 60);
        assert!(!breaker.can_execute(&camera, now).await.unwrap());
        assert!(breaker.record_path(&camera).exists());

        let state = breaker.record_failure(&camera, &err, now).await.unwrap().unwrap();
        assert_eq!(state.backoff_until, now.timestamp() + 120);

        let state = breaker.record_success(&camera).await.unwrap();
        assert_eq!(state.backoff_until, 0);
        assert_eq!(breaker.load(&camera).await.unwrap().failures, 0);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_not_recorded() {
        let dir = TempDir::new().unwrap();
        let breaker = CircuitBreaker::new(dir.path(), &BreakerConfig::default());
        let camera = CameraId::new("kspb", 1);

        let err = IngestError::IoError("No space left on device".into());
        let recorded = breaker.record_failure(&camera, &err, Utc::now()).await.unwrap();
        assert!(recorded.is_none());
        assert!(!breaker.record_path(&camera).exists());
    }

    #[tokio::test]
    async fn test_corrupt_record_treated_as_closed() {
        let dir = TempDir::new().unwrap();
        let breaker = CircuitBreaker::new(dir.path(), &BreakerConfig::default());
        let camera = CameraId::new("kspb", 2);

        std::fs::create_dir_all(dir.path().join("breaker")).unwrap();
        std::fs::write(breaker.record_path(&camera), b"{not json").unwrap();

        let state = breaker.load(&camera).await.unwrap();
        assert_eq!(state, CircuitBreakerState::default());
    }
}
