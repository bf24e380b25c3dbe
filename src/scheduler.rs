//! Due-time scheduling of camera jobs
//!
//! One coordinator task owns the [`ScheduleQueue`]. It ticks on a fixed
//! interval, dispatches every due camera to the [`ProcessPool`], and applies
//! [`SchedulerCommand`]s (reconciliation, job completions, shutdown) between
//! ticks. Nothing else mutates scheduling state.

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{CameraConfig, CameraId, Config};
use crate::process_pool::{CompletionStatus, Job, JobCompletion, ProcessPool, SubmitOutcome};
use chrono::{DateTime, Utc};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Heap entry. Ordered by `(due_at, camera)`; stale revisions are skipped on pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub due_at: DateTime<Utc>,
    pub camera: CameraId,
    pub revision: u64,
}

impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due_at
            .cmp(&other.due_at)
            .then_with(|| self.camera.cmp(&other.camera))
            .then_with(|| self.revision.cmp(&other.revision))
    }
}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Slot {
    camera: CameraConfig,
    due_at: DateTime<Utc>,
    revision: u64,
    last_dispatch: Option<DateTime<Utc>>,
}

/// A camera popped because its due time passed.
#[derive(Debug, Clone)]
pub struct DueCamera {
    pub camera: CameraConfig,
    pub due_at: DateTime<Utc>,
}

/// One live entry per camera, kept in a min-heap with lazy deletion.
#[derive(Debug, Default)]
pub struct ScheduleQueue {
    heap: BinaryHeap<Reverse<ScheduleEntry>>,
    live: BTreeMap<CameraId, Slot>,
    next_revision: u64,
}

impl ScheduleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn contains(&self, camera: &CameraId) -> bool {
        self.live.contains_key(camera)
    }

    pub fn due_at(&self, camera: &CameraId) -> Option<DateTime<Utc>> {
        self.live.get(camera).map(|slot| slot.due_at)
    }

    pub fn cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.live.values().map(|slot| &slot.camera)
    }

    /// Earliest live due time.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.live.values().map(|slot| slot.due_at).min()
    }

    /// How far the most overdue camera lags behind `now`.
    pub fn max_lag(&self, now: DateTime<Utc>) -> Duration {
        self.next_due()
            .and_then(|due| (now - due).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Add or replace a camera with the given due time.
    pub fn insert(&mut self, camera: CameraConfig, due_at: DateTime<Utc>) {
        let id = camera.id.clone();
        let last_dispatch = self.live.get(&id).and_then(|slot| slot.last_dispatch);
        let revision = self.bump();
        self.live.insert(
            id.clone(),
            Slot {
                camera,
                due_at,
                revision,
                last_dispatch,
            },
        );
        self.heap.push(Reverse(ScheduleEntry {
            due_at,
            camera: id,
            revision,
        }));
    }

    pub fn remove(&mut self, camera: &CameraId) -> bool {
        self.live.remove(camera).is_some()
    }

    /// Pop every camera due at or before `now`, in `(due_at, camera)` order.
    ///
    /// Popped cameras stay live; the caller must `mark_dispatched` or `retry` each one.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<DueCamera> {
        let mut due = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.due_at > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            match self.live.get(&entry.camera) {
                Some(slot) if slot.revision == entry.revision => due.push(DueCamera {
                    camera: slot.camera.clone(),
                    due_at: entry.due_at,
                }),
                _ => {}
            }
        }
        self.compact();
        due
    }

    /// Optimistic reschedule after an accepted dispatch.
    pub fn mark_dispatched(&mut self, camera: &CameraId, now: DateTime<Utc>) {
        let Some(slot) = self.live.get_mut(camera) else {
            return;
        };
        slot.last_dispatch = Some(now);
        let due = now + chrono_duration(slot.camera.refresh);
        self.reschedule(camera, due);
    }

    /// Put a rejected camera back with its due time unchanged.
    pub fn retry(&mut self, camera: &CameraId, due_at: DateTime<Utc>) {
        self.reschedule(camera, due_at);
    }

    /// Push the due time out to the breaker's backoff. Never pulls it earlier.
    pub fn apply_completion(&mut self, completion: &JobCompletion) -> bool {
        let Some(backoff_until) = completion.backoff_until else {
            return false;
        };
        match self.live.get(&completion.camera) {
            Some(slot) if backoff_until > slot.due_at => {
                self.reschedule(&completion.camera, backoff_until);
                true
            }
            _ => false,
        }
    }

    /// Apply a new camera set: additions are due now, removals are dropped,
    /// retimed cameras are due `last_dispatch + refresh` (or now if that passed).
    pub fn reconcile(&mut self, cameras: Vec<CameraConfig>, now: DateTime<Utc>) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let mut incoming: BTreeMap<CameraId, CameraConfig> =
            cameras.into_iter().map(|c| (c.id.clone(), c)).collect();

        let removed: Vec<CameraId> = self
            .live
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            self.live.remove(&id);
            summary.removed += 1;
        }

        let existing: Vec<CameraId> = self.live.keys().cloned().collect();
        for id in existing {
            let Some(camera) = incoming.remove(&id) else {
                continue;
            };
            let Some(slot) = self.live.get_mut(&id) else {
                continue;
            };
            if slot.camera.refresh == camera.refresh {
                slot.camera = camera;
                continue;
            }

            let due = match slot.last_dispatch {
                Some(last) => (last + chrono_duration(camera.refresh)).max(now),
                None => slot.due_at,
            };
            slot.camera = camera;
            self.reschedule(&id, due);
            summary.retimed += 1;
        }

        for (_, camera) in incoming {
            self.insert(camera, now);
            summary.added += 1;
        }

        summary
    }

    fn reschedule(&mut self, camera: &CameraId, due_at: DateTime<Utc>) {
        let revision = self.bump();
        let Some(slot) = self.live.get_mut(camera) else {
            return;
        };
        slot.due_at = due_at;
        slot.revision = revision;
        self.heap.push(Reverse(ScheduleEntry {
            due_at,
            camera: camera.clone(),
            revision,
        }));
    }

    fn bump(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }

    /// Rebuild the heap once stale entries dominate it.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.live.len() + 16 {
            return;
        }
        self.heap = self
            .live
            .iter()
            .map(|(id, slot)| {
                Reverse(ScheduleEntry {
                    due_at: slot.due_at,
                    camera: id.clone(),
                    revision: slot.revision,
                })
            })
            .collect();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub retimed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub dispatched: usize,
    pub rejected: usize,
}

pub enum SchedulerCommand {
    Reconcile(Vec<CameraConfig>),
    JobFinished(JobCompletion),
    Shutdown,
}

/// Cloneable sender side of the coordinator's command channel.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn reconcile(&self, cameras: Vec<CameraConfig>) -> bool {
        self.tx.send(SchedulerCommand::Reconcile(cameras)).is_ok()
    }

    pub fn shutdown(&self) -> bool {
        self.tx.send(SchedulerCommand::Shutdown).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Default)]
pub struct SchedulerStats {
    ticks: AtomicU64,
    dispatched: AtomicU64,
    rejected: AtomicU64,
    completions: AtomicU64,
    pushed_out: AtomicU64,
    cameras: AtomicUsize,
    lag_ms: AtomicU64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            pushed_out: self.pushed_out.load(Ordering::Relaxed),
            cameras: self.cameras.load(Ordering::Relaxed),
            lag: Duration::from_millis(self.lag_ms.load(Ordering::Relaxed)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub ticks: u64,
    pub dispatched: u64,
    pub rejected: u64,
    pub completions: u64,
    pub pushed_out: u64,
    pub cameras: usize,
    /// Lag of the most overdue camera at the last tick.
    pub lag: Duration,
}

pub struct Scheduler {
    queue: ScheduleQueue,
    pool: Arc<ProcessPool>,
    tick_interval: Duration,
    commands: mpsc::UnboundedReceiver<SchedulerCommand>,
    completions: mpsc::UnboundedReceiver<JobCompletion>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(
        pool: Arc<ProcessPool>,
        completions: mpsc::UnboundedReceiver<JobCompletion>,
        tick_interval: Duration,
    ) -> (Self, SchedulerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let scheduler = Self {
            queue: ScheduleQueue::new(),
            pool,
            tick_interval,
            commands,
            completions,
            stats: Arc::new(SchedulerStats::default()),
        };
        (scheduler, SchedulerHandle { tx })
    }

    pub fn queue(&self) -> &ScheduleQueue {
        &self.queue
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Load the initial camera set. A camera in backoff starts at its backoff-until.
    pub async fn seed(&mut self, cameras: Vec<CameraConfig>, breaker: &CircuitBreaker, now: DateTime<Utc>) {
        let mut backed_off = 0;
        for camera in cameras {
            let due = match breaker.load(&camera.id).await {
                Ok(state) => match state.backoff_until_time() {
                    Some(until) if until > now => {
                        backed_off += 1;
                        until
                    }
                    _ => now,
                },
                Err(e) => {
                    warn!(camera = %camera.id, error = %e, "Could not read breaker state at startup");
                    now
                }
            };
            self.queue.insert(camera, due);
        }
        self.stats.cameras.store(self.queue.len(), Ordering::Relaxed);
        info!(cameras = self.queue.len(), backed_off, "Scheduler seeded");
    }

    /// Dispatch every due camera.
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickSummary {
        let mut summary = TickSummary::default();
        let lag = self.queue.max_lag(now);
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.stats.lag_ms.store(lag.as_millis() as u64, Ordering::Relaxed);

        for due in self.queue.pop_due(now) {
            let id = due.camera.id.clone();
            match self.pool.submit(Job::new(due.camera)) {
                SubmitOutcome::Accepted => {
                    self.queue.mark_dispatched(&id, now);
                    summary.dispatched += 1;
                    debug!(camera = %id, "Dispatched");
                }
                SubmitOutcome::Rejected => {
                    self.queue.retry(&id, due.due_at);
                    summary.rejected += 1;
                }
            }
        }

        self.stats.dispatched.fetch_add(summary.dispatched as u64, Ordering::Relaxed);
        self.stats.rejected.fetch_add(summary.rejected as u64, Ordering::Relaxed);
        if summary.rejected > 0 {
            debug!(rejected = summary.rejected, "Pool saturated, retrying next tick");
        }
        summary
    }

    /// Apply one command. Returns false on shutdown.
    pub fn handle_command(&mut self, command: SchedulerCommand, now: DateTime<Utc>) -> bool {
        match command {
            SchedulerCommand::Reconcile(cameras) => {
                let summary = self.queue.reconcile(cameras, now);
                self.stats.cameras.store(self.queue.len(), Ordering::Relaxed);
                info!(
                    added = summary.added,
                    removed = summary.removed,
                    retimed = summary.retimed,
                    "Camera set reconciled"
                );
                true
            }
            SchedulerCommand::JobFinished(completion) => {
                self.stats.completions.fetch_add(1, Ordering::Relaxed);
                if let CompletionStatus::Crashed(reason) = &completion.status {
                    warn!(camera = %completion.camera, reason = %reason, "Worker crashed");
                }
                if self.queue.apply_completion(&completion) {
                    self.stats.pushed_out.fetch_add(1, Ordering::Relaxed);
                    debug!(camera = %completion.camera, until = ?completion.backoff_until, "Due time pushed out to backoff");
                }
                true
            }
            SchedulerCommand::Shutdown => false,
        }
    }

    /// Coordinator loop. Returns after `Shutdown`.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_ms = self.tick_interval.as_millis() as u64, "Scheduler running");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now());
                }
                Some(command) = self.commands.recv() => {
                    if !self.handle_command(command, Utc::now()) {
                        break;
                    }
                }
                Some(completion) = self.completions.recv() => {
                    self.handle_command(SchedulerCommand::JobFinished(completion), Utc::now());
                }
            }
        }

        info!("Scheduler stopped");
    }
}

/// Polls the config file's mtime and feeds valid changes to the scheduler.
pub struct ConfigWatcher {
    path: PathBuf,
    poll: Duration,
    last_modified: Option<SystemTime>,
    cameras: Option<watch::Sender<Vec<CameraConfig>>>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf, poll: Duration) -> Self {
        Self {
            path,
            poll,
            last_modified: None,
            cameras: None,
        }
    }

    /// Also publish each reloaded camera list on `tx`.
    pub fn with_camera_updates(mut self, tx: watch::Sender<Vec<CameraConfig>>) -> Self {
        self.cameras = Some(tx);
        self
    }

    /// Remember the current mtime without reloading.
    pub async fn prime(&mut self) {
        self.last_modified = self.modified().await;
    }

    async fn modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
    }

    /// A freshly loaded config if the file changed and is valid.
    pub async fn check(&mut self) -> Option<Config> {
        let modified = self.modified().await?;
        if self.last_modified == Some(modified) {
            return None;
        }
        self.last_modified = Some(modified);

        let loaded = Config::load(&self.path)
            .await
            .and_then(|config| config.validate().map(|_| config));
        match loaded {
            Ok(config) => {
                info!(path = %self.path.display(), "Config change detected");
                Some(config)
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring invalid config change");
                None
            }
        }
    }

    pub async fn run(mut self, handle: SchedulerHandle) {
        let mut interval = tokio::time::interval(self.poll);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Some(config) = self.check().await {
                let cameras = config.cameras();
                if let Some(tx) = &self.cameras {
                    tx.send_replace(cameras.clone());
                }
                if !handle.reconcile(cameras) {
                    break;
                }
            }
            if handle.is_closed() {
                break;
            }
        }
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AcquisitionConfig, BreakerConfig, PushSettings};
    use crate::error::IngestError;
    use crate::metrics::Metrics;
    use crate::process_pool::JobLauncher;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use tokio::sync::Semaphore;

    fn camera(airport: &str, index: usize, refresh_secs: u64) -> CameraConfig {
        CameraConfig {
            id: CameraId::new(airport, index),
            name: String::new(),
            refresh: Duration::from_secs(refresh_secs),
            timezone_offset_minutes: 0,
            acquisition: AcquisitionConfig::Push(PushSettings::default()),
        }
    }

    struct GateLauncher {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobLauncher for GateLauncher {
        async fn launch(&self, job: Job) -> JobCompletion {
            self.gate.acquire().await.unwrap().forget();
            JobCompletion {
                job_id: job.id,
                camera: job.camera.id,
                status: CompletionStatus::Succeeded,
                backoff_until: None,
                duration: Duration::ZERO,
            }
        }
    }

    fn scheduler(slots: usize) -> (Scheduler, SchedulerHandle, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ProcessPool::new(
            slots,
            Arc::new(GateLauncher { gate: gate.clone() }),
            tx,
            Arc::new(Metrics::new()),
        ));
        let (scheduler, handle) = Scheduler::new(pool, rx, Duration::from_secs(1));
        (scheduler, handle, gate)
    }

    fn completion(camera: CameraId, backoff_until: Option<DateTime<Utc>>) -> JobCompletion {
        JobCompletion {
            job_id: uuid::Uuid::new_v4(),
            camera,
            status: CompletionStatus::Failed("timeout".to_string()),
            backoff_until,
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_pop_due_orders_by_time_then_camera() {
        let now = Utc::now();
        let mut queue = ScheduleQueue::new();
        queue.insert(camera("kspb", 1, 60), now);
        queue.insert(camera("kaaa", 0, 60), now);
        queue.insert(camera("kspb", 0, 60), now - ChronoDuration::seconds(5));
        queue.insert(camera("kzzz", 0, 60), now + ChronoDuration::seconds(5));

        let order: Vec<CameraId> = queue.pop_due(now).into_iter().map(|d| d.camera.id).collect();
        assert_eq!(
            order,
            vec![CameraId::new("kspb", 0), CameraId::new("kaaa", 0), CameraId::new("kspb", 1)]
        );
    }

    #[test]
    fn test_removed_camera_is_never_popped() {
        let now = Utc::now();
        let mut queue = ScheduleQueue::new();
        queue.insert(camera("kspb", 0, 60), now);
        assert!(queue.remove(&CameraId::new("kspb", 0)));
        assert!(queue.pop_due(now + ChronoDuration::hours(1)).is_empty());
    }

    #[tokio::test]
    async fn test_accepted_dispatch_reschedules_one_refresh_later() {
        let (mut scheduler, _handle, _gate) = scheduler(4);
        let now = Utc::now();
        scheduler.queue.insert(camera("kspb", 0, 60), now);

        assert_eq!(scheduler.tick(now).dispatched, 1);
        let id = CameraId::new("kspb", 0);
        assert_eq!(scheduler.queue().due_at(&id), Some(now + ChronoDuration::seconds(60)));

        assert_eq!(scheduler.tick(now + ChronoDuration::seconds(30)).dispatched, 0);
        assert_eq!(scheduler.tick(now + ChronoDuration::seconds(60)).dispatched, 1);
        assert_eq!(scheduler.stats().snapshot().dispatched, 2);
    }

    #[tokio::test]
    async fn test_rejected_dispatch_keeps_due_time() {
        let (mut scheduler, _handle, _gate) = scheduler(1);
        let now = Utc::now();
        let due = now - ChronoDuration::seconds(2);
        scheduler.queue.insert(camera("kspb", 0, 60), due);
        scheduler.queue.insert(camera("kspb", 1, 60), due);

        let summary = scheduler.tick(now);
        assert_eq!(summary, TickSummary { dispatched: 1, rejected: 1 });
        assert_eq!(scheduler.queue().due_at(&CameraId::new("kspb", 1)), Some(due));

        // still saturated on the next tick, still due
        let summary = scheduler.tick(now + ChronoDuration::seconds(1));
        assert_eq!(summary, TickSummary { dispatched: 0, rejected: 1 });
        assert_eq!(scheduler.queue().due_at(&CameraId::new("kspb", 1)), Some(due));
    }

    #[tokio::test]
    async fn test_completion_backoff_only_pushes_due_time_out() {
        let (mut scheduler, _handle, _gate) = scheduler(4);
        let now = Utc::now();
        let id = CameraId::new("kspb", 0);
        scheduler.queue.insert(camera("kspb", 0, 60), now);
        scheduler.tick(now);

        let backoff = now + ChronoDuration::seconds(600);
        assert!(scheduler.handle_command(SchedulerCommand::JobFinished(completion(id.clone(), Some(backoff))), now));
        assert_eq!(scheduler.queue().due_at(&id), Some(backoff));

        scheduler.handle_command(
            SchedulerCommand::JobFinished(completion(id.clone(), Some(now + ChronoDuration::seconds(10)))),
            now,
        );
        scheduler.handle_command(SchedulerCommand::JobFinished(completion(id.clone(), None)), now);
        assert_eq!(scheduler.queue().due_at(&id), Some(backoff));

        assert_eq!(scheduler.tick(now + ChronoDuration::seconds(60)).dispatched, 0);
        assert_eq!(scheduler.tick(backoff).dispatched, 1);
        assert_eq!(scheduler.stats().snapshot().pushed_out, 1);
    }

    #[tokio::test]
    async fn test_reconcile_adds_removes_and_retimes() {
        let (mut scheduler, _handle, _gate) = scheduler(4);
        let now = Utc::now();
        scheduler.queue.insert(camera("kspb", 0, 300), now);
        scheduler.queue.insert(camera("kspb", 1, 60), now);
        scheduler.tick(now);

        let later = now + ChronoDuration::seconds(30);
        let summary = scheduler.queue.reconcile(
            vec![camera("kspb", 0, 120), camera("kbfi", 0, 60)],
            later,
        );
        assert_eq!(summary, ReconcileSummary { added: 1, removed: 1, retimed: 1 });

        assert_eq!(
            scheduler.queue().due_at(&CameraId::new("kspb", 0)),
            Some(now + ChronoDuration::seconds(120))
        );
        assert_eq!(scheduler.queue().due_at(&CameraId::new("kbfi", 0)), Some(later));
        assert!(!scheduler.queue().contains(&CameraId::new("kspb", 1)));

        // shortened below the time already elapsed: due immediately
        let much_later = now + ChronoDuration::seconds(200);
        scheduler.queue.reconcile(vec![camera("kspb", 0, 60), camera("kbfi", 0, 60)], much_later);
        assert_eq!(scheduler.queue().due_at(&CameraId::new("kspb", 0)), Some(much_later));
    }

    #[tokio::test]
    async fn test_seed_respects_persisted_backoff() {
        let dir = tempfile::TempDir::new().unwrap();
        let breaker = CircuitBreaker::new(dir.path(), &BreakerConfig::default());
        let now = Utc::now();
        let failing = CameraId::new("kspb", 1);
        breaker
            .record_failure(&failing, &IngestError::Timeout(Duration::from_secs(30)), now)
            .await
            .unwrap();

        let (mut scheduler, _handle, _gate) = scheduler(4);
        scheduler
            .seed(vec![camera("kspb", 0, 60), camera("kspb", 1, 60)], &breaker, now)
            .await;

        assert_eq!(scheduler.queue().due_at(&CameraId::new("kspb", 0)), Some(now));
        let due = scheduler.queue().due_at(&failing).unwrap();
        assert!(due >= now + ChronoDuration::seconds(59));
        assert_eq!(scheduler.tick(now).dispatched, 1);
    }

    #[tokio::test]
    async fn test_run_loop_applies_commands_and_stops() {
        let (scheduler, handle, _gate) = scheduler(1);
        let stats = scheduler.stats();
        let task = tokio::spawn(scheduler.run());

        assert!(handle.reconcile(vec![camera("kspb", 0, 60)]));
        assert!(handle.shutdown());
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(stats.snapshot().cameras, 1);
    }

    #[tokio::test]
    async fn test_config_watcher_reports_valid_changes_only() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"airports": []}"#).unwrap();

        let mut watcher = ConfigWatcher::new(path.clone(), Duration::from_secs(1));
        watcher.prime().await;
        assert!(watcher.check().await.is_none());

        let bump = |content: &str, secs: u64| {
            std::fs::write(&path, content).unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(SystemTime::now() + Duration::from_secs(secs)).unwrap();
        };

        bump(
            r#"{"airports": [{"id": "kspb", "webcams": [{"mode": "push"}]}]}"#,
            10,
        );
        let config = watcher.check().await.unwrap();
        assert_eq!(config.cameras().len(), 1);

        bump("{ not json", 20);
        assert!(watcher.check().await.is_none());
    }

    #[tokio::test]
    async fn test_config_watcher_publishes_reloaded_cameras() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"airports": []}"#).unwrap();

        let (tx, mut rx) = watch::channel(Vec::new());
        let mut watcher = ConfigWatcher::new(path.clone(), Duration::from_millis(50)).with_camera_updates(tx);
        watcher.prime().await;

        let (_scheduler, handle, _gate) = scheduler(1);
        let task = tokio::spawn(watcher.run(handle.clone()));

        std::fs::write(
            &path,
            r#"{"airports": [{"id": "kspb", "webcams": [{"mode": "push"}, {"mode": "push"}]}]}"#,
        )
        .unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(10)).unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().len(), 2);
        task.abort();
    }
}
