//! Periodic backup scheduler for a live world directory.
//!
//! One repeating timer and one worker task. The timer never does I/O itself;
//! each tick only queues a cycle request for the worker, which runs cycles
//! strictly one at a time on the blocking pool. Replacing the timer therefore
//! never interrupts an archive that is being written.
//!
//! # Request policy
//! At most one cycle request waits in the queue. A trigger that arrives while
//! one is already waiting is merged into it; a trigger that arrives while a
//! cycle is running queues exactly one follow-up cycle.
//!
//! # Locking
//! The interval, the retention count, and the timer handle share one mutex,
//! so a reader never sees a half-applied interval change and there is never
//! more than one timer installed.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::{BackupJob, CycleReport};
use crate::config::store::{ConfigStore, ScheduleConfig};
use crate::errors::{BackupError, Result};

const MILLIS_PER_HOUR: i64 = 60 * 60 * 1000;
const MILLIS_PER_MINUTE: i64 = 60 * 1000;

/// What asked for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOrigin {
    Scheduled,
    Manual,
}

impl fmt::Display for CycleOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOrigin::Scheduled => write!(f, "scheduled"),
            CycleOrigin::Manual => write!(f, "manual"),
        }
    }
}

enum WorkerCommand {
    Run(CycleOrigin),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Runtime counters, for status reports.
#[derive(Debug, Clone, Default)]
pub struct BackupStats {
    /// Cycles executed, successful or not.
    pub cycles_run: u64,
    /// Cycles whose archive step failed.
    pub cycles_failed: u64,
    pub archives_created: u64,
    pub archives_deleted: u64,
    /// Requests merged into an already queued cycle.
    pub triggers_coalesced: u64,
    /// Highest number of cycles ever observed running at once.
    pub max_concurrent_cycles: usize,
    pub last_archive: Option<PathBuf>,
}

struct ScheduleState {
    config: ScheduleConfig,
    timer: Option<JoinHandle<()>>,
    shut_down: bool,
}

struct Inner {
    job: BackupJob,
    store: Arc<dyn ConfigStore>,
    state: Mutex<ScheduleState>,
    tx: mpsc::UnboundedSender<WorkerCommand>,
    pending: AtomicBool,
    active_cycles: AtomicUsize,
    stats: Mutex<BackupStats>,
    runtime: Handle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the backup service. Cheap to clone; all clones share one timer
/// and one worker.
#[derive(Clone)]
pub struct BackupScheduler {
    inner: Arc<Inner>,
}

impl BackupScheduler {
    /// Load settings and spawn the worker. The timer is not started.
    ///
    /// Must be called from within a tokio runtime; the handle is kept so the
    /// control operations can be used from plain threads afterwards.
    pub fn new(job: BackupJob, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| BackupError::Runtime(e.to_string()))?;
        let config = load_or_init(store.as_ref());
        info!(
            "Settings loaded: Backup Interval = {}ms, Max Backups = {}",
            config.interval_millis, config.max_backups
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            job,
            store,
            state: Mutex::new(ScheduleState {
                config,
                timer: None,
                shut_down: false,
            }),
            tx,
            pending: AtomicBool::new(false),
            active_cycles: AtomicUsize::new(0),
            stats: Mutex::new(BackupStats::default()),
            runtime: runtime.clone(),
            worker: Mutex::new(None),
        });

        let worker = runtime.spawn(run_worker(Arc::downgrade(&inner), rx));
        *lock(&inner.worker) = Some(worker);

        Ok(Self { inner })
    }

    /// [`new`](Self::new) followed by [`start`](Self::start).
    pub fn init(job: BackupJob, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let scheduler = Self::new(job, store)?;
        scheduler.start()?;
        Ok(scheduler)
    }

    /// Install the repeating timer. First fire is one full interval away.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        if state.shut_down {
            return Err(BackupError::Shutdown);
        }
        if timer_active(&state) {
            return Err(BackupError::AlreadyRunning);
        }
        self.inner.install_timer(&mut state);
        info!("Starting backup task in {}ms", state.config.interval_millis);
        Ok(())
    }

    /// Cancel the timer. Returns whether one was installed. Queued or running
    /// cycles are unaffected.
    pub fn stop(&self) -> bool {
        let mut state = lock(&self.inner.state);
        match state.timer.take() {
            Some(timer) => {
                timer.abort();
                info!("Backup timer stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        timer_active(&lock(&self.inner.state))
    }

    /// Queue an immediate backup. Returns `false` if the request was merged
    /// into one already waiting, or the service is shut down.
    pub fn trigger_backup(&self) -> bool {
        self.inner.request_cycle(CycleOrigin::Manual)
    }

    /// Set the interval from an operator's hours and minutes.
    ///
    /// Returns the new interval in milliseconds.
    pub fn set_interval(&self, hours: i64, minutes: i64) -> Result<u64> {
        self.set_interval_millis(interval_from_parts(hours, minutes)?)
    }

    /// Replace the interval and restart the timer a full new period out.
    pub fn set_interval_millis(&self, millis: u64) -> Result<u64> {
        if millis == 0 {
            return Err(BackupError::InvalidArgument(
                "backup interval must be greater than zero".to_string(),
            ));
        }
        let mut state = lock(&self.inner.state);
        state.config.interval_millis = millis;
        self.inner.persist(&state.config);
        self.inner.install_timer(&mut state);
        info!("Interval set to: {}ms", millis);
        Ok(millis)
    }

    /// Change how many archives are kept. Takes effect on the next cycle.
    pub fn set_max_backups(&self, count: i64) -> Result<u32> {
        let count = u32::try_from(count)
            .ok()
            .filter(|c| *c >= 1)
            .ok_or_else(|| {
                BackupError::InvalidArgument(format!("max backups must be at least 1 (got {})", count))
            })?;
        let mut state = lock(&self.inner.state);
        state.config.max_backups = count;
        self.inner.persist(&state.config);
        info!("Max Backups set to: {}", count);
        Ok(count)
    }

    pub fn config(&self) -> ScheduleConfig {
        lock(&self.inner.state).config
    }

    pub fn interval_millis(&self) -> u64 {
        self.config().interval_millis
    }

    /// Interval in whole minutes, as reported to operators.
    pub fn interval_minutes(&self) -> u64 {
        self.interval_millis() / MILLIS_PER_MINUTE as u64
    }

    pub fn max_backups(&self) -> u32 {
        self.config().max_backups
    }

    pub fn job(&self) -> &BackupJob {
        &self.inner.job
    }

    pub fn stats(&self) -> BackupStats {
        lock(&self.inner.stats).clone()
    }

    /// Wait until every cycle requested before this call has finished.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(WorkerCommand::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Cancel the timer, let queued and running cycles finish, then stop the
    /// worker. Later triggers are ignored.
    pub async fn shutdown(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }

        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(WorkerCommand::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let worker = lock(&self.inner.worker).take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        info!("Backup scheduler shut down");
    }
}

impl Inner {
    /// Queue a run unless one is already waiting. The state lock is held
    /// across the send so no request can land behind the shutdown command.
    fn request_cycle(&self, origin: CycleOrigin) -> bool {
        let state = lock(&self.state);
        if state.shut_down {
            info!("Backup service is shut down; ignoring {} request", origin);
            return false;
        }
        if self.pending.swap(true, Ordering::SeqCst) {
            lock(&self.stats).triggers_coalesced += 1;
            info!("A backup is already queued; {} request merged into it", origin);
            return false;
        }
        if self.tx.send(WorkerCommand::Run(origin)).is_err() {
            self.pending.store(false, Ordering::SeqCst);
            warn!("Backup worker is stopped; ignoring {} request", origin);
            return false;
        }
        drop(state);
        debug!("Queued {} backup", origin);
        true
    }

    /// Cancel any installed timer and start a fresh one. Caller holds the
    /// state lock.
    fn install_timer(self: &Arc<Self>, state: &mut ScheduleState) {
        if let Some(old) = state.timer.take() {
            old.abort();
        }
        if state.shut_down {
            return;
        }
        let period = Duration::from_millis(state.config.interval_millis);
        let first = Instant::now() + period;
        let weak = Arc::downgrade(self);
        state.timer = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        inner.request_cycle(CycleOrigin::Scheduled);
                    }
                    None => break,
                }
            }
        }));
    }

    fn persist(&self, config: &ScheduleConfig) {
        if let Err(e) = self.store.save(config) {
            error!("Failed to persist backup settings: {}", e);
        }
    }

    async fn run_cycle(&self, origin: CycleOrigin) {
        let max_backups = lock(&self.state).config.max_backups as usize;
        let job = self.job.clone();

        let running = self.active_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stats = lock(&self.stats);
            stats.max_concurrent_cycles = stats.max_concurrent_cycles.max(running);
        }
        info!("Starting {} backup of {}", origin, job.source_dir.display());

        let outcome = tokio::task::spawn_blocking(move || job.run_cycle(max_backups)).await;
        self.active_cycles.fetch_sub(1, Ordering::SeqCst);

        let mut stats = lock(&self.stats);
        stats.cycles_run += 1;
        match outcome {
            Ok(CycleReport { archive, retention }) => {
                match archive {
                    Ok(report) => {
                        stats.archives_created += 1;
                        stats.last_archive = Some(report.archive.path);
                    }
                    Err(_) => stats.cycles_failed += 1,
                }
                if let Ok(retention) = retention {
                    stats.archives_deleted += retention.deleted.len() as u64;
                }
            }
            Err(e) => {
                error!("Backup cycle aborted: {}", e);
                stats.cycles_failed += 1;
            }
        }
    }
}

async fn run_worker(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WorkerCommand::Run(origin) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                // Cleared before running so a trigger during this cycle queues
                // one more.
                inner.pending.store(false, Ordering::SeqCst);
                inner.run_cycle(origin).await;
            }
            WorkerCommand::Flush(done) => {
                let _ = done.send(());
            }
            WorkerCommand::Shutdown(done) => {
                let _ = done.send(());
                break;
            }
        }
    }
    debug!("backup worker terminated");
}

fn load_or_init(store: &dyn ConfigStore) -> ScheduleConfig {
    match store.load() {
        Ok(Some(config)) => config.normalized(),
        Ok(None) => {
            let config = ScheduleConfig::default();
            if let Err(e) = store.save(&config) {
                error!("Failed to write default backup settings: {}", e);
            }
            config
        }
        Err(e) => {
            error!("Failed to load backup settings, using defaults: {}", e);
            ScheduleConfig::default()
        }
    }
}

/// `hours * 1h + minutes * 1m` in milliseconds, rejecting negatives, overflow
/// and zero.
pub fn interval_from_parts(hours: i64, minutes: i64) -> Result<u64> {
    if hours < 0 || minutes < 0 {
        return Err(BackupError::InvalidArgument(format!(
            "hours and minutes must not be negative (got {}h {}m)",
            hours, minutes
        )));
    }
    let total = hours
        .checked_mul(MILLIS_PER_HOUR)
        .and_then(|h| minutes.checked_mul(MILLIS_PER_MINUTE).and_then(|m| h.checked_add(m)))
        .ok_or_else(|| BackupError::InvalidArgument("backup interval is too large".to_string()))?;
    if total <= 0 {
        return Err(BackupError::InvalidArgument(
            "backup interval must be greater than zero".to_string(),
        ));
    }
    Ok(total as u64)
}

fn timer_active(state: &ScheduleState) -> bool {
    state
        .timer
        .as_ref()
        .map(|t| !t.is_finished())
        .unwrap_or(false)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::MemoryConfigStore;
    use tempfile::TempDir;

    fn scheduler_with(store: Arc<MemoryConfigStore>, temp: &TempDir) -> BackupScheduler {
        let job = BackupJob::new(temp.path().join("world"), temp.path().join("backups"));
        BackupScheduler::new(job, store).unwrap()
    }

    #[test]
    fn test_interval_from_parts() {
        assert_eq!(interval_from_parts(0, 5).unwrap(), 300_000);
        assert_eq!(interval_from_parts(2, 30).unwrap(), 9_000_000);
        assert!(matches!(
            interval_from_parts(0, 0),
            Err(BackupError::InvalidArgument(_))
        ));
        assert!(matches!(
            interval_from_parts(-1, 90),
            Err(BackupError::InvalidArgument(_))
        ));
        assert!(matches!(
            interval_from_parts(i64::MAX, 0),
            Err(BackupError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let temp = TempDir::new().unwrap();
        let job = BackupJob::new(temp.path().join("world"), temp.path().join("backups"));
        let result = BackupScheduler::new(job, Arc::new(MemoryConfigStore::new()));
        assert!(matches!(result, Err(BackupError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_defaults_written_on_first_start() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MemoryConfigStore::new());
        let scheduler = scheduler_with(store.clone(), &temp);
        assert_eq!(scheduler.interval_millis(), 300_000);
        assert_eq!(scheduler.interval_minutes(), 5);
        assert_eq!(scheduler.max_backups(), 5);
        assert_eq!(store.record(), Some(ScheduleConfig::default()));
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(MemoryConfigStore::new()), &temp);
        scheduler.start().unwrap();
        assert!(matches!(scheduler.start(), Err(BackupError::AlreadyRunning)));
        assert!(scheduler.stop());
        assert!(!scheduler.is_running());
        scheduler.start().unwrap();
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_persist_keeps_in_memory_change() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(MemoryConfigStore::failing(Some(ScheduleConfig::default())));
        let scheduler = scheduler_with(store.clone(), &temp);
        assert_eq!(scheduler.set_max_backups(3).unwrap(), 3);
        assert_eq!(scheduler.max_backups(), 3);
        assert_eq!(store.record(), Some(ScheduleConfig::default()));
    }

    #[tokio::test]
    async fn test_trigger_after_shutdown_is_ignored() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(MemoryConfigStore::new()), &temp);
        scheduler.shutdown().await;
        assert!(!scheduler.trigger_backup());
        assert!(matches!(scheduler.start(), Err(BackupError::Shutdown)));
        assert_eq!(scheduler.stats().cycles_run, 0);
    }

    #[tokio::test]
    async fn test_trigger_while_shutting_down_is_refused() {
        let temp = TempDir::new().unwrap();
        let scheduler = scheduler_with(Arc::new(MemoryConfigStore::new()), &temp);
        assert!(scheduler.trigger_backup());

        let closing = scheduler.clone();
        let handle = tokio::spawn(async move { closing.shutdown().await });
        while !lock(&scheduler.inner.state).shut_down {
            tokio::task::yield_now().await;
        }
        assert!(!scheduler.trigger_backup());
        handle.await.unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.cycles_run, 1);
        assert_eq!(stats.triggers_coalesced, 0);
    }
}
