//! Job manager for the ABR orchestrator
//!
//! Owns the in-memory job table and the start/stop/status/list operations.
//! Mutations for one source key run inside a per-key critical section, so
//! a Start, a Stop and the Health Monitor's final transition for the same
//! key never interleave, while different keys proceed independently. The
//! table itself is only locked for the duration of a single read or write.

use crate::config::{Config, QualityProfile};
use crate::encode::{build_encode_spec, EncodeSettings, EncodeSpec, EncoderLauncher};
use crate::jobs::{
    is_valid_source_key, JobInfo, JobState, StartError, StartOutcome, StopError, StopOutcome,
};
use crate::lock::{LockError, LockHandle, StreamLocks};
use crate::metrics::{Counters, SharedCounters};
use crate::monitor::{self, ExitOutcome, Supervision};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Settings the manager and its monitors run with
#[derive(Debug, Clone)]
pub struct JobManagerSettings {
    pub encode: EncodeSettings,
    pub ladder: Vec<QualityProfile>,
    /// Time between the quit request and the kill
    pub stop_grace: Duration,
    /// `None` disables stall detection
    pub stall_timeout: Option<Duration>,
    pub manifest_refresh: Duration,
    /// How long Failed jobs stay visible
    pub failed_retention: Duration,
}

impl JobManagerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            encode: EncodeSettings::from_config(cfg),
            ladder: cfg.ladder.clone(),
            stop_grace: Duration::from_secs(cfg.encoder.stop_grace_secs),
            stall_timeout: match cfg.encoder.stall_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            manifest_refresh: Duration::from_millis(cfg.encoder.manifest_refresh_ms.max(1)),
            failed_retention: Duration::from_secs(cfg.jobs.failed_retention_secs),
        }
    }
}

struct JobEntry {
    info: JobInfo,
    /// Cancelled by Stop; observed by the job's monitor
    cancel: CancellationToken,
}

struct Inner {
    settings: JobManagerSettings,
    locks: StreamLocks,
    launcher: Arc<dyn EncoderLauncher>,
    counters: SharedCounters,
    jobs: RwLock<HashMap<String, JobEntry>>,
    key_guards: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    monitors: TaskTracker,
}

/// Cheap to clone; all clones share one job table.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("jobs", &self.inner.jobs.read().len())
            .field("monitors", &self.inner.monitors.len())
            .field("lock_dir", &self.inner.locks.dir())
            .finish()
    }
}

impl JobManager {
    pub fn new(
        settings: JobManagerSettings,
        locks: StreamLocks,
        launcher: Arc<dyn EncoderLauncher>,
        counters: SharedCounters,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                locks,
                launcher,
                counters,
                jobs: RwLock::new(HashMap::new()),
                key_guards: Mutex::new(HashMap::new()),
                monitors: TaskTracker::new(),
            }),
        }
    }

    pub fn settings(&self) -> &JobManagerSettings {
        &self.inner.settings
    }

    pub fn locks(&self) -> &StreamLocks {
        &self.inner.locks
    }

    pub fn counters(&self) -> &SharedCounters {
        &self.inner.counters
    }

    /// Start transcoding `source_key`.
    ///
    /// Calling Start for a job this process already runs returns the
    /// existing job without spawning anything. A lock held by another live
    /// process yields [`StartError::AlreadyRunning`].
    pub async fn start(&self, source_key: &str) -> Result<StartOutcome, StartError> {
        if !is_valid_source_key(source_key) {
            return Err(StartError::InvalidSourceKey(source_key.to_string()));
        }
        if self.inner.monitors.is_closed() {
            return Err(StartError::ShuttingDown);
        }

        let _held = self.lock_key(source_key).await;

        let existing = self.status(source_key);
        if let Some(info) = existing {
            match info.state {
                JobState::Starting | JobState::Running => {
                    return Ok(StartOutcome::AlreadyRunning(info));
                }
                JobState::Stopping => return Err(StartError::Stopping(source_key.to_string())),
                // Retained terminal record from an earlier run
                _ => {
                    self.inner.jobs.write().remove(source_key);
                }
            }
        }

        let spec = build_encode_spec(
            source_key,
            &self.inner.settings.ladder,
            &self.inner.settings.encode,
        )?;

        let lock = self.inner.locks.acquire(source_key).map_err(|e| match e {
            LockError::AlreadyLocked {
                source_key,
                owner_pid,
            } => StartError::AlreadyRunning {
                source_key,
                owner_pid,
            },
            LockError::Io(e) => StartError::Lock(e),
        })?;

        let job_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let mut info = JobInfo::starting(job_id.clone(), &spec);
        self.inner.jobs.write().insert(
            source_key.to_string(),
            JobEntry {
                info: info.clone(),
                cancel: cancel.clone(),
            },
        );

        if let Err(source) = prepare_output(&spec) {
            let err = StartError::OutputDir {
                path: spec.output_root.clone(),
                source,
            };
            self.abort_start(source_key, &job_id, lock, &err);
            return Err(err);
        }

        let child = match self.inner.launcher.launch(&spec) {
            Ok(child) => child,
            Err(e) => {
                let err = StartError::SpawnFailure(e);
                Counters::incr(&self.inner.counters.spawn_failures);
                self.abort_start(source_key, &job_id, lock, &err);
                return Err(err);
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(e) = lock.record_encoder_pid(pid) {
                warn!(source_key, pid, error = %e, "failed to record encoder PID in stream lock");
            }
        }

        info.mark_running(pid);
        self.inner.jobs.write().insert(
            source_key.to_string(),
            JobEntry {
                info: info.clone(),
                cancel: cancel.clone(),
            },
        );

        self.inner.monitors.spawn(monitor::supervise(
            self.clone(),
            Supervision {
                source_key: source_key.to_string(),
                job_id: job_id.clone(),
                spec,
                child,
                lock,
                cancel,
            },
        ));
        Counters::incr(&self.inner.counters.jobs_started);

        info!(
            source_key,
            job_id = %job_id,
            pid = ?pid,
            renditions = info.renditions.len(),
            "encoder started"
        );
        Ok(StartOutcome::Started(info))
    }

    /// Request termination of the job for `source_key`.
    ///
    /// Returns as soon as the request is recorded; the job's monitor
    /// performs the quit/kill sequence, releases the lock and removes the
    /// record once the encoder is gone.
    pub async fn stop(&self, source_key: &str) -> Result<StopOutcome, StopError> {
        if !is_valid_source_key(source_key) {
            return Err(StopError::InvalidSourceKey(source_key.to_string()));
        }

        let _held = self.lock_key(source_key).await;

        let outcome = {
            let mut jobs = self.inner.jobs.write();
            match jobs.get_mut(source_key) {
                Some(entry) if entry.info.state.is_active() => {
                    entry.info.state = JobState::Stopping;
                    entry.cancel.cancel();
                    StopOutcome::Stopping
                }
                Some(entry) if entry.info.state == JobState::Stopping => {
                    StopOutcome::AlreadyStopping
                }
                _ => StopOutcome::NotRunning,
            }
        };

        if outcome == StopOutcome::Stopping {
            info!(source_key, "stop requested");
        }
        Ok(outcome)
    }

    /// Snapshot of the job for `source_key`. Never waits on a Start or Stop.
    pub fn status(&self, source_key: &str) -> Option<JobInfo> {
        self.inner
            .jobs
            .read()
            .get(source_key)
            .map(|entry| entry.info.clone())
    }

    /// Every job not in a terminal state, ordered by source key
    pub fn list_active(&self) -> Vec<JobInfo> {
        let mut active: Vec<JobInfo> = self
            .inner
            .jobs
            .read()
            .values()
            .filter(|entry| !entry.info.state.is_terminal())
            .map(|entry| entry.info.clone())
            .collect();
        active.sort_by(|a, b| a.source_key.cmp(&b.source_key));
        active
    }

    /// Every job record, retained failures included, ordered by source key
    pub fn list_all(&self) -> Vec<JobInfo> {
        let mut all: Vec<JobInfo> = self
            .inner
            .jobs
            .read()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        all.sort_by(|a, b| a.source_key.cmp(&b.source_key));
        all
    }

    /// Source keys with a Starting or Running job
    pub fn active_keys(&self) -> BTreeSet<String> {
        self.inner
            .jobs
            .read()
            .values()
            .filter(|entry| entry.info.state.is_active())
            .map(|entry| entry.info.source_key.clone())
            .collect()
    }

    /// Request Stop for every active job. Returns how many stops were issued.
    pub async fn stop_all(&self) -> usize {
        let mut issued = 0;
        for key in self.active_keys() {
            if let Ok(StopOutcome::Stopping) = self.stop(&key).await {
                issued += 1;
            }
        }
        issued
    }

    /// Refuse new starts, stop every job and wait for all monitors.
    ///
    /// Returns false if monitors were still running when `wait` elapsed.
    pub async fn shutdown(&self, wait: Duration) -> bool {
        self.inner.monitors.close();
        let issued = self.stop_all().await;
        info!(jobs = issued, "stopping all jobs for shutdown");

        match tokio::time::timeout(wait, self.inner.monitors.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    remaining = self.inner.monitors.len(),
                    "monitors still running at shutdown deadline"
                );
                false
            }
        }
    }

    /// Final transition of a job, called once by its monitor after the
    /// encoder has exited.
    pub(crate) async fn finish(
        &self,
        source_key: &str,
        job_id: &str,
        lock: LockHandle,
        outcome: ExitOutcome,
        stderr_tail: Option<String>,
    ) {
        let _held = self.lock_key(source_key).await;

        let failure = {
            let mut jobs = self.inner.jobs.write();
            match jobs
                .get_mut(source_key)
                .filter(|entry| entry.info.job_id == job_id)
            {
                Some(entry) => {
                    let stop_requested = entry.info.state == JobState::Stopping;
                    let failure = outcome.failure(stop_requested, stderr_tail.as_deref());
                    match &failure {
                        Some(reason) => entry.info.mark_failed(reason.clone()),
                        None => {
                            entry.info.state = JobState::Stopped;
                            entry.info.pid = None;
                        }
                    }
                    failure
                }
                None => outcome.failure(false, stderr_tail.as_deref()),
            }
        };

        // The encoder is confirmed gone; only now may another owner take over
        if let Err(e) = self.inner.locks.release(lock) {
            error!(source_key, error = %e, "failed to release stream lock");
        }

        match failure {
            None => {
                self.remove_if_current(source_key, job_id);
                Counters::incr(&self.inner.counters.jobs_stopped);
                info!(source_key, job_id, "job stopped");
            }
            Some(reason) => {
                Counters::incr(&self.inner.counters.jobs_failed);
                warn!(source_key, job_id, error = %reason, "job failed");
                self.retain_failed(source_key, job_id);
            }
        }
    }

    /// Serialize Start, Stop and the final transition for one key.
    /// Different keys never wait on each other.
    async fn lock_key(&self, source_key: &str) -> KeyGuard<'_> {
        let mutex = self
            .inner
            .key_guards
            .lock()
            .entry(source_key.to_string())
            .or_default()
            .clone();
        KeyGuard {
            guards: &self.inner.key_guards,
            source_key: source_key.to_string(),
            held: Some(mutex.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn key_guard_count(&self) -> usize {
        self.inner.key_guards.lock().len()
    }

    /// Undo a Start that failed after the lock was taken
    fn abort_start(&self, source_key: &str, job_id: &str, lock: LockHandle, err: &StartError) {
        // No encoder is running, so the lock can go immediately
        if let Err(e) = self.inner.locks.release(lock) {
            error!(source_key, error = %e, "failed to release stream lock");
        }
        if let Some(entry) = self.inner.jobs.write().get_mut(source_key) {
            entry.info.mark_failed(err.to_string());
        }
        error!(source_key, kind = err.kind(), error = %err, "failed to start encoder");
        self.retain_failed(source_key, job_id);
    }

    fn remove_if_current(&self, source_key: &str, job_id: &str) {
        let mut jobs = self.inner.jobs.write();
        if jobs
            .get(source_key)
            .is_some_and(|entry| entry.info.job_id == job_id)
        {
            jobs.remove(source_key);
        }
    }

    /// Keep a Failed record visible for the retention period, then drop it
    /// unless a newer job has replaced it.
    fn retain_failed(&self, source_key: &str, job_id: &str) {
        let retention = self.inner.settings.failed_retention;
        if retention.is_zero() {
            self.remove_if_current(source_key, job_id);
            return;
        }

        let manager = self.clone();
        let source_key = source_key.to_string();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            let _held = manager.lock_key(&source_key).await;
            let still_failed = manager
                .status(&source_key)
                .is_some_and(|info| info.job_id == job_id && info.state == JobState::Failed);
            if still_failed {
                manager.remove_if_current(&source_key, &job_id);
            }
        });
    }
}

/// Held per-key mutex. Dropping it unlocks and forgets the key's mutex
/// once nobody else holds or waits on it.
struct KeyGuard<'a> {
    guards: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    source_key: String,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut guards = self.guards.lock();
        // Waiters clone the mutex under this same map lock
        if guards
            .get(&self.source_key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            guards.remove(&self.source_key);
        }
    }
}

/// Give the job a clean output tree: leftovers from an earlier run of the
/// same source would otherwise be advertised as fresh output.
fn prepare_output(spec: &EncodeSpec) -> io::Result<()> {
    match fs::remove_dir_all(&spec.output_root) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    for dir in spec.output_dirs() {
        fs::create_dir_all(dir)?;
    }
    Ok(())
}
