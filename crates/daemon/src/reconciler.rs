//! Source reconciler: a level-triggered loop converging running jobs onto
//! the set of publishing sources.
//!
//! Each cycle polls the full desired set, reads the full actual set from
//! the Job Manager, and issues Start for `desired - actual` and Stop for
//! `actual - desired`. Nothing is carried between cycles except the
//! previous actual set, which is only used for logging transitions.

use crate::ingest::SourceStatus;
use crate::job_manager::JobManager;
use crate::jobs::{StartError, StartOutcome};
use crate::metrics::Counters;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the reconciler is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerPhase {
    Idle,
    Polling,
    Diffing,
    Converging,
}

/// Corrective actions for one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub to_start: BTreeSet<String>,
    pub to_stop: BTreeSet<String>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_start.is_empty() && self.to_stop.is_empty()
    }
}

/// `to_start = desired - actual`, `to_stop = actual - desired`
pub fn diff(desired: &BTreeSet<String>, actual: &BTreeSet<String>) -> Plan {
    Plan {
        to_start: desired.difference(actual).cloned().collect(),
        to_stop: actual.difference(desired).cloned().collect(),
    }
}

/// What a converge pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    pub start_calls: usize,
    pub stop_calls: usize,
    /// Sources whose Start failed; retried by the next cycle
    pub failed: Vec<String>,
}

impl ConvergeReport {
    pub fn calls(&self) -> usize {
        self.start_calls + self.stop_calls
    }
}

pub struct Reconciler {
    source: Arc<dyn SourceStatus>,
    manager: JobManager,
    interval: Duration,
    phase: ReconcilerPhase,
    previous_actual: BTreeSet<String>,
}

impl Reconciler {
    pub fn new(source: Arc<dyn SourceStatus>, manager: JobManager, interval: Duration) -> Self {
        Self {
            source,
            manager,
            interval,
            phase: ReconcilerPhase::Idle,
            previous_actual: BTreeSet::new(),
        }
    }

    pub fn phase(&self) -> ReconcilerPhase {
        self.phase
    }

    /// Run one full cycle.
    ///
    /// Returns `None` when the status query failed; such a cycle makes no
    /// Start or Stop calls, since an unreachable ingest server says nothing
    /// about which sources are live.
    pub async fn poll_once(&mut self) -> Option<ConvergeReport> {
        let counters = self.manager.counters().clone();
        Counters::incr(&counters.poll_cycles);

        self.phase = ReconcilerPhase::Polling;
        let desired = match self.source.published_sources().await {
            Ok(desired) => desired,
            Err(e) => {
                Counters::incr(&counters.poll_failures);
                warn!(error = %e, "ingest status poll failed, skipping cycle");
                self.phase = ReconcilerPhase::Idle;
                return None;
            }
        };
        counters
            .sources_seen
            .store(desired.len() as u64, Ordering::Relaxed);

        self.phase = ReconcilerPhase::Diffing;
        let actual = self.manager.active_keys();
        self.log_transitions(&actual);
        let plan = diff(&desired, &actual);

        self.phase = ReconcilerPhase::Converging;
        let report = self.converge(&plan).await;
        if report.calls() > 0 {
            info!(
                desired = desired.len(),
                started = report.start_calls - report.failed.len(),
                stopped = report.stop_calls,
                failed = report.failed.len(),
                "reconciled"
            );
        }

        self.previous_actual = self.manager.active_keys();
        self.phase = ReconcilerPhase::Idle;
        Some(report)
    }

    /// Issue the Start and Stop calls of a plan.
    ///
    /// Start failures are logged and left for the next cycle.
    pub async fn converge(&self, plan: &Plan) -> ConvergeReport {
        let mut report = ConvergeReport::default();

        for key in &plan.to_start {
            report.start_calls += 1;
            match self.manager.start(key).await {
                Ok(StartOutcome::Started(info)) => {
                    info!(source_key = %key, job_id = %info.job_id, "source appeared, job started");
                }
                Ok(StartOutcome::AlreadyRunning(_)) => {}
                Err(StartError::AlreadyRunning { owner_pid, .. }) => {
                    debug!(source_key = %key, owner_pid, "source transcoded by another process");
                    report.failed.push(key.clone());
                }
                Err(e) => {
                    warn!(source_key = %key, kind = e.kind(), error = %e, "start failed, will retry");
                    report.failed.push(key.clone());
                }
            }
        }

        for key in &plan.to_stop {
            report.stop_calls += 1;
            match self.manager.stop(key).await {
                Ok(outcome) => {
                    info!(source_key = %key, outcome = outcome.as_str(), "source gone, job stopping");
                }
                Err(e) => warn!(source_key = %key, error = %e, "stop failed"),
            }
        }

        report
    }

    /// Poll on a fixed interval until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "reconciler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }

        self.phase = ReconcilerPhase::Idle;
        info!("reconciler stopped");
    }

    /// Jobs that left the actual set on their own ended between polls
    fn log_transitions(&self, actual: &BTreeSet<String>) {
        for key in self.previous_actual.difference(actual) {
            info!(source_key = %key, "job ended since last cycle");
        }
        for key in actual.difference(&self.previous_actual) {
            debug!(source_key = %key, "job became active outside the reconciler");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::PollError;
    use crate::jobs::JobState;
    use crate::lock::StreamLocks;
    use crate::manifest::MASTER_PLAYLIST;
    use crate::testing::{fixture, wait_until, writes_first_segment, ScriptLauncher};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    /// Source status returning whatever the test set last
    #[derive(Default)]
    struct StaticSource {
        published: Mutex<Option<BTreeSet<String>>>,
    }

    impl StaticSource {
        fn set(&self, keys: &[&str]) {
            *self.published.lock() = Some(keys.iter().map(|k| k.to_string()).collect());
        }

        fn fail(&self) {
            *self.published.lock() = None;
        }
    }

    #[async_trait]
    impl SourceStatus for StaticSource {
        async fn published_sources(&self) -> Result<BTreeSet<String>, PollError> {
            self.published
                .lock()
                .clone()
                .ok_or(PollError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE))
        }
    }

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn key_set() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set("[a-e]", 0..5)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        // Applying the plan to `actual` yields exactly `desired`, and the
        // plan for an already converged state is empty.
        #[test]
        fn prop_diff_converges(desired in key_set(), actual in key_set()) {
            let plan = diff(&desired, &actual);
            prop_assert!(plan.to_start.is_disjoint(&plan.to_stop));

            let converged: BTreeSet<String> = actual
                .difference(&plan.to_stop)
                .chain(plan.to_start.iter())
                .cloned()
                .collect();
            prop_assert_eq!(&converged, &desired);
            prop_assert!(diff(&desired, &converged).is_empty());
        }
    }

    #[test]
    fn test_diff_example() {
        let plan = diff(&set(&["a", "b"]), &set(&["b", "c"]));
        assert_eq!(plan.to_start, set(&["a"]));
        assert_eq!(plan.to_stop, set(&["c"]));
    }

    #[tokio::test]
    async fn test_converge_then_noop() {
        let launcher = ScriptLauncher::quits_on_request();
        let fx = fixture(launcher.clone());
        let source = Arc::new(StaticSource::default());
        let mut reconciler =
            Reconciler::new(source.clone(), fx.manager.clone(), Duration::from_secs(1));

        source.set(&["a", "b"]);
        let first = reconciler.poll_once().await.unwrap();
        assert_eq!(first.start_calls, 2);
        assert_eq!(first.stop_calls, 0);
        assert_eq!(fx.manager.active_keys(), set(&["a", "b"]));

        let second = reconciler.poll_once().await.unwrap();
        assert_eq!(second.calls(), 0);
        assert_eq!(launcher.launches(), 2);
        assert_eq!(reconciler.phase(), ReconcilerPhase::Idle);

        source.set(&["b", "c"]);
        let third = reconciler.poll_once().await.unwrap();
        assert_eq!(third.start_calls, 1);
        assert_eq!(third.stop_calls, 1);
        assert_eq!(fx.manager.active_keys(), set(&["b", "c"]));
    }

    #[tokio::test]
    async fn test_poll_failure_is_a_noop() {
        let launcher = ScriptLauncher::quits_on_request();
        let fx = fixture(launcher.clone());
        let source = Arc::new(StaticSource::default());
        let mut reconciler =
            Reconciler::new(source.clone(), fx.manager.clone(), Duration::from_secs(1));

        source.set(&["a"]);
        reconciler.poll_once().await.unwrap();

        source.fail();
        assert_eq!(reconciler.poll_once().await, None);
        // A failed poll never reads as "every source vanished"
        assert_eq!(fx.manager.active_keys(), set(&["a"]));
        assert_eq!(fx.manager.status("a").unwrap().state, JobState::Running);

        let counters = fx.manager.counters().snapshot();
        assert_eq!(counters.poll_cycles, 2);
        assert_eq!(counters.poll_failures, 1);
        assert_eq!(counters.sources_seen, 1);
    }

    #[tokio::test]
    async fn test_crashed_job_is_restarted_next_cycle() {
        let launcher = ScriptLauncher::new(|_| "exit 1".to_string());
        let fx = fixture(launcher.clone());
        let source = Arc::new(StaticSource::default());
        let mut reconciler =
            Reconciler::new(source.clone(), fx.manager.clone(), Duration::from_secs(1));
        source.set(&["a"]);

        reconciler.poll_once().await.unwrap();
        let manager = fx.manager.clone();
        wait_until("crash", || {
            manager
                .status("a")
                .is_some_and(|info| info.state == JobState::Failed)
        })
        .await;

        let report = reconciler.poll_once().await.unwrap();
        assert_eq!(report.start_calls, 1);
        assert_eq!(launcher.launches(), 2);
    }

    #[tokio::test]
    async fn test_start_failures_are_reported_not_fatal() {
        let launcher = ScriptLauncher::quits_on_request();
        let fx = fixture(launcher.clone());
        // Another orchestrator holds "b"
        let other = StreamLocks::new(fx.manager.locks().dir());
        let _held = other.acquire("b").unwrap();

        let source = Arc::new(StaticSource::default());
        source.set(&["a", "b"]);
        let mut reconciler =
            Reconciler::new(source.clone(), fx.manager.clone(), Duration::from_secs(1));

        let report = reconciler.poll_once().await.unwrap();
        assert_eq!(report.start_calls, 2);
        assert_eq!(report.failed, vec!["b".to_string()]);
        assert_eq!(fx.manager.active_keys(), set(&["a"]));
    }

    #[tokio::test]
    async fn test_end_to_end_alpha() {
        let launcher = ScriptLauncher::new(writes_first_segment);
        let fx = fixture(launcher.clone());
        let source = Arc::new(StaticSource::default());
        let mut reconciler =
            Reconciler::new(source.clone(), fx.manager.clone(), Duration::from_secs(1));

        source.set(&["alpha"]);
        let report = reconciler.poll_once().await.unwrap();
        assert_eq!(report.start_calls, 1);
        assert_eq!(launcher.launches(), 1);

        let info = fx.manager.status("alpha").unwrap();
        assert_eq!(info.state, JobState::Running);
        assert!(fx.manager.locks().is_locked("alpha"));

        let master = info.output_root.join(MASTER_PLAYLIST);
        wait_until("master playlist", || master.exists()).await;
        let parsed =
            m3u8_rs::parse_master_playlist_res(&std::fs::read(&master).unwrap()).unwrap();
        assert_eq!(parsed.variants.len(), 1);
        assert_eq!(parsed.variants[0].uri, "1080p/playlist.m3u8");

        source.set(&[]);
        let report = reconciler.poll_once().await.unwrap();
        assert_eq!(report.stop_calls, 1);

        let manager = fx.manager.clone();
        wait_until("job removal", || manager.status("alpha").is_none()).await;
        assert!(!fx.manager.locks().is_locked("alpha"));
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fx = fixture(ScriptLauncher::quits_on_request());
        let source = Arc::new(StaticSource::default());
        source.set(&[]);
        let reconciler = Reconciler::new(source, fx.manager.clone(), Duration::from_millis(20));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(reconciler.run(shutdown.clone()));
        let manager = fx.manager.clone();
        wait_until("a few cycles", || manager.counters().snapshot().poll_cycles >= 3).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
