//! Health monitor: one supervising task per running encoder.
//!
//! The monitor owns the encoder's process handle. It waits for the process
//! to exit, reacts to stop requests with a graceful quit followed by a kill,
//! keeps the top-level manifest fresh and kills encoders whose output has
//! stalled. Whatever happens, it hands the outcome to the Job Manager
//! exactly once, after the process is confirmed gone.

use crate::encode::EncodeSpec;
use crate::job_manager::JobManager;
use crate::lock::{self, LockHandle};
use crate::manifest::{self, PublishOutcome};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Upper bound on waiting for the stderr reader after the encoder exited
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything a monitor needs to supervise one job
pub(crate) struct Supervision {
    pub source_key: String,
    pub job_id: String,
    pub spec: EncodeSpec,
    pub child: Child,
    pub lock: LockHandle,
    pub cancel: CancellationToken,
}

/// How the encoder ended
#[derive(Debug)]
pub(crate) enum ExitOutcome {
    /// Terminated because Stop was requested
    Requested,
    /// Exited on its own
    Exited(ExitStatus),
    /// Killed because no new segment appeared in time
    Stalled(Duration),
    /// Waiting on the process failed; it was killed
    WaitFailed(String),
}

impl ExitOutcome {
    /// The failure reason to record, or `None` when the job simply stopped.
    ///
    /// A requested stop is never a failure, whatever the exit code. An
    /// unrequested clean exit means the publisher ended the stream.
    pub(crate) fn failure(&self, stop_requested: bool, stderr_tail: Option<&str>) -> Option<String> {
        if stop_requested {
            return None;
        }
        let reason = match self {
            ExitOutcome::Requested => return None,
            ExitOutcome::Exited(status) if status.success() => return None,
            ExitOutcome::Exited(status) => format!("encoder exited with {}", status),
            ExitOutcome::Stalled(idle) => {
                format!("encoder output stalled for {}s", idle.as_secs())
            }
            ExitOutcome::WaitFailed(e) => format!("lost track of encoder: {}", e),
        };
        Some(match stderr_tail {
            Some(tail) => format!("{}: {}", reason, tail),
            None => reason,
        })
    }
}

enum Event {
    Exited(io::Result<ExitStatus>),
    StopRequested,
    Stalled(Duration),
}

/// Supervise a job until its encoder is gone, then report to the manager
pub(crate) async fn supervise(manager: JobManager, job: Supervision) {
    let Supervision {
        source_key,
        job_id,
        spec,
        mut child,
        lock,
        cancel,
    } = job;
    let settings = manager.settings().clone();
    let spec = Arc::new(spec);
    let marker = Arc::new(lock.path().to_path_buf());

    // `Child::wait` closes a stdin still attached to the child, so the
    // quit channel has to be held here for the encoder's whole life.
    let mut stdin = child.stdin.take();

    let stderr = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(drain_stderr(source_key.clone(), pipe)));

    let mut refresh = tokio::time::interval(settings.manifest_refresh);
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut progress = OutputProgress::new(Instant::now());

    let event = loop {
        tokio::select! {
            status = child.wait() => break Event::Exited(status),
            _ = cancel.cancelled() => break Event::StopRequested,
            _ = refresh.tick() => {
                let newest = refresh_output(spec.clone(), marker.clone()).await;
                if let Some(limit) = settings.stall_timeout {
                    let idle = progress.observe(newest, Instant::now());
                    if idle >= limit {
                        break Event::Stalled(idle);
                    }
                }
            }
        }
    };

    let outcome = match event {
        Event::Exited(Ok(status)) => ExitOutcome::Exited(status),
        Event::Exited(Err(e)) => {
            error!(source_key = %source_key, error = %e, "failed to wait on encoder");
            kill(&mut child, &source_key).await;
            ExitOutcome::WaitFailed(e.to_string())
        }
        Event::StopRequested => {
            terminate(&mut child, stdin.take(), settings.stop_grace, &source_key).await;
            ExitOutcome::Requested
        }
        Event::Stalled(idle) => {
            warn!(
                source_key = %source_key,
                idle_secs = idle.as_secs(),
                "encoder output stalled, killing encoder"
            );
            kill(&mut child, &source_key).await;
            ExitOutcome::Stalled(idle)
        }
    };
    drop(stdin);

    let stderr_tail = match stderr {
        Some(handle) => timeout(STDERR_DRAIN_TIMEOUT, handle)
            .await
            .ok()
            .and_then(Result::ok)
            .flatten(),
        None => None,
    };

    // Segments written just before exit still belong in the manifest
    let final_spec = spec.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || refresh_manifest(&final_spec)).await {
        warn!(source_key = %source_key, error = %e, "final manifest refresh failed");
    }

    manager
        .finish(&source_key, &job_id, lock, outcome, stderr_tail)
        .await;
}

/// One refresh tick, off the async workers: publish the manifest, touch
/// the lock marker and return the newest segment time.
async fn refresh_output(spec: Arc<EncodeSpec>, marker: Arc<PathBuf>) -> Option<SystemTime> {
    tokio::task::spawn_blocking(move || {
        refresh_manifest(&spec);
        if let Err(e) = lock::touch_marker(&marker) {
            debug!(source_key = %spec.source_key, error = %e, "failed to touch lock marker");
        }
        newest_segment_mtime(&spec.output_root)
    })
    .await
    .ok()
    .flatten()
}

/// Ask the encoder to quit, then kill it once the grace period runs out.
///
/// The encoder's native quit command is a `q` on stdin.
async fn terminate(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    grace: Duration,
    source_key: &str,
) {
    match stdin {
        Some(mut stdin) => {
            // A write error means the encoder is already gone
            if let Err(e) = stdin.write_all(b"q\n").await {
                debug!(source_key, error = %e, "could not send quit request");
            }
            let _ = stdin.shutdown().await;
        }
        None => warn!(source_key, "encoder has no stdin, cannot ask it to quit"),
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(source_key, %status, "encoder exited after quit request");
        }
        Ok(Err(e)) => {
            warn!(source_key, error = %e, "wait failed after quit request");
            kill(child, source_key).await;
        }
        Err(_) => {
            warn!(
                source_key,
                grace_secs = grace.as_secs(),
                "encoder ignored quit request, killing"
            );
            kill(child, source_key).await;
        }
    }
}

async fn kill(child: &mut Child, source_key: &str) {
    if let Err(e) = child.kill().await {
        error!(source_key, error = %e, "failed to kill encoder");
    }
}

/// Forward encoder stderr to the log and keep the last non-empty line
async fn drain_stderr(source_key: String, pipe: ChildStderr) -> Option<String> {
    let mut lines = BufReader::new(pipe).lines();
    let mut last = None;
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        warn!(source_key = %source_key, "encoder: {}", line);
        last = Some(line.to_string());
    }
    last
}

fn refresh_manifest(spec: &EncodeSpec) {
    match manifest::publish(spec) {
        Ok(PublishOutcome::Written(variants)) => {
            info!(source_key = %spec.source_key, variants, "master playlist updated");
        }
        Ok(_) => {}
        Err(e) => {
            warn!(source_key = %spec.source_key, error = %e, "failed to publish master playlist");
        }
    }
}

/// Tracks when the encoder last produced a new segment. Supervision start
/// counts as progress.
#[derive(Debug)]
struct OutputProgress {
    newest: Option<SystemTime>,
    last_advance: Instant,
}

impl OutputProgress {
    fn new(now: Instant) -> Self {
        Self {
            newest: None,
            last_advance: now,
        }
    }

    /// Record the newest segment time seen and return how long output has
    /// been idle
    fn observe(&mut self, newest: Option<SystemTime>, now: Instant) -> Duration {
        if newest > self.newest {
            debug!(?newest, "encoder output advanced");
            self.newest = newest;
            self.last_advance = now;
        }
        now.saturating_duration_since(self.last_advance)
    }
}

/// Modification time of the newest segment in any rendition directory
fn newest_segment_mtime(output_root: &Path) -> Option<SystemTime> {
    WalkDir::new(output_root)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("ts"))
        .filter_map(|entry| entry.metadata().ok()?.modified().ok())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::process::ExitStatusExt;
    use tempfile::TempDir;

    fn exit_code(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    #[test]
    fn test_requested_stop_is_never_a_failure() {
        assert_eq!(ExitOutcome::Requested.failure(false, None), None);
        assert_eq!(ExitOutcome::Exited(exit_code(255)).failure(true, Some("x")), None);
        assert_eq!(
            ExitOutcome::Stalled(Duration::from_secs(30)).failure(true, None),
            None
        );
    }

    #[test]
    fn test_clean_unrequested_exit_is_a_stop() {
        assert_eq!(ExitOutcome::Exited(exit_code(0)).failure(false, None), None);
    }

    #[test]
    fn test_crash_records_status_and_stderr() {
        let reason = ExitOutcome::Exited(exit_code(1))
            .failure(false, Some("Connection refused"))
            .unwrap();
        assert!(reason.starts_with("encoder exited with"));
        assert!(reason.ends_with(": Connection refused"));

        // Killed by SIGKILL
        let reason = ExitOutcome::Exited(ExitStatus::from_raw(9))
            .failure(false, None)
            .unwrap();
        assert!(reason.contains("signal"));
    }

    #[test]
    fn test_stall_reason() {
        let reason = ExitOutcome::Stalled(Duration::from_secs(31))
            .failure(false, None)
            .unwrap();
        assert_eq!(reason, "encoder output stalled for 31s");
    }

    #[test]
    fn test_output_progress_resets_on_new_segment() {
        let start = Instant::now();
        let mut progress = OutputProgress::new(start);
        let t0 = SystemTime::now();

        assert_eq!(progress.observe(None, start + Duration::from_secs(5)), Duration::from_secs(5));
        assert_eq!(
            progress.observe(Some(t0), start + Duration::from_secs(6)),
            Duration::ZERO
        );
        // Same newest segment: idle time grows
        assert_eq!(
            progress.observe(Some(t0), start + Duration::from_secs(9)),
            Duration::from_secs(3)
        );
        let t1 = t0 + Duration::from_secs(2);
        assert_eq!(
            progress.observe(Some(t1), start + Duration::from_secs(10)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_newest_segment_mtime_scans_rendition_dirs() {
        let dir = TempDir::new().unwrap();
        assert_eq!(newest_segment_mtime(dir.path()), None);

        let r720 = dir.path().join("720p");
        fs::create_dir_all(&r720).unwrap();
        fs::write(r720.join("playlist.m3u8"), b"#EXTM3U\n").unwrap();
        assert_eq!(newest_segment_mtime(dir.path()), None);

        fs::write(r720.join("segment00000.ts"), b"ts").unwrap();
        let expected = fs::metadata(r720.join("segment00000.ts"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(newest_segment_mtime(dir.path()), Some(expected));
    }

    fn spawn_sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_terminate_sends_quit_after_waiting() {
        let dir = TempDir::new().unwrap();
        let received = dir.path().join("received");
        let script = format!(
            "while read l; do echo \"$l\" > '{}'; [ \"$l\" = q ] && exit 0; done; exec sleep 30",
            received.display()
        );
        let mut child = spawn_sh(&script);
        let stdin = child.stdin.take();

        // Waiting first must not cut the quit channel
        assert!(timeout(Duration::from_millis(200), child.wait()).await.is_err());

        let started = Instant::now();
        terminate(&mut child, stdin, Duration::from_secs(5), "alpha").await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(fs::read_to_string(&received).unwrap().trim(), "q");
        assert!(child.try_wait().unwrap().unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_kills_after_grace() {
        let mut child = spawn_sh("trap '' INT; exec sleep 30");
        let stdin = child.stdin.take();

        let started = Instant::now();
        terminate(&mut child, stdin, Duration::from_millis(200), "alpha").await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_tick_runs_off_the_async_workers() {
        let dir = TempDir::new().unwrap();
        let mut settings = crate::encode::EncodeSettings::from_config(&crate::Config::default());
        settings.output_base = dir.path().join("hls");
        let spec = Arc::new(
            crate::encode::build_encode_spec("alpha", &crate::config::default_ladder(), &settings)
                .unwrap(),
        );
        let first = &spec.renditions[0].output_dir;
        fs::create_dir_all(first).unwrap();
        fs::write(first.join("segment00000.ts"), b"ts").unwrap();
        fs::write(
            first.join("playlist.m3u8"),
            "#EXTM3U\n#EXT-X-TARGETDURATION:2\n#EXTINF:2.0,\nsegment00000.ts\n",
        )
        .unwrap();
        let marker = Arc::new(dir.path().join("alpha.lock"));
        fs::write(marker.as_path(), b"{}").unwrap();
        let old = SystemTime::now() - Duration::from_secs(3600);
        fs::OpenOptions::new()
            .write(true)
            .open(marker.as_path())
            .unwrap()
            .set_modified(old)
            .unwrap();

        let newest = refresh_output(spec.clone(), marker.clone()).await;

        assert!(newest.is_some());
        assert!(spec.output_root.join(manifest::MASTER_PLAYLIST).is_file());
        let touched = fs::metadata(marker.as_path()).unwrap().modified().unwrap();
        assert!(touched > old + Duration::from_secs(60));
    }

    #[test]
    fn test_missing_output_root_has_no_segments() {
        let dir = TempDir::new().unwrap();
        assert_eq!(newest_segment_mtime(&dir.path().join("absent")), None);
    }
}
