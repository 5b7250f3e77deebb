//! Test fixtures shared by the job manager, reconciler and API tests.

use crate::config::{default_ladder, Config};
use crate::encode::{EncodeSettings, EncodeSpec, EncoderLauncher};
use crate::job_manager::{JobManager, JobManagerSettings};
use crate::lock::StreamLocks;
use crate::metrics::Counters;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};

type Script = Box<dyn Fn(&EncodeSpec) -> String + Send + Sync>;

/// Runs a shell script in place of the encoder
pub struct ScriptLauncher {
    script: Script,
    launches: AtomicUsize,
}

impl ScriptLauncher {
    pub fn new(script: impl Fn(&EncodeSpec) -> String + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            launches: AtomicUsize::new(0),
        })
    }

    /// Stand-in that waits for a quit request like the real encoder does
    pub fn quits_on_request() -> Arc<Self> {
        Self::new(|_| QUITS_ON_REQUEST.to_string())
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl EncoderLauncher for ScriptLauncher {
    fn launch(&self, spec: &EncodeSpec) -> io::Result<Child> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        Command::new("sh")
            .arg("-c")
            .arg((self.script)(spec))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Launcher whose encoder binary is missing
pub struct FailingLauncher;

impl EncoderLauncher for FailingLauncher {
    fn launch(&self, _spec: &EncodeSpec) -> io::Result<Child> {
        Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg: not found"))
    }
}

/// Exits cleanly only when it reads the encoder's quit command; closing
/// stdin alone leaves it running until the grace-period kill
pub const QUITS_ON_REQUEST: &str =
    "while read line; do [ \"$line\" = q ] && exit 0; done; exec sleep 30";

/// Writes one segment and playlist for the highest rendition, then waits
/// for a quit request
pub fn writes_first_segment(spec: &EncodeSpec) -> String {
    let dir = spec.renditions[0].output_dir.display();
    format!(
        "printf 'payload' > {dir}/segment00000.ts; \
         printf '#EXTM3U\\n#EXT-X-TARGETDURATION:2\\n#EXTINF:2.0,\\nsegment00000.ts\\n' > {dir}/playlist.m3u8; \
         {QUITS_ON_REQUEST}"
    )
}

pub struct Fixture {
    pub dir: TempDir,
    pub manager: JobManager,
}

fn settings(root: &Path) -> JobManagerSettings {
    let mut encode = EncodeSettings::from_config(&Config::default());
    encode.output_base = root.join("hls");
    JobManagerSettings {
        encode,
        ladder: default_ladder(),
        stop_grace: Duration::from_secs(1),
        stall_timeout: None,
        manifest_refresh: Duration::from_millis(50),
        failed_retention: Duration::from_secs(60),
    }
}

pub fn fixture_with(
    launcher: Arc<dyn EncoderLauncher>,
    tweak: impl FnOnce(&mut JobManagerSettings),
) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(dir.path());
    tweak(&mut settings);
    let manager = JobManager::new(
        settings,
        StreamLocks::new(dir.path().join("locks")),
        launcher,
        Arc::new(Counters::default()),
    );
    Fixture { dir, manager }
}

pub fn fixture(launcher: Arc<dyn EncoderLauncher>) -> Fixture {
    fixture_with(launcher, |_| {})
}

/// Poll `cond` until it holds; panics after ten seconds
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
