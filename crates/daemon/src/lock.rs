//! Stream lock module: one advisory marker file per source key.
//!
//! A marker is created with exclusive-create semantics and records who owns
//! it. Owners that no longer exist leave stale markers behind, which any
//! later acquirer detects and reclaims. Removing a stale marker happens under
//! a per-key reclaim guard (itself an exclusive-create file), so two parties
//! that both judged the same marker stale cannot delete each other's fresh
//! marker.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessesToUpdate, System};
use thiserror::Error;
use tracing::{debug, warn};

/// Markers younger than this are never reclaimed on a parse failure.
const FRESH_MARKER_AGE: Duration = Duration::from_secs(2);

/// A marker from another host whose owner has not touched it for this long
/// is abandoned. Owners touch their markers every manifest refresh.
pub const FOREIGN_MARKER_TTL: Duration = Duration::from_secs(30);

/// A reclaim guard older than this was left by a reclaimer that died.
const RECLAIM_GUARD_TTL: Duration = Duration::from_secs(10);

/// Errors returned by lock operations
#[derive(Debug, Error)]
pub enum LockError {
    /// A live owner holds the marker
    #[error("stream '{source_key}' is locked by PID {owner_pid}")]
    AlreadyLocked { source_key: String, owner_pid: u32 },

    #[error("lock marker IO error: {0}")]
    Io(#[from] io::Error),
}

/// Contents of a lock marker on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub source_key: String,
    /// Orchestrator process that created the marker
    pub owner_pid: u32,
    /// Encoder spawned under this lock, once known
    #[serde(default)]
    pub encoder_pid: Option<u32>,
    pub hostname: String,
    pub created_at_ms: u64,
}

impl LockRecord {
    fn current(source_key: &str) -> Self {
        Self {
            source_key: source_key.to_string(),
            owner_pid: std::process::id(),
            encoder_pid: None,
            hostname: hostname().to_string(),
            created_at_ms: now_ms(),
        }
    }

    /// Whether the owner or its encoder is still running.
    ///
    /// PIDs from another host cannot be checked there; such a marker stays
    /// live only while its owner keeps touching it, judged by
    /// `last_touched` (the marker's modification time).
    pub fn is_live(&self, last_touched: SystemTime) -> bool {
        if self.hostname != hostname() {
            return last_touched
                .elapsed()
                .map_or(true, |age| age < FOREIGN_MARKER_TTL);
        }
        is_pid_alive(self.owner_pid) || self.encoder_pid.is_some_and(is_pid_alive)
    }

    /// The PID reported to callers that lose the race for this lock
    pub fn holder_pid(&self) -> u32 {
        self.encoder_pid.unwrap_or(self.owner_pid)
    }
}

/// Proof of lock ownership. Release is explicit; the Health Monitor is the
/// only component that releases a lock for a running job.
#[derive(Debug)]
pub struct LockHandle {
    source_key: String,
    path: PathBuf,
}

impl LockHandle {
    pub fn source_key(&self) -> &str {
        &self.source_key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the spawned encoder's PID in the marker.
    ///
    /// The marker is rewritten through a temporary file so readers never
    /// observe a half-written record.
    pub fn record_encoder_pid(&self, pid: u32) -> io::Result<()> {
        let mut record = read_record(&self.path)?;
        record.encoder_pid = Some(pid);
        let tmp = self.path.with_extension("lock.tmp");
        fs::write(&tmp, encode_record(&record)?)?;
        fs::rename(&tmp, &self.path)
    }

    /// Heartbeat: refresh the marker's modification time
    pub fn touch(&self) -> io::Result<()> {
        touch_marker(&self.path)
    }
}

/// Set a marker's modification time to now
pub fn touch_marker(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

/// What a marker on disk says about its lock
#[derive(Debug)]
enum MarkerState {
    Missing,
    Live { holder_pid: u32 },
    Stale(Option<LockRecord>),
}

/// Result of one reclaim attempt
#[derive(Debug, PartialEq, Eq)]
enum Reclaim {
    /// A stale marker was removed
    Removed,
    /// There was nothing to remove
    Missing,
    /// A live owner, or another reclaimer, holds the key
    Held { holder_pid: u32 },
}

/// Exclusive right to remove a marker, released on drop
struct ReclaimGuard {
    path: PathBuf,
}

impl ReclaimGuard {
    fn try_acquire(path: PathBuf) -> io::Result<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(Some(Self { path })),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if !is_younger_than(&path, RECLAIM_GUARD_TTL) {
                    warn!(path = %path.display(), "removing abandoned reclaim guard");
                    remove_marker(&path)?;
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for ReclaimGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// File-backed lock table rooted at a directory.
#[derive(Debug, Clone)]
pub struct StreamLocks {
    dir: PathBuf,
}

impl StreamLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Marker path for a source key: `{dir}/{source_key}.lock`
    pub fn marker_path(&self, source_key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", source_key))
    }

    fn reclaim_guard_path(&self, source_key: &str) -> PathBuf {
        self.dir.join(format!("{}.lock.reclaim", source_key))
    }

    /// Acquire the lock for `source_key`.
    ///
    /// Creation is a single exclusive-create; if a marker exists and its
    /// owner is dead it is removed and creation is retried exactly once.
    pub fn acquire(&self, source_key: &str) -> Result<LockHandle, LockError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.marker_path(source_key);

        match create_marker(&path, source_key) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Reclaim::Held { holder_pid } = self.reclaim(source_key, &path)? {
                    return Err(LockError::AlreadyLocked {
                        source_key: source_key.to_string(),
                        owner_pid: holder_pid,
                    });
                }
                match create_marker(&path, source_key) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        // Someone else won the retry
                        let owner_pid = read_record(&path).map(|r| r.holder_pid()).unwrap_or(0);
                        return Err(LockError::AlreadyLocked {
                            source_key: source_key.to_string(),
                            owner_pid,
                        });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        debug!(source_key, path = %path.display(), "stream lock acquired");
        Ok(LockHandle {
            source_key: source_key.to_string(),
            path,
        })
    }

    /// Delete the marker unconditionally. Missing markers are not an error.
    pub fn release(&self, handle: LockHandle) -> io::Result<()> {
        remove_marker(&handle.path)?;
        debug!(source_key = %handle.source_key, "stream lock released");
        Ok(())
    }

    /// Whether a marker currently exists for `source_key`
    pub fn is_locked(&self, source_key: &str) -> bool {
        self.marker_path(source_key).exists()
    }

    /// Read the marker for `source_key`, if any
    pub fn read(&self, source_key: &str) -> io::Result<LockRecord> {
        read_record(&self.marker_path(source_key))
    }

    /// Remove every stale marker in the lock directory.
    ///
    /// Returns the number of markers removed.
    pub fn sweep_stale(&self) -> io::Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let Some(source_key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.reclaim(source_key, &path)? == Reclaim::Removed {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Remove the marker at `path` if it is stale.
    ///
    /// The marker is judged again while holding the reclaim guard: any
    /// other removal of a stale marker also needs the guard, so the marker
    /// judged here is the one removed.
    fn reclaim(&self, source_key: &str, path: &Path) -> io::Result<Reclaim> {
        let Some(_guard) = ReclaimGuard::try_acquire(self.reclaim_guard_path(source_key))? else {
            return Ok(Reclaim::Held { holder_pid: 0 });
        };

        match marker_state(path)? {
            MarkerState::Missing => Ok(Reclaim::Missing),
            MarkerState::Live { holder_pid } => Ok(Reclaim::Held { holder_pid }),
            MarkerState::Stale(record) => {
                match &record {
                    Some(record) => warn!(
                        source_key,
                        owner_pid = record.owner_pid,
                        encoder_pid = ?record.encoder_pid,
                        hostname = %record.hostname,
                        "reclaiming stale stream lock"
                    ),
                    None => warn!(source_key, "reclaiming unreadable stream lock"),
                }
                remove_marker(path)?;
                Ok(Reclaim::Removed)
            }
        }
    }
}

fn marker_state(path: &Path) -> io::Result<MarkerState> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(MarkerState::Missing),
        Err(e) => return Err(e),
    };
    let modified = file.metadata()?.modified()?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    Ok(match serde_json::from_slice::<LockRecord>(&contents) {
        Ok(record) if record.is_live(modified) => MarkerState::Live {
            holder_pid: record.holder_pid(),
        },
        Ok(record) => MarkerState::Stale(Some(record)),
        // A marker still being written by its creator reads as garbage
        Err(_) if modified.elapsed().map_or(true, |age| age < FRESH_MARKER_AGE) => {
            MarkerState::Live { holder_pid: 0 }
        }
        Err(_) => MarkerState::Stale(None),
    })
}

fn is_younger_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|elapsed| elapsed < age)
}

fn create_marker(path: &Path, source_key: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let record = LockRecord::current(source_key);
    let written = file
        .write_all(&encode_record(&record)?)
        .and_then(|_| file.sync_all());
    if let Err(e) = written {
        drop(file);
        let _ = fs::remove_file(path);
        return Err(e);
    }
    Ok(())
}

fn encode_record(record: &LockRecord) -> io::Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn read_record(path: &Path) -> io::Result<LockRecord> {
    let contents = fs::read(path)?;
    serde_json::from_slice(&contents).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn remove_marker(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Check whether a PID belongs to a running process on this host
pub fn is_pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]));
    sys.process(pid).is_some()
}

/// Kernel host name; unlike `$HOSTNAME` it does not depend on how the
/// process was launched
fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| System::host_name().unwrap_or_else(|| "unknown".into()))
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
