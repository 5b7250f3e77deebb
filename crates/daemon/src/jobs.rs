//! Job data model shared by the Job Manager, the Health Monitor and the
//! HTTP surface.

use crate::encode::{EncodeSpec, LadderError};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Longest accepted source key
pub const MAX_SOURCE_KEY_LEN: usize = 64;

/// Lifecycle state of a job.
///
/// `Idle` is never stored; a source without a job record is idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Starting => "starting",
            JobState::Running => "running",
            JobState::Stopping => "stopping",
            JobState::Stopped => "stopped",
            JobState::Failed => "failed",
        }
    }

    /// Starting or Running: the job counts towards the actual set
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Starting | JobState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Stopped | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobInfo {
    /// Unique per start; a restart of the same source gets a new id
    pub job_id: String,
    pub source_key: String,
    pub state: JobState,
    /// Encoder process id while it runs
    pub pid: Option<u32>,
    /// Unix timestamp (milliseconds) of the successful spawn
    pub started_at_ms: Option<u64>,
    pub input_url: String,
    pub output_root: PathBuf,
    /// Rendition names in ladder order
    pub renditions: Vec<String>,
    pub last_error: Option<String>,
}

impl JobInfo {
    pub(crate) fn starting(job_id: String, spec: &EncodeSpec) -> Self {
        Self {
            job_id,
            source_key: spec.source_key.clone(),
            state: JobState::Starting,
            pid: None,
            started_at_ms: None,
            input_url: spec.input_url.clone(),
            output_root: spec.output_root.clone(),
            renditions: spec.renditions.iter().map(|r| r.name.clone()).collect(),
            last_error: None,
        }
    }

    pub(crate) fn mark_running(&mut self, pid: Option<u32>) {
        self.state = JobState::Running;
        self.pid = pid;
        self.started_at_ms = Some(now_ms());
        self.last_error = None;
    }

    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = JobState::Failed;
        self.pid = None;
        self.last_error = Some(reason.into());
    }

    /// Relative path of the top-level manifest under the output base
    pub fn master_playlist(&self) -> String {
        format!("{}/{}", self.source_key, crate::manifest::MASTER_PLAYLIST)
    }
}

/// Successful result of a Start call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new encoder was launched
    Started(JobInfo),
    /// This process already runs a job for the source; nothing was spawned
    AlreadyRunning(JobInfo),
}

impl StartOutcome {
    pub fn info(&self) -> &JobInfo {
        match self {
            StartOutcome::Started(info) | StartOutcome::AlreadyRunning(info) => info,
        }
    }

    pub fn into_info(self) -> JobInfo {
        match self {
            StartOutcome::Started(info) | StartOutcome::AlreadyRunning(info) => info,
        }
    }

    pub fn already_running(&self) -> bool {
        matches!(self, StartOutcome::AlreadyRunning(_))
    }
}

/// Successful result of a Stop call. Termination completes asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Termination was requested
    Stopping,
    /// An earlier Stop is still in progress
    AlreadyStopping,
    /// No active job for the source
    NotRunning,
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopOutcome::Stopping => "stopping",
            StopOutcome::AlreadyStopping => "already_stopping",
            StopOutcome::NotRunning => "not_running",
        }
    }
}

/// Errors surfaced by Start
#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid source key '{0}'")]
    InvalidSourceKey(String),

    /// The stream lock is held by another live process
    #[error("stream '{source_key}' is already being transcoded by PID {owner_pid}")]
    AlreadyRunning { source_key: String, owner_pid: u32 },

    #[error("stream '{0}' is still stopping")]
    Stopping(String),

    #[error(transparent)]
    InvalidProfile(#[from] LadderError),

    #[error("stream lock error: {0}")]
    Lock(io::Error),

    #[error("failed to prepare output directory {path}: {source}")]
    OutputDir { path: PathBuf, source: io::Error },

    #[error("failed to launch encoder: {0}")]
    SpawnFailure(io::Error),

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl StartError {
    /// Machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            StartError::InvalidSourceKey(_) => "invalid_source_key",
            StartError::AlreadyRunning { .. } => "already_running",
            StartError::Stopping(_) => "stopping",
            StartError::InvalidProfile(_) => "invalid_profile",
            StartError::Lock(_) => "lock_error",
            StartError::OutputDir { .. } => "output_error",
            StartError::SpawnFailure(_) => "spawn_failure",
            StartError::ShuttingDown => "shutting_down",
        }
    }
}

/// Errors surfaced by Stop
#[derive(Debug, Error)]
pub enum StopError {
    #[error("invalid source key '{0}'")]
    InvalidSourceKey(String),
}

impl StopError {
    pub fn kind(&self) -> &'static str {
        match self {
            StopError::InvalidSourceKey(_) => "invalid_source_key",
        }
    }
}

/// Source keys become path components, so only `[A-Za-z0-9_-]` is accepted.
pub fn is_valid_source_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_SOURCE_KEY_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
