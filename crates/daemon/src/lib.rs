//! ABR Orchestrator
//!
//! Turns live ingest streams into multi-rendition HLS output: one encoder
//! per source, guarded by a per-stream lock, supervised until exit, with a
//! master playlist kept in step with the renditions on disk.

pub mod api_server;
pub mod daemon;
pub mod encode;
pub mod ingest;
pub mod job_manager;
pub mod jobs;
pub mod lock;
pub mod manifest;
pub mod metrics;
mod monitor;
pub mod reconciler;
pub mod startup;

#[cfg(test)]
mod testing;

pub use abr_orchestrator_config as config;
pub use abr_orchestrator_config::Config;
pub use api_server::{create_api_router, run_api_server, AppState, ServerError};
pub use daemon::{Daemon, DaemonError};
pub use encode::{
    build_encode_spec, build_ffmpeg_args, build_ffmpeg_command, EncodeSettings, EncodeSpec,
    EncoderLauncher, FfmpegLauncher, LadderError, RenditionSpec,
};
pub use ingest::{parse_published, NginxRtmpStatus, PollError, SourceStatus};
pub use job_manager::{JobManager, JobManagerSettings};
pub use jobs::{
    is_valid_source_key, JobInfo, JobState, StartError, StartOutcome, StopError, StopOutcome,
};
pub use lock::{LockError, LockHandle, LockRecord, StreamLocks};
pub use manifest::{publish, regenerate, ManifestDocument, PublishOutcome, VariantEntry};
pub use metrics::{
    build_snapshot, collect_system_metrics, new_shared_metrics, Counters, JobMetrics,
    MetricsSnapshot, SharedMetrics, SystemMetrics,
};
pub use reconciler::{diff, ConvergeReport, Plan, Reconciler, ReconcilerPhase};
pub use startup::{parse_ffmpeg_version, run_startup_checks, StartupError, StartupReport};
